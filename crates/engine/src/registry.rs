//! Extension registry.
//!
//! Holds every registered extension keyed by URN, in registration order.
//! Subscriptions are checked at registration so a built listener map can
//! never contain invalid wiring.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::event::EventKind;
use crate::extension::Extension;

/// Reasons an extension cannot be registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("extension URN '{urn}' must start with 'urn:' and contain no whitespace")]
    InvalidUrn { urn: String },

    #[error("extension '{urn}' subscribes to {event} more than once")]
    DuplicateSubscription { urn: String, event: EventKind },
}

/// Every registered extension, in registration order.
#[derive(Default, Clone)]
pub struct ExtensionRegistry {
    extensions: Vec<Arc<dyn Extension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `extension`.
    ///
    /// Re-registering a URN replaces the earlier instance in place, keeping
    /// its position in registration order.
    pub fn register(&mut self, extension: Arc<dyn Extension>) -> Result<(), RegistrationError> {
        validate(extension.as_ref())?;
        let urn = extension.urn().to_owned();
        match self.extensions.iter().position(|ext| ext.urn() == urn) {
            Some(index) => {
                tracing::info!(extension = %urn, "replacing registered extension");
                self.extensions[index] = extension;
            }
            None => {
                tracing::debug!(extension = %urn, "registered extension");
                self.extensions.push(extension);
            }
        }
        Ok(())
    }

    /// Builder-style [`ExtensionRegistry::register`].
    pub fn with(mut self, extension: Arc<dyn Extension>) -> Result<Self, RegistrationError> {
        self.register(extension)?;
        Ok(self)
    }

    pub fn get(&self, urn: &str) -> Option<&Arc<dyn Extension>> {
        self.extensions.iter().find(|ext| ext.urn() == urn)
    }

    pub fn contains(&self, urn: &str) -> bool {
        self.get(urn).is_some()
    }

    /// Registered extensions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Extension>> {
        self.extensions.iter()
    }

    pub fn urns(&self) -> Vec<&str> {
        self.extensions.iter().map(|ext| ext.urn()).collect()
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.urns()).finish()
    }
}

fn validate(extension: &dyn Extension) -> Result<(), RegistrationError> {
    let urn = extension.urn();
    if !urn.starts_with("urn:") || urn.len() <= 4 || urn.chars().any(char::is_whitespace) {
        return Err(RegistrationError::InvalidUrn { urn: urn.to_owned() });
    }
    let mut seen = HashSet::new();
    for subscription in extension.subscriptions() {
        if !seen.insert(subscription.event) {
            return Err(RegistrationError::DuplicateSubscription {
                urn: urn.to_owned(),
                event: subscription.event,
            });
        }
    }
    Ok(())
}
