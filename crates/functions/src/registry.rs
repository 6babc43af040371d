//! Function registration and version resolution.
//!
//! Functions are registered under `(urn, semver)`. A request without a version
//! resolves to the highest registered version; an unknown version is
//! `VERSION_NOT_FOUND`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use protocol::{ErrorCode, ForrstError, Function, FunctionOutput, FunctionResolver, RequestObject};
use semver::Version;
use serde::Serialize;
use thiserror::Error;

use crate::system;

/// Reasons a function cannot be registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("function URN '{urn}' must start with 'urn:' and contain no whitespace")]
    InvalidUrn { urn: String },

    #[error("function '{urn}' has an invalid semantic version '{version}'")]
    InvalidVersion { urn: String, version: String },

    #[error("function '{urn}' version {version} is already registered")]
    Duplicate { urn: String, version: String },
}

/// Discovery metadata of one function version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionDescriptor {
    pub urn: String,
    pub version: Version,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub summary: String,
}

impl FunctionDescriptor {
    pub fn new(urn: impl Into<String>, version: &str) -> Result<Self, RegistryError> {
        let urn = urn.into();
        if !urn.starts_with("urn:") || urn.len() <= 4 || urn.chars().any(char::is_whitespace) {
            return Err(RegistryError::InvalidUrn { urn });
        }
        let version = Version::parse(version).map_err(|_| RegistryError::InvalidVersion {
            urn: urn.clone(),
            version: version.to_owned(),
        })?;
        Ok(Self {
            urn,
            version,
            summary: String::new(),
        })
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }
}

/// Adapts a synchronous closure into a [`Function`].
pub struct FnFunction<F>(F);

#[async_trait]
impl<F> Function for FnFunction<F>
where
    F: Fn(&RequestObject) -> Result<FunctionOutput, ForrstError> + Send + Sync,
{
    async fn call(&self, request: &RequestObject) -> Result<FunctionOutput, ForrstError> {
        (self.0)(request)
    }
}

/// Wraps `f` as a shareable [`Function`].
pub fn function_fn<F>(f: F) -> Arc<dyn Function>
where
    F: Fn(&RequestObject) -> Result<FunctionOutput, ForrstError> + Send + Sync + 'static,
{
    Arc::new(FnFunction(f))
}

struct Registered {
    descriptor: FunctionDescriptor,
    function: Arc<dyn Function>,
}

/// Builds a [`FunctionRegistry`].
#[derive(Default)]
pub struct FunctionRegistryBuilder {
    functions: BTreeMap<String, BTreeMap<Version, Registered>>,
    system_functions: bool,
}

impl FunctionRegistryBuilder {
    /// Registers one function version.
    pub fn register(
        mut self,
        descriptor: FunctionDescriptor,
        function: Arc<dyn Function>,
    ) -> Result<Self, RegistryError> {
        let versions = self.functions.entry(descriptor.urn.clone()).or_default();
        if versions.contains_key(&descriptor.version) {
            return Err(RegistryError::Duplicate {
                urn: descriptor.urn,
                version: descriptor.version.to_string(),
            });
        }
        tracing::debug!(function = %descriptor.urn, version = %descriptor.version, "registered function");
        versions.insert(
            descriptor.version.clone(),
            Registered {
                descriptor,
                function,
            },
        );
        Ok(self)
    }

    /// Adds the built-in `ping` and `describe` system functions.
    pub fn with_system_functions(mut self) -> Self {
        self.system_functions = true;
        self
    }

    pub fn build(self) -> Result<FunctionRegistry, RegistryError> {
        let mut builder = self;
        if builder.system_functions {
            builder = builder.register(system::ping_descriptor()?, Arc::new(system::Ping))?;
            // describe lists every function, itself included
            let describe = system::describe_descriptor()?;
            let mut listing: Vec<FunctionDescriptor> = builder
                .functions
                .values()
                .flat_map(|versions| versions.values().map(|r| r.descriptor.clone()))
                .collect();
            listing.push(describe.clone());
            listing.sort_by(|a, b| (&a.urn, &a.version).cmp(&(&b.urn, &b.version)));
            builder = builder.register(describe, Arc::new(system::Describe::new(listing)))?;
        }
        Ok(FunctionRegistry {
            functions: builder.functions,
        })
    }
}

/// Resolves function URNs to registered callables.
///
/// Without a requested version, the highest registered semantic version wins.
pub struct FunctionRegistry {
    functions: BTreeMap<String, BTreeMap<Version, Registered>>,
}

impl FunctionRegistry {
    pub fn builder() -> FunctionRegistryBuilder {
        FunctionRegistryBuilder::default()
    }

    /// Every registered descriptor, ordered by URN then version.
    pub fn descriptors(&self) -> Vec<&FunctionDescriptor> {
        self.functions
            .values()
            .flat_map(|versions| versions.values().map(|r| &r.descriptor))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.functions.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(
                self.descriptors()
                    .into_iter()
                    .map(|d| format!("{}@{}", d.urn, d.version)),
            )
            .finish()
    }
}

impl FunctionResolver for FunctionRegistry {
    fn resolve(&self, urn: &str, version: Option<&str>) -> Result<Arc<dyn Function>, ForrstError> {
        let versions = self.functions.get(urn).ok_or_else(|| {
            ForrstError::new(ErrorCode::FunctionNotFound, format!("Function '{urn}' not found"))
                .with_pointer("/call/function")
        })?;

        let registered = match version {
            None => versions.values().next_back(),
            Some(requested) => Version::parse(requested)
                .ok()
                .and_then(|requested| versions.get(&requested)),
        };

        registered
            .map(|r| Arc::clone(&r.function))
            .ok_or_else(|| {
                ForrstError::new(
                    ErrorCode::VersionNotFound,
                    format!(
                        "Version '{}' of function '{urn}' not found",
                        version.unwrap_or("latest")
                    ),
                )
                .with_pointer("/call/version")
            })
    }
}
