//! Per-request state shared by the extensions of one lifecycle.
//!
//! Extension instances are shared by every concurrent request, so anything an
//! extension learns in one stage and needs in a later one (a held lock, a
//! computed deadline) lives here, keyed by the extension's URN.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;

use crate::event::EventKind;

/// Cleanup that must run when the request leaves the handler, whatever the
/// exit path.
#[async_trait]
pub trait Finalizer: Send + Sync {
    /// Short label used in logs.
    fn describe(&self) -> String;

    async fn finalize(self: Box<Self>);
}

/// Typed, URN-keyed context plus pending finalizers for one request.
#[derive(Default)]
pub struct RequestState {
    entries: HashMap<String, Box<dyn Any + Send + Sync>>,
    visited: HashSet<(String, EventKind)>,
    finalizers: Vec<Box<dyn Finalizer>>,
}

impl RequestState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` as the context of the extension `urn`, replacing any
    /// previous context.
    pub fn insert<T: Any + Send + Sync>(&mut self, urn: &str, value: T) {
        self.entries.insert(urn.to_owned(), Box::new(value));
    }

    /// Borrows the context of `urn` if it exists and has type `T`.
    pub fn get<T: Any + Send + Sync>(&self, urn: &str) -> Option<&T> {
        self.entries.get(urn).and_then(|entry| entry.downcast_ref())
    }

    /// Removes and returns the context of `urn` if it has type `T`. A context
    /// of another type is left in place.
    pub fn remove<T: Any + Send + Sync>(&mut self, urn: &str) -> Option<T> {
        self.get::<T>(urn)?;
        self.entries
            .remove(urn)
            .and_then(|entry| entry.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    pub fn contains(&self, urn: &str) -> bool {
        self.entries.contains_key(urn)
    }

    /// Records that `urn` handled a `kind` event. Returns `false` when it
    /// already had in this request.
    pub fn first_visit(&mut self, urn: &str, kind: EventKind) -> bool {
        self.visited.insert((urn.to_owned(), kind))
    }

    /// Registers cleanup to run when the request completes.
    pub fn defer(&mut self, finalizer: impl Finalizer + 'static) {
        self.finalizers.push(Box::new(finalizer));
    }

    pub fn pending_finalizers(&self) -> usize {
        self.finalizers.len()
    }

    /// Runs every pending finalizer, most recently registered first.
    pub async fn finalize(&mut self) {
        while let Some(finalizer) = self.finalizers.pop() {
            tracing::trace!(finalizer = %finalizer.describe(), "running request finalizer");
            finalizer.finalize().await;
        }
    }
}

impl fmt::Debug for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestState")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .field("visited", &self.visited.len())
            .field("finalizers", &self.finalizers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, PartialEq)]
    struct Marker(u32);

    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Finalizer for Record {
        fn describe(&self) -> String {
            self.name.to_owned()
        }

        async fn finalize(self: Box<Self>) {
            self.log.lock().push(self.name);
        }
    }

    #[test]
    fn typed_entries_are_scoped_by_urn_and_type() {
        let mut state = RequestState::new();
        state.insert("urn:a", Marker(1));
        state.insert("urn:b", "text".to_string());

        assert_eq!(state.get::<Marker>("urn:a"), Some(&Marker(1)));
        assert_eq!(state.get::<Marker>("urn:b"), None);
        assert_eq!(state.remove::<Marker>("urn:b"), None);
        assert!(state.contains("urn:b"), "mistyped removal keeps the entry");
        assert_eq!(state.remove::<Marker>("urn:a"), Some(Marker(1)));
        assert!(!state.contains("urn:a"));
    }

    #[test]
    fn visits_are_tracked_per_urn_and_event() {
        let mut state = RequestState::new();

        assert!(state.first_visit("urn:a", EventKind::ExecutingFunction));
        assert!(!state.first_visit("urn:a", EventKind::ExecutingFunction));
        assert!(state.first_visit("urn:a", EventKind::FunctionExecuted));
        assert!(state.first_visit("urn:b", EventKind::ExecutingFunction));
        assert!(!state.contains("urn:a"), "visits are not context entries");
    }

    #[tokio::test]
    async fn finalizers_run_once_in_reverse_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut state = RequestState::new();
        state.defer(Record { name: "first", log: log.clone() });
        state.defer(Record { name: "second", log: log.clone() });
        assert_eq!(state.pending_finalizers(), 2);

        state.finalize().await;
        state.finalize().await;

        assert_eq!(*log.lock(), ["second", "first"]);
        assert_eq!(state.pending_finalizers(), 0);
    }
}
