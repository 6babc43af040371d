//! Persistence contract for long-running (async) operations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::envelope::ErrorObject;
use crate::errors::ForrstError;
use crate::identifiers::{CallerId, Cursor, OperationId};
use crate::types::Timestamp;

/// Upper bound on the page size of [`OperationRepository::list`].
pub const MAX_PAGE_SIZE: usize = 100;

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    /// Whether the operation can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A long-running operation started by a function call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub status: OperationStatus,
    /// Completion ratio in `[0.0, 1.0]`, when the function reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ErrorObject>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Operation {
    /// A freshly created, pending operation for `function`.
    pub fn pending(function: impl Into<String>, version: Option<String>) -> Self {
        let now = Timestamp::now();
        Self {
            id: OperationId::new_random(),
            function: function.into(),
            version,
            status: OperationStatus::Pending,
            progress: None,
            result: None,
            errors: None,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the operation to `status`, stamping `updated_at`.
    pub fn transition(&mut self, status: OperationStatus) {
        self.status = status;
        self.updated_at = Timestamp::now();
    }
}

/// Filters for [`OperationRepository::list`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationQuery {
    pub status: Option<OperationStatus>,
    pub function: Option<String>,
    /// Requested page size; clamped to `1..=MAX_PAGE_SIZE`.
    pub limit: usize,
    pub cursor: Option<Cursor>,
}

impl OperationQuery {
    /// The page size actually served.
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }
}

/// One page of [`OperationRepository::list`] results.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationPage {
    pub operations: Vec<Operation>,
    /// Present when more results remain.
    pub next_cursor: Option<Cursor>,
}

/// Stores operations, optionally scoped to the caller that owns them.
#[async_trait]
pub trait OperationRepository: Send + Sync {
    async fn find(
        &self,
        id: OperationId,
        caller: Option<&CallerId>,
    ) -> Result<Option<Operation>, ForrstError>;

    async fn save(&self, operation: Operation, caller: Option<&CallerId>) -> Result<(), ForrstError>;

    async fn delete(&self, id: OperationId, caller: Option<&CallerId>) -> Result<(), ForrstError>;

    async fn list(
        &self,
        query: &OperationQuery,
        caller: Option<&CallerId>,
    ) -> Result<OperationPage, ForrstError>;
}
