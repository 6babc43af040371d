//! In-process [`OperationRepository`] scoped by caller.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use protocol::{
    CallerId, Cursor, ForrstError, Operation, OperationId, OperationPage, OperationQuery,
    OperationRepository,
};

struct Record {
    operation: Operation,
    owner: Option<CallerId>,
}

impl Record {
    /// Unscoped access (`caller == None`) sees every operation; a caller sees
    /// only operations it owns.
    fn visible_to(&self, caller: Option<&CallerId>) -> bool {
        match caller {
            None => true,
            Some(caller) => self.owner.as_ref() == Some(caller),
        }
    }
}

/// In-memory [`OperationRepository`].
///
/// Pages are ordered by `created_at`, then id; the cursor is the id of the last
/// operation of the previous page.
#[derive(Default)]
pub struct MemoryOperationRepository {
    records: RwLock<HashMap<OperationId, Record>>,
}

impl MemoryOperationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl std::fmt::Debug for MemoryOperationRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryOperationRepository")
            .field("operations", &self.len())
            .finish()
    }
}

fn invalid_cursor(cursor: &Cursor) -> ForrstError {
    ForrstError::invalid_arguments("/cursor", format!("Unknown cursor '{cursor}'"))
}

#[async_trait]
impl OperationRepository for MemoryOperationRepository {
    async fn find(
        &self,
        id: OperationId,
        caller: Option<&CallerId>,
    ) -> Result<Option<Operation>, ForrstError> {
        Ok(self
            .records
            .read()
            .get(&id)
            .filter(|record| record.visible_to(caller))
            .map(|record| record.operation.clone()))
    }

    async fn save(&self, operation: Operation, caller: Option<&CallerId>) -> Result<(), ForrstError> {
        let mut records = self.records.write();
        let owner = match records.get(&operation.id) {
            Some(existing) if !existing.visible_to(caller) => {
                tracing::warn!(operation = %operation.id, "refusing to overwrite an operation owned by another caller");
                return Err(ForrstError::AccessDenied {
                    reason: format!("operation {} belongs to another caller", operation.id),
                });
            }
            Some(existing) => existing.owner.clone(),
            None => caller.cloned(),
        };
        tracing::debug!(operation = %operation.id, status = ?operation.status, "saved operation");
        records.insert(operation.id, Record { operation, owner });
        Ok(())
    }

    async fn delete(&self, id: OperationId, caller: Option<&CallerId>) -> Result<(), ForrstError> {
        let mut records = self.records.write();
        if records.get(&id).is_some_and(|record| record.visible_to(caller)) {
            records.remove(&id);
        }
        Ok(())
    }

    async fn list(
        &self,
        query: &OperationQuery,
        caller: Option<&CallerId>,
    ) -> Result<OperationPage, ForrstError> {
        let records = self.records.read();
        let mut matching: Vec<&Operation> = records
            .values()
            .filter(|record| record.visible_to(caller))
            .map(|record| &record.operation)
            .filter(|op| query.status.map_or(true, |status| op.status == status))
            .filter(|op| query.function.as_deref().map_or(true, |f| op.function == f))
            .collect();
        matching.sort_by_key(|op| (op.created_at, op.id));

        let start = match &query.cursor {
            None => 0,
            Some(cursor) => {
                let after: OperationId = cursor.as_str().parse().map_err(|_| invalid_cursor(cursor))?;
                matching
                    .iter()
                    .position(|op| op.id == after)
                    .map(|index| index + 1)
                    .ok_or_else(|| invalid_cursor(cursor))?
            }
        };

        let limit = query.effective_limit();
        let page: Vec<Operation> = matching.iter().skip(start).take(limit).map(|op| (*op).clone()).collect();
        let next_cursor = if start + page.len() < matching.len() {
            page.last().and_then(|op| Cursor::new(op.id.to_string()))
        } else {
            None
        };

        Ok(OperationPage {
            operations: page,
            next_cursor,
        })
    }
}
