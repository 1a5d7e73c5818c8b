//! # Pending Operation Repository
//!
//! Persists queued mutations in the `pending_operations` collection.
//!
//! ## Indexes
//! - `entity`   → `"type/id"` (absent when the operation has no entity)
//! - `priority` → `"low" | "medium" | "high"`
//!
//! Records come back in insertion order with [`PendingOperation::sequence`]
//! filled in from the store.

use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::store::{DurableStore, IndexPredicate, StoredRecord};
use tether_core::{EntityRef, PendingOperation, Priority, PENDING_OPERATIONS};

const ENTITY_INDEX: &str = "entity";
const PRIORITY_INDEX: &str = "priority";

/// Repository for queued mutations.
#[derive(Debug, Clone)]
pub struct PendingOperationRepository {
    store: DurableStore,
}

impl PendingOperationRepository {
    pub fn new(store: DurableStore) -> Self {
        PendingOperationRepository { store }
    }

    fn indexes(op: &PendingOperation) -> Vec<(&'static str, String)> {
        let mut indexes = vec![(PRIORITY_INDEX, op.priority.as_str().to_string())];
        if let Some(entity) = &op.entity {
            indexes.push((ENTITY_INDEX, entity.index_key()));
        }
        indexes
    }

    fn decode(record: StoredRecord) -> DbResult<PendingOperation> {
        let mut op: PendingOperation = serde_json::from_str(&record.value)?;
        op.sequence = record.sequence;
        Ok(op)
    }

    async fn write(&self, op: &PendingOperation) -> DbResult<i64> {
        let value = serde_json::to_string(op)?;
        self.store
            .put(PENDING_OPERATIONS, &op.id, &value, &Self::indexes(op))
            .await
    }

    /// Persists a new operation. Returns it with its sequence assigned.
    pub async fn insert(&self, op: &PendingOperation) -> DbResult<PendingOperation> {
        let sequence = self.write(op).await?;

        debug!(
            id = %op.id,
            target = %op.target,
            priority = op.priority.as_str(),
            sequence,
            "Operation persisted"
        );

        let mut stored = op.clone();
        stored.sequence = sequence;
        Ok(stored)
    }

    /// Rewrites an existing operation (retry bookkeeping).
    ///
    /// Fails with `NotFound` when the operation was removed in the meantime,
    /// so a cleared queue is never repopulated by an in-flight drain.
    pub async fn update(&self, op: &PendingOperation) -> DbResult<()> {
        let value = serde_json::to_string(op)?;
        let updated = self
            .store
            .update_existing(PENDING_OPERATIONS, &op.id, &value, &Self::indexes(op))
            .await?;

        if !updated {
            return Err(DbError::not_found(PENDING_OPERATIONS, &op.id));
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<PendingOperation>> {
        self.store
            .get(PENDING_OPERATIONS, id)
            .await?
            .map(Self::decode)
            .transpose()
    }

    /// Removes an operation. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> DbResult<bool> {
        self.store.delete(PENDING_OPERATIONS, id).await
    }

    /// Every pending operation in insertion order.
    pub async fn list_all(&self) -> DbResult<Vec<PendingOperation>> {
        self.list(&IndexPredicate::All).await
    }

    /// Pending operations for one entity in insertion order.
    pub async fn list_for_entity(&self, entity: &EntityRef) -> DbResult<Vec<PendingOperation>> {
        self.list(&IndexPredicate::equals(ENTITY_INDEX, entity.index_key()))
            .await
    }

    /// Pending operations at one priority level in insertion order.
    pub async fn list_by_priority(&self, priority: Priority) -> DbResult<Vec<PendingOperation>> {
        self.list(&IndexPredicate::equals(PRIORITY_INDEX, priority.as_str()))
            .await
    }

    async fn list(&self, predicate: &IndexPredicate) -> DbResult<Vec<PendingOperation>> {
        self.store
            .scan(PENDING_OPERATIONS, predicate)
            .await?
            .into_iter()
            .map(Self::decode)
            .collect()
    }

    pub async fn count(&self) -> DbResult<u64> {
        self.store.count(PENDING_OPERATIONS, &IndexPredicate::All).await
    }

    /// Drops every pending operation. Returns how many were removed.
    pub async fn clear(&self) -> DbResult<u64> {
        self.store.clear(PENDING_OPERATIONS).await
    }
}
