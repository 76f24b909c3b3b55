use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::instance::{ApprovalInstance, DispatchState, InstanceId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("instance `{instance_id}` already exists")]
    DuplicateInstance { instance_id: InstanceId },
    #[error("instance `{instance_id}` not found")]
    InstanceNotFound { instance_id: InstanceId },
    #[error("revision conflict on instance `{instance_id}` (expected {expected})")]
    RevisionConflict { instance_id: InstanceId, expected: u64 },
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Persistence seam for the approval aggregate. `update` is a
/// compare-and-swap on the instance revision; that is what serializes
/// concurrent mutations of the same instance without any cross-instance
/// locking.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn insert(&self, instance: ApprovalInstance) -> Result<(), StoreError>;

    async fn get(&self, id: &InstanceId) -> Result<Option<ApprovalInstance>, StoreError>;

    /// Persist `instance` only if the stored revision still equals
    /// `expected_revision`.
    async fn update(
        &self,
        instance: ApprovalInstance,
        expected_revision: u64,
    ) -> Result<(), StoreError>;

    /// Terminal instances whose side-effect dispatch is pending and due.
    async fn list_dispatch_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApprovalInstance>, StoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryInstanceStore {
    instances: Arc<Mutex<HashMap<String, ApprovalInstance>>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_map<T>(&self, f: impl FnOnce(&mut HashMap<String, ApprovalInstance>) -> T) -> T {
        match self.instances.lock() {
            Ok(mut map) => f(&mut map),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn insert(&self, instance: ApprovalInstance) -> Result<(), StoreError> {
        self.with_map(|map| {
            if map.contains_key(&instance.id.0) {
                return Err(StoreError::DuplicateInstance { instance_id: instance.id.clone() });
            }
            map.insert(instance.id.0.clone(), instance);
            Ok(())
        })
    }

    async fn get(&self, id: &InstanceId) -> Result<Option<ApprovalInstance>, StoreError> {
        Ok(self.with_map(|map| map.get(&id.0).cloned()))
    }

    async fn update(
        &self,
        instance: ApprovalInstance,
        expected_revision: u64,
    ) -> Result<(), StoreError> {
        self.with_map(|map| {
            let Some(stored) = map.get(&instance.id.0) else {
                return Err(StoreError::InstanceNotFound { instance_id: instance.id.clone() });
            };
            if stored.revision != expected_revision {
                return Err(StoreError::RevisionConflict {
                    instance_id: instance.id.clone(),
                    expected: expected_revision,
                });
            }
            map.insert(instance.id.0.clone(), instance);
            Ok(())
        })
    }

    async fn list_dispatch_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApprovalInstance>, StoreError> {
        let mut due = self.with_map(|map| {
            map.values()
                .filter(|instance| match &instance.dispatch {
                    DispatchState::Pending { next_attempt_at, .. } => *next_attempt_at <= now,
                    _ => false,
                })
                .cloned()
                .collect::<Vec<_>>()
        });
        due.sort_by(|left, right| left.id.0.cmp(&right.id.0));
        Ok(due)
    }
}
