use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::domain::entity::{EntityRef, EntityType, UserId};
use crate::domain::instance::{ApprovalInstance, InstanceStatus};

/// Capability the engine asks an adapter to check before a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapabilityAction {
    /// May the user submit this entity for approval.
    Submit,
    /// May the user cancel an instance they did not submit.
    CancelOverride,
}

/// Failure from an adapter's terminal side effect. `retryable` controls
/// whether the dispatcher schedules another attempt.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("adapter side effect failed: {message}")]
pub struct AdapterError {
    pub message: String,
    pub retryable: bool,
}

impl AdapterError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: true }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: false }
    }
}

/// Per-entity-type plugin. Implementations carry the business knowledge
/// the engine deliberately lacks: who may submit or override-cancel, and
/// what happens to the entity when the approval terminates.
pub trait EntityAdapter: Send + Sync {
    fn entity_type(&self) -> EntityType;

    fn capability_check(
        &self,
        user: &UserId,
        entity: &EntityRef,
        action: CapabilityAction,
    ) -> bool;

    /// Terminal side effect, invoked exactly once per instance by the
    /// action dispatcher. Must be idempotent-tolerant on the adapter side
    /// only for retries it reported as retryable.
    fn on_terminal(
        &self,
        instance: &ApprovalInstance,
        final_status: InstanceStatus,
    ) -> Result<(), AdapterError>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("adapter already registered for entity type `{entity_type}`")]
    DuplicateAdapter { entity_type: EntityType },
    #[error("unknown entity type `{entity_type}`")]
    UnknownEntityType { entity_type: EntityType },
}

/// Process-scoped lookup table from entity type to adapter. Populated once
/// at startup, read-only thereafter; concurrent reads need no locking.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn EntityAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn EntityAdapter>) -> Result<(), RegistryError> {
        let entity_type = adapter.entity_type();
        let key = entity_type.key();
        if self.adapters.contains_key(&key) {
            return Err(RegistryError::DuplicateAdapter { entity_type });
        }
        self.adapters.insert(key, adapter);
        Ok(())
    }

    pub fn resolve(
        &self,
        entity_type: &EntityType,
    ) -> Result<Arc<dyn EntityAdapter>, RegistryError> {
        self.adapters.get(&entity_type.key()).cloned().ok_or_else(|| {
            RegistryError::UnknownEntityType { entity_type: entity_type.clone() }
        })
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.adapters.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for dyn EntityAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityAdapter").field("entity_type", &self.entity_type()).finish()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry").field("types", &self.registered_types()).finish()
    }
}
