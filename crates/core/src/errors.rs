use thiserror::Error;

use crate::directory::DirectoryError;
use crate::domain::entity::{EntityType, UserId};
use crate::domain::instance::InstanceId;
use crate::machine::TransitionError;
use crate::registry::RegistryError;
use crate::resolver::ResolverError;
use crate::store::StoreError;

/// How a caller should treat an engine error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Operator mistake (missing adapter/template); never retried.
    Configuration,
    /// Denied to this user; surfaced as a rejected request.
    Authorization,
    /// The instance is not in the state the operation expects.
    State,
    /// Retry after re-reading the instance.
    Conflict,
    /// Persistence or other internal failure.
    Internal,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Resolver(#[from] ResolverError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("user `{user}` may not {action} for entity type `{entity_type}`")]
    CapabilityDenied { user: UserId, entity_type: EntityType, action: &'static str },
    #[error("approval instance `{instance_id}` not found")]
    InstanceNotFound { instance_id: InstanceId },
    #[error(transparent)]
    Transition(TransitionError),
    #[error("instance `{instance_id}` was modified concurrently; re-read and retry")]
    ConcurrentModification { instance_id: InstanceId },
    #[error(transparent)]
    Store(StoreError),
    #[error("live state of instance `{instance_id}` diverges from its audit trail: {detail}")]
    ReplayMismatch { instance_id: InstanceId, detail: String },
    #[error("audit chain for instance `{instance_id}` failed verification: {reason}")]
    ChainBroken { instance_id: InstanceId, reason: String },
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Registry(_) | Self::Resolver(_) | Self::Directory(_) => {
                ErrorCategory::Configuration
            }
            Self::CapabilityDenied { .. } => ErrorCategory::Authorization,
            Self::Transition(error) => match error {
                TransitionError::ApproverNotEligible { .. }
                | TransitionError::CancelDenied { .. } => ErrorCategory::Authorization,
                TransitionError::Directory(_) | TransitionError::EmptyEligibleSet { .. } => {
                    ErrorCategory::Configuration
                }
                _ => ErrorCategory::State,
            },
            Self::InstanceNotFound { .. } => ErrorCategory::State,
            Self::ConcurrentModification { .. } => ErrorCategory::Conflict,
            Self::Store(_) | Self::ReplayMismatch { .. } | Self::ChainBroken { .. } => {
                ErrorCategory::Internal
            }
        }
    }

    /// Only concurrent-modification conflicts are worth an automatic
    /// caller retry; everything else needs a human or an operator.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Conflict)
    }
}

impl From<TransitionError> for EngineError {
    fn from(error: TransitionError) -> Self {
        Self::Transition(error)
    }
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::InstanceNotFound { instance_id } => Self::InstanceNotFound { instance_id },
            StoreError::RevisionConflict { instance_id, .. } => {
                Self::ConcurrentModification { instance_id }
            }
            other => Self::Store(other),
        }
    }
}
