pub mod audit;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod machine;
pub mod notify;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod store;

pub use audit::{
    replay, AuditChain, AuditEntry, AuditKind, AuditStore, ChainVerification, EventRecord,
    InMemoryAuditStore, ReplayedInstance,
};
pub use config::{
    AuditConfig, ConfigError, ConfigOverrides, EngineConfig, LoadOptions, LogFormat,
    LoggingConfig,
};
pub use directory::{ApproverDirectory, DirectoryError, InMemoryDirectory};
pub use dispatch::{ActionDispatcher, ClaimOutcome, DispatchConfig, DispatchOutcome};
pub use domain::context::SubmissionContext;
pub use domain::entity::{EntityId, EntityRef, EntityType, UserId};
pub use domain::instance::{
    ApprovalInstance, Decision, DecisionKind, Delegation, DelegationReason, DispatchState,
    InstanceId, InstanceStatus, InstanceSummary, StepExecution, StepStatus, StepSummary,
};
pub use domain::template::{
    ApprovalTemplate, ApproverSelector, SkipRule, Step, StepMode, TemplateVersion,
};
pub use errors::{EngineError, ErrorCategory};
pub use machine::{TransitionError, TransitionOutcome};
pub use notify::{
    InMemoryNotificationSink, Notification, NotificationKind, NotificationSink,
    NullNotificationSink,
};
pub use registry::{
    AdapterError, AdapterRegistry, CapabilityAction, EntityAdapter, RegistryError,
};
pub use resolver::{ResolverError, TemplateCatalog, TemplateRule};
pub use service::ApprovalService;
pub use store::{InMemoryInstanceStore, InstanceStore, StoreError};
