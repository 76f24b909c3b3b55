use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use tracing::info;
use uuid::Uuid;

use crate::audit::{
    replay, AuditChain, AuditEntry, AuditKind, AuditStore, ChainVerification, EventRecord,
};
use crate::config::EngineConfig;
use crate::directory::ApproverDirectory;
use crate::dispatch::{ActionDispatcher, ClaimOutcome, DispatchOutcome};
use crate::domain::context::SubmissionContext;
use crate::domain::entity::{EntityRef, UserId};
use crate::domain::instance::{
    ApprovalInstance, DecisionKind, DelegationReason, InstanceId, InstanceSummary, StepStatus,
};
use crate::errors::EngineError;
use crate::machine;
use crate::notify::{Notification, NotificationKind, NotificationSink};
use crate::registry::{AdapterRegistry, CapabilityAction};
use crate::resolver::TemplateCatalog;
use crate::store::{InstanceStore, StoreError};

/// Front door of the engine. Owns the startup-time configuration (adapters,
/// templates, directory) and orchestrates each operation as load, pure
/// transition, compare-and-swap persist, audit append, notify, and — for
/// terminal transitions — side-effect dispatch.
pub struct ApprovalService {
    registry: AdapterRegistry,
    catalog: TemplateCatalog,
    directory: Arc<dyn ApproverDirectory>,
    instances: Arc<dyn InstanceStore>,
    audit_store: Arc<dyn AuditStore>,
    audit_chain: AuditChain,
    notifications: Arc<dyn NotificationSink>,
    dispatcher: ActionDispatcher,
}

impl ApprovalService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &EngineConfig,
        registry: AdapterRegistry,
        catalog: TemplateCatalog,
        directory: Arc<dyn ApproverDirectory>,
        instances: Arc<dyn InstanceStore>,
        audit_store: Arc<dyn AuditStore>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            registry,
            catalog,
            directory,
            instances,
            audit_store,
            audit_chain: AuditChain::new(config.audit.signing_key.expose_secret()),
            notifications,
            dispatcher: ActionDispatcher::with_config(config.dispatch.clone()),
        }
    }

    /// Starts an approval for `entity`. The template is resolved from the
    /// submission context and frozen into the new instance.
    pub async fn submit(
        &self,
        entity: EntityRef,
        context: SubmissionContext,
        submitted_by: UserId,
        now: DateTime<Utc>,
    ) -> Result<InstanceSummary, EngineError> {
        let adapter = self.registry.resolve(&entity.entity_type)?;
        if !adapter.capability_check(&submitted_by, &entity, CapabilityAction::Submit) {
            return Err(EngineError::CapabilityDenied {
                user: submitted_by,
                entity_type: entity.entity_type,
                action: "submit",
            });
        }

        let template = self.catalog.resolve(&entity.entity_type, &context)?;
        let instance_id = InstanceId(Uuid::new_v4().to_string());
        let outcome = machine::submit_instance(
            instance_id.clone(),
            entity,
            template,
            context,
            submitted_by,
            self.directory.as_ref(),
            now,
        )?;

        self.instances.insert(outcome.instance.clone()).await?;
        self.append_events(&instance_id, outcome.events.clone()).await?;
        self.notify_events(&outcome.instance, &outcome.events);
        info!(
            instance_id = %instance_id,
            entity_type = %outcome.instance.entity.entity_type,
            template_id = %outcome.instance.template.id,
            status = outcome.instance.status.as_str(),
            "approval instance submitted"
        );

        if outcome.instance.dispatch.is_pending() {
            self.drive_dispatch(outcome.instance, now).await?;
        }
        self.summary(&instance_id).await
    }

    /// Records one approve/reject decision on the instance's current step.
    pub async fn decide(
        &self,
        instance_id: &InstanceId,
        approver: UserId,
        kind: DecisionKind,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<InstanceSummary, EngineError> {
        let instance = self.load(instance_id).await?;
        let expected_revision = instance.revision;
        let outcome = machine::apply_decision(
            instance,
            approver,
            kind,
            comment,
            self.directory.as_ref(),
            now,
        )?;

        self.instances.update(outcome.instance.clone(), expected_revision).await?;
        self.append_events(instance_id, outcome.events.clone()).await?;
        self.notify_events(&outcome.instance, &outcome.events);

        if outcome.instance.status.is_terminal() {
            info!(
                instance_id = %instance_id,
                status = outcome.instance.status.as_str(),
                "approval instance reached a terminal status"
            );
        }
        if outcome.instance.dispatch.is_pending() {
            self.drive_dispatch(outcome.instance, now).await?;
        }
        self.summary(instance_id).await
    }

    /// Cancels a pending instance. The submitter may always cancel their
    /// own submission; anyone else needs the adapter's override capability.
    pub async fn cancel(
        &self,
        instance_id: &InstanceId,
        requester: UserId,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<InstanceSummary, EngineError> {
        let instance = self.load(instance_id).await?;
        let expected_revision = instance.revision;
        let allowed = requester == instance.created_by || {
            let adapter = self.registry.resolve(&instance.entity.entity_type)?;
            adapter.capability_check(
                &requester,
                &instance.entity,
                CapabilityAction::CancelOverride,
            )
        };
        let outcome = machine::apply_cancel(instance, requester, reason, allowed, now)?;

        self.instances.update(outcome.instance.clone(), expected_revision).await?;
        self.append_events(instance_id, outcome.events.clone()).await?;
        self.notify_events(&outcome.instance, &outcome.events);

        if outcome.instance.dispatch.is_pending() {
            self.drive_dispatch(outcome.instance, now).await?;
        }
        self.summary(instance_id).await
    }

    /// Replaces `from` with `to` in the current step's eligible set.
    pub async fn delegate(
        &self,
        instance_id: &InstanceId,
        from: UserId,
        to: UserId,
        step_id: &str,
        reason: DelegationReason,
        now: DateTime<Utc>,
    ) -> Result<InstanceSummary, EngineError> {
        let instance = self.load(instance_id).await?;
        let expected_revision = instance.revision;
        let outcome = machine::apply_delegation(instance, from, to, step_id, reason, now)?;

        self.instances.update(outcome.instance.clone(), expected_revision).await?;
        self.append_events(instance_id, outcome.events).await?;
        self.summary(instance_id).await
    }

    pub async fn get_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<InstanceSummary, EngineError> {
        self.summary(instance_id).await
    }

    /// The instance's full audit trail, ordered by sequence number.
    pub async fn history(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<AuditEntry>, EngineError> {
        self.load(instance_id).await?;
        Ok(self.audit_store.history(instance_id).await?)
    }

    /// Re-attempts pending terminal side effects whose backoff has elapsed.
    /// Intended to be called from an external scheduler loop; returns the
    /// number of instances that were due.
    pub async fn retry_due_dispatches(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let due = self.instances.list_dispatch_due(now).await?;
        let count = due.len();
        for instance in due {
            self.drive_dispatch(instance, now).await?;
        }
        Ok(count)
    }

    /// Consistency self-check: verifies the instance's audit hash chain and
    /// replays it, comparing the reconstruction with the live aggregate.
    pub async fn verify(
        &self,
        instance_id: &InstanceId,
    ) -> Result<ChainVerification, EngineError> {
        let instance = self.load(instance_id).await?;
        let entries = self.audit_store.history(instance_id).await?;

        let verification = self.audit_chain.verify(instance_id, &entries);
        if !verification.valid {
            return Err(EngineError::ChainBroken {
                instance_id: instance_id.clone(),
                reason: verification
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }

        let replayed = replay(&entries);
        if replayed.status != Some(instance.status) {
            return Err(replay_mismatch(
                instance_id,
                format!("status {:?} vs replayed {:?}", instance.status, replayed.status),
            ));
        }
        if replayed.current_step != instance.current_step {
            return Err(replay_mismatch(
                instance_id,
                format!(
                    "current step {:?} vs replayed {:?}",
                    instance.current_step, replayed.current_step
                ),
            ));
        }
        let live_steps: Vec<(String, StepStatus)> = instance
            .steps
            .iter()
            .map(|exec| (exec.step_id.clone(), exec.status))
            .collect();
        if replayed.steps != live_steps {
            return Err(replay_mismatch(
                instance_id,
                format!("steps {live_steps:?} vs replayed {:?}", replayed.steps),
            ));
        }

        Ok(verification)
    }

    async fn load(&self, instance_id: &InstanceId) -> Result<ApprovalInstance, EngineError> {
        self.instances
            .get(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound { instance_id: instance_id.clone() })
    }

    async fn summary(&self, instance_id: &InstanceId) -> Result<InstanceSummary, EngineError> {
        Ok(InstanceSummary::of(&self.load(instance_id).await?))
    }

    /// Seals transition events onto the instance's hash chain, continuing
    /// from the latest persisted entry.
    async fn append_events(
        &self,
        instance_id: &InstanceId,
        events: Vec<EventRecord>,
    ) -> Result<(), EngineError> {
        let (mut seq, mut prev_hash) = match self.audit_store.latest(instance_id).await? {
            Some(latest) => (latest.seq, Some(latest.entry_hash)),
            None => (0, None),
        };
        for record in events {
            seq += 1;
            let entry = self.audit_chain.seal(instance_id, seq, prev_hash.take(), record);
            prev_hash = Some(entry.entry_hash.clone());
            self.audit_store.append(entry).await?;
        }
        Ok(())
    }

    fn notify_events(&self, instance: &ApprovalInstance, events: &[EventRecord]) {
        for event in events {
            match event.kind {
                AuditKind::StepEntered if !event.metadata.contains_key("skipped") => {
                    let approvers = event
                        .metadata
                        .get("approvers")
                        .map(|raw| raw.split(',').map(UserId::new).collect())
                        .unwrap_or_default();
                    self.notifications.notify(Notification {
                        instance_id: instance.id.clone(),
                        entity: instance.entity.clone(),
                        kind: NotificationKind::StepEntered {
                            step_id: event
                                .metadata
                                .get("step_id")
                                .cloned()
                                .unwrap_or_default(),
                            approvers,
                        },
                        occurred_at: event.occurred_at,
                    });
                }
                AuditKind::Approved | AuditKind::Rejected | AuditKind::Cancelled => {
                    self.notifications.notify(Notification {
                        instance_id: instance.id.clone(),
                        entity: instance.entity.clone(),
                        kind: NotificationKind::Completed { final_status: instance.status },
                        occurred_at: event.occurred_at,
                    });
                }
                _ => {}
            }
        }
    }

    /// One side-effect attempt: claim, persist the claim, call the adapter,
    /// persist the result. The persisted claim leases the slot until the
    /// attempt's retry deadline, so concurrent pollers skip it. Losing
    /// either CAS means another driver owns or already finished this
    /// attempt, which is fine. Side-effect failure never propagates; it is
    /// recorded on the instance and in the audit trail.
    async fn drive_dispatch(
        &self,
        mut instance: ApprovalInstance,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let pre_claim = instance.revision;
        match self.dispatcher.begin_attempt(&mut instance, now) {
            ClaimOutcome::Claimed { .. } => {}
            ClaimOutcome::NotDue { .. } | ClaimOutcome::NotPending => return Ok(()),
        }
        match self.instances.update(instance.clone(), pre_claim).await {
            Ok(()) => {}
            Err(StoreError::RevisionConflict { .. }) => return Ok(()),
            Err(error) => return Err(error.into()),
        }

        let adapter = self.registry.resolve(&instance.entity.entity_type)?;
        let result = adapter.on_terminal(&instance, instance.status);

        let post_claim = instance.revision;
        let outcome = self.dispatcher.finish_attempt(&mut instance, result, now);
        match self.instances.update(instance.clone(), post_claim).await {
            Ok(()) => {}
            // Our lease expired mid-call and another driver took over the
            // slot; its result stands and ours is discarded.
            Err(StoreError::RevisionConflict { .. }) => return Ok(()),
            Err(error) => return Err(error.into()),
        }

        match outcome {
            DispatchOutcome::Dispatched { event } | DispatchOutcome::Failed { event } => {
                self.append_events(&instance.id, vec![event]).await?;
            }
            DispatchOutcome::RetryScheduled { .. } | DispatchOutcome::NotPending => {}
        }
        Ok(())
    }
}

fn replay_mismatch(instance_id: &InstanceId, detail: String) -> EngineError {
    EngineError::ReplayMismatch { instance_id: instance_id.clone(), detail }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{mpsc, Arc, Mutex};

    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use super::ApprovalService;
    use crate::audit::{AuditKind, InMemoryAuditStore};
    use crate::config::EngineConfig;
    use crate::directory::InMemoryDirectory;
    use crate::domain::context::SubmissionContext;
    use crate::domain::entity::{EntityRef, EntityType, UserId};
    use crate::domain::instance::{
        ApprovalInstance, DecisionKind, DelegationReason, DispatchState, InstanceStatus,
        StepStatus,
    };
    use crate::domain::template::{
        ApprovalTemplate, ApproverSelector, SkipRule, Step, StepMode,
    };
    use crate::errors::{EngineError, ErrorCategory};
    use crate::notify::{InMemoryNotificationSink, NotificationKind};
    use crate::registry::test_support::RecordingAdapter;
    use crate::registry::{AdapterError, AdapterRegistry, CapabilityAction, EntityAdapter};
    use crate::resolver::TemplateCatalog;
    use crate::store::{InMemoryInstanceStore, InstanceStore};

    const ENTITY_TYPE: &str = "purchase_order";

    struct Harness {
        service: Arc<ApprovalService>,
        adapter: Arc<RecordingAdapter>,
        instances: Arc<InMemoryInstanceStore>,
        notifications: InMemoryNotificationSink,
    }

    fn users(ids: &[&str]) -> ApproverSelector {
        ApproverSelector::Users { users: ids.iter().map(|id| UserId::new(*id)).collect() }
    }

    fn two_level_template() -> ApprovalTemplate {
        ApprovalTemplate::new(
            "po-two-level",
            1,
            vec![
                Step::new("manager", StepMode::All, users(&["u-x", "u-y"])),
                Step::new("director", StepMode::All, users(&["u-z"])),
            ],
        )
    }

    fn single_step_template() -> ApprovalTemplate {
        ApprovalTemplate::new(
            "po-single",
            1,
            vec![Step::new("manager", StepMode::Any, users(&["u-m"]))],
        )
    }

    fn build_service(
        adapter: Arc<dyn EntityAdapter>,
        template: ApprovalTemplate,
        notifications: InMemoryNotificationSink,
        instances: Arc<InMemoryInstanceStore>,
    ) -> Arc<ApprovalService> {
        let mut config = EngineConfig::default();
        config.audit.signing_key = "service-test-key".to_string().into();

        let mut registry = AdapterRegistry::new();
        registry.register(adapter).expect("adapter registration");

        let mut catalog = TemplateCatalog::new();
        catalog.set_default(&EntityType::new(ENTITY_TYPE), template).expect("template");

        Arc::new(ApprovalService::new(
            &config,
            registry,
            catalog,
            Arc::new(InMemoryDirectory::new()),
            instances,
            Arc::new(InMemoryAuditStore::new()),
            Arc::new(notifications),
        ))
    }

    fn harness(adapter: RecordingAdapter, template: ApprovalTemplate) -> Harness {
        let adapter = Arc::new(adapter);
        let instances = Arc::new(InMemoryInstanceStore::new());
        let notifications = InMemoryNotificationSink::new();
        let service = build_service(
            adapter.clone(),
            template,
            notifications.clone(),
            instances.clone(),
        );
        Harness { service, adapter, instances, notifications }
    }

    /// Adapter whose first terminal call signals entry and then blocks
    /// until released, so tests can act while a dispatch is in flight.
    struct StallingAdapter {
        entered_tx: mpsc::Sender<()>,
        gate_rx: Mutex<mpsc::Receiver<()>>,
        calls: AtomicU32,
    }

    impl StallingAdapter {
        fn with_channels() -> (Arc<Self>, mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (gate_tx, gate_rx) = mpsc::channel();
            let adapter = Arc::new(Self {
                entered_tx,
                gate_rx: Mutex::new(gate_rx),
                calls: AtomicU32::new(0),
            });
            (adapter, entered_rx, gate_tx)
        }
    }

    impl EntityAdapter for StallingAdapter {
        fn entity_type(&self) -> EntityType {
            EntityType::new(ENTITY_TYPE)
        }

        fn capability_check(
            &self,
            _user: &UserId,
            _entity: &EntityRef,
            action: CapabilityAction,
        ) -> bool {
            matches!(action, CapabilityAction::Submit)
        }

        fn on_terminal(
            &self,
            _instance: &ApprovalInstance,
            _final_status: InstanceStatus,
        ) -> Result<(), AdapterError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == 1 {
                let _ = self.entered_tx.send(());
                if let Ok(gate) = self.gate_rx.lock() {
                    let _ = gate.recv();
                }
            }
            Ok(())
        }
    }

    async fn await_adapter_entry(entered_rx: mpsc::Receiver<()>) {
        tokio::task::spawn_blocking(move || {
            entered_rx.recv_timeout(std::time::Duration::from_secs(5))
        })
        .await
        .expect("join")
        .expect("adapter call started");
    }

    fn entity(id: &str) -> EntityRef {
        EntityRef::new(ENTITY_TYPE, id)
    }

    #[tokio::test]
    async fn full_two_level_flow_approves_and_fires_the_side_effect_once() {
        let harness = harness(RecordingAdapter::new(ENTITY_TYPE), two_level_template());
        let now = Utc::now();

        let submitted = harness
            .service
            .submit(
                entity("PO-1001"),
                SubmissionContext::default().with_amount(Decimal::new(1_500_000, 2)),
                UserId::new("u-submitter"),
                now,
            )
            .await
            .expect("submit");
        assert_eq!(submitted.status, InstanceStatus::Pending);
        assert_eq!(submitted.current_step_id.as_deref(), Some("manager"));

        let id = submitted.instance_id;
        for approver in ["u-x", "u-y", "u-z"] {
            harness
                .service
                .decide(&id, UserId::new(approver), DecisionKind::Approve, None, now)
                .await
                .expect("decision");
        }

        let summary = harness.service.get_instance(&id).await.expect("summary");
        assert_eq!(summary.status, InstanceStatus::Approved);
        assert_eq!(summary.current_step, None);
        assert_eq!(harness.adapter.terminal_call_count(), 1);

        let stored = harness.instances.get(&id).await.expect("get").expect("instance");
        assert!(matches!(stored.dispatch, DispatchState::Dispatched { attempts: 1, .. }));

        let history = harness.service.history(&id).await.expect("history");
        assert_eq!(history.first().map(|e| e.kind), Some(AuditKind::Submitted));
        assert_eq!(history.last().map(|e| e.kind), Some(AuditKind::ActionDispatched));
        assert_eq!(
            history.iter().map(|e| e.seq).collect::<Vec<_>>(),
            (1..=history.len() as u64).collect::<Vec<_>>()
        );

        let verification = harness.service.verify(&id).await.expect("verify");
        assert!(verification.valid);
    }

    #[tokio::test]
    async fn submit_is_denied_without_the_adapter_capability() {
        let adapter =
            RecordingAdapter::new(ENTITY_TYPE).deny_submitter(UserId::new("u-blocked"));
        let harness = harness(adapter, two_level_template());

        let error = harness
            .service
            .submit(
                entity("PO-1002"),
                SubmissionContext::default(),
                UserId::new("u-blocked"),
                Utc::now(),
            )
            .await
            .expect_err("capability denied");
        assert!(matches!(error, EngineError::CapabilityDenied { .. }));
        assert_eq!(error.category(), ErrorCategory::Authorization);
    }

    #[tokio::test]
    async fn unregistered_entity_type_is_a_configuration_error() {
        let harness = harness(RecordingAdapter::new(ENTITY_TYPE), two_level_template());

        let error = harness
            .service
            .submit(
                EntityRef::new("contract", "CT-1"),
                SubmissionContext::default(),
                UserId::new("u-submitter"),
                Utc::now(),
            )
            .await
            .expect_err("no adapter");
        assert_eq!(error.category(), ErrorCategory::Configuration);
    }

    #[tokio::test]
    async fn rejection_short_circuits_and_still_dispatches() {
        let harness = harness(RecordingAdapter::new(ENTITY_TYPE), two_level_template());
        let now = Utc::now();

        let submitted = harness
            .service
            .submit(entity("PO-1003"), SubmissionContext::default(), UserId::new("u-s"), now)
            .await
            .expect("submit");
        let id = submitted.instance_id;

        let summary = harness
            .service
            .decide(
                &id,
                UserId::new("u-y"),
                DecisionKind::Reject,
                Some("budget frozen".to_string()),
                now,
            )
            .await
            .expect("rejection");
        assert_eq!(summary.status, InstanceStatus::Rejected);
        assert_eq!(harness.adapter.terminal_call_count(), 1);

        let calls = harness.adapter.terminal_calls.lock().expect("calls");
        assert_eq!(calls[0].1, InstanceStatus::Rejected);
    }

    #[tokio::test]
    async fn submitter_cancels_but_strangers_need_the_override() {
        let adapter =
            RecordingAdapter::new(ENTITY_TYPE).allow_override_cancel(UserId::new("u-admin"));
        let harness = harness(adapter, two_level_template());
        let now = Utc::now();

        let first = harness
            .service
            .submit(entity("PO-1004"), SubmissionContext::default(), UserId::new("u-s"), now)
            .await
            .expect("submit");
        let denied = harness
            .service
            .cancel(&first.instance_id, UserId::new("u-stranger"), None, now)
            .await
            .expect_err("no override capability");
        assert_eq!(denied.category(), ErrorCategory::Authorization);

        let cancelled = harness
            .service
            .cancel(
                &first.instance_id,
                UserId::new("u-s"),
                Some("duplicate order".to_string()),
                now,
            )
            .await
            .expect("submitter cancel");
        assert_eq!(cancelled.status, InstanceStatus::Cancelled);

        let second = harness
            .service
            .submit(entity("PO-1005"), SubmissionContext::default(), UserId::new("u-s"), now)
            .await
            .expect("submit");
        let overridden = harness
            .service
            .cancel(&second.instance_id, UserId::new("u-admin"), None, now)
            .await
            .expect("override cancel");
        assert_eq!(overridden.status, InstanceStatus::Cancelled);
        assert_eq!(harness.adapter.terminal_call_count(), 2);
    }

    #[tokio::test]
    async fn retryable_side_effect_failure_is_retried_after_backoff() {
        let adapter = RecordingAdapter::new(ENTITY_TYPE).failing(1);
        let harness = harness(adapter, single_step_template());
        let now = Utc::now();

        let submitted = harness
            .service
            .submit(entity("PO-1006"), SubmissionContext::default(), UserId::new("u-s"), now)
            .await
            .expect("submit");
        let id = submitted.instance_id;

        let summary = harness
            .service
            .decide(&id, UserId::new("u-m"), DecisionKind::Approve, None, now)
            .await
            .expect("approval");
        // The approval outcome is unaffected by the failed first attempt.
        assert_eq!(summary.status, InstanceStatus::Approved);
        assert_eq!(harness.adapter.terminal_call_count(), 0);

        let stored = harness.instances.get(&id).await.expect("get").expect("instance");
        assert!(matches!(
            stored.dispatch,
            DispatchState::Pending { attempts: 1, last_error: Some(_), .. }
        ));

        // Nothing is due before the backoff elapses.
        assert_eq!(harness.service.retry_due_dispatches(now).await.expect("poll"), 0);

        let later = now + Duration::seconds(5);
        assert_eq!(harness.service.retry_due_dispatches(later).await.expect("poll"), 1);
        assert_eq!(harness.adapter.terminal_call_count(), 1);

        let stored = harness.instances.get(&id).await.expect("get").expect("instance");
        assert!(matches!(stored.dispatch, DispatchState::Dispatched { attempts: 2, .. }));

        let history = harness.service.history(&id).await.expect("history");
        assert_eq!(history.last().map(|e| e.kind), Some(AuditKind::ActionDispatched));
        harness.service.verify(&id).await.expect("verify");
    }

    #[tokio::test]
    async fn fatal_side_effect_failure_is_recorded_without_touching_the_outcome() {
        let adapter = RecordingAdapter::new(ENTITY_TYPE).fatal();
        let harness = harness(adapter, single_step_template());
        let now = Utc::now();

        let submitted = harness
            .service
            .submit(entity("PO-1007"), SubmissionContext::default(), UserId::new("u-s"), now)
            .await
            .expect("submit");
        let id = submitted.instance_id;
        let summary = harness
            .service
            .decide(&id, UserId::new("u-m"), DecisionKind::Approve, None, now)
            .await
            .expect("approval");
        assert_eq!(summary.status, InstanceStatus::Approved);

        let stored = harness.instances.get(&id).await.expect("get").expect("instance");
        assert!(matches!(stored.dispatch, DispatchState::Failed { attempts: 1, .. }));

        let history = harness.service.history(&id).await.expect("history");
        assert_eq!(history.last().map(|e| e.kind), Some(AuditKind::ActionFailed));
        // Failed dispatches are no longer due.
        assert_eq!(
            harness.service.retry_due_dispatches(now + Duration::hours(1)).await.expect("poll"),
            0
        );
    }

    #[tokio::test]
    async fn all_skip_submission_goes_terminal_and_dispatches_immediately() {
        let template = ApprovalTemplate::new(
            "po-auto",
            1,
            vec![Step::new("finance", StepMode::All, users(&["u-fin"]))
                .with_skip_when(SkipRule::AmountBelow { threshold: Decimal::new(100_000, 2) })],
        );
        let harness = harness(RecordingAdapter::new(ENTITY_TYPE), template);

        let summary = harness
            .service
            .submit(
                entity("PO-1008"),
                SubmissionContext::default().with_amount(Decimal::new(5_000, 2)),
                UserId::new("u-s"),
                Utc::now(),
            )
            .await
            .expect("submit");
        assert_eq!(summary.status, InstanceStatus::Approved);
        assert_eq!(summary.steps[0].status, StepStatus::Skipped);
        assert_eq!(harness.adapter.terminal_call_count(), 1);
        harness.service.verify(&summary.instance_id).await.expect("verify");
    }

    #[tokio::test]
    async fn delegation_lets_the_deputy_decide() {
        let harness = harness(RecordingAdapter::new(ENTITY_TYPE), two_level_template());
        let now = Utc::now();

        let submitted = harness
            .service
            .submit(entity("PO-1009"), SubmissionContext::default(), UserId::new("u-s"), now)
            .await
            .expect("submit");
        let id = submitted.instance_id;

        harness
            .service
            .delegate(
                &id,
                UserId::new("u-y"),
                UserId::new("u-deputy"),
                "manager",
                DelegationReason::Manual,
                now,
            )
            .await
            .expect("delegation");

        let summary = harness
            .service
            .decide(&id, UserId::new("u-deputy"), DecisionKind::Approve, None, now)
            .await
            .expect("deputy decides");
        assert_eq!(summary.steps[0].decisions, 1);

        let history = harness.service.history(&id).await.expect("history");
        assert!(history.iter().any(|e| e.kind == AuditKind::Delegated));
    }

    #[tokio::test]
    async fn outsider_decision_is_an_authorization_error() {
        let harness = harness(RecordingAdapter::new(ENTITY_TYPE), two_level_template());
        let now = Utc::now();

        let submitted = harness
            .service
            .submit(entity("PO-1010"), SubmissionContext::default(), UserId::new("u-s"), now)
            .await
            .expect("submit");

        let error = harness
            .service
            .decide(
                &submitted.instance_id,
                UserId::new("u-stranger"),
                DecisionKind::Approve,
                None,
                now,
            )
            .await
            .expect_err("not eligible");
        assert_eq!(error.category(), ErrorCategory::Authorization);
    }

    #[tokio::test]
    async fn notifications_cover_step_entries_and_completion() {
        let harness = harness(RecordingAdapter::new(ENTITY_TYPE), two_level_template());
        let now = Utc::now();

        let submitted = harness
            .service
            .submit(entity("PO-1011"), SubmissionContext::default(), UserId::new("u-s"), now)
            .await
            .expect("submit");
        let id = submitted.instance_id;
        for approver in ["u-x", "u-y", "u-z"] {
            harness
                .service
                .decide(&id, UserId::new(approver), DecisionKind::Approve, None, now)
                .await
                .expect("decision");
        }

        let notifications = harness.notifications.notifications();
        let step_entries: Vec<&str> = notifications
            .iter()
            .filter_map(|n| match &n.kind {
                NotificationKind::StepEntered { step_id, .. } => Some(step_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(step_entries, vec!["manager", "director"]);
        assert!(notifications.iter().any(|n| matches!(
            n.kind,
            NotificationKind::Completed { final_status: InstanceStatus::Approved }
        )));
    }

    #[tokio::test]
    async fn duplicate_decisions_leave_exactly_one_step_completion() {
        let harness = harness(RecordingAdapter::new(ENTITY_TYPE), two_level_template());
        let now = Utc::now();

        let submitted = harness
            .service
            .submit(entity("PO-1012"), SubmissionContext::default(), UserId::new("u-s"), now)
            .await
            .expect("submit");
        let id = submitted.instance_id;

        harness
            .service
            .decide(&id, UserId::new("u-x"), DecisionKind::Approve, None, now)
            .await
            .expect("first approver");

        // A repeated decision is rejected and records nothing.
        let error = harness
            .service
            .decide(&id, UserId::new("u-x"), DecisionKind::Approve, None, now)
            .await
            .expect_err("already decided");
        assert!(matches!(
            error,
            EngineError::Transition(crate::machine::TransitionError::DuplicateDecision { .. })
        ));

        harness
            .service
            .decide(&id, UserId::new("u-y"), DecisionKind::Approve, None, now)
            .await
            .expect("last approver");

        let history = harness.service.history(&id).await.expect("history");
        let manager_completions = history
            .iter()
            .filter(|e| {
                e.kind == AuditKind::StepCompleted
                    && e.metadata.get("step_id").map(String::as_str) == Some("manager")
            })
            .count();
        assert_eq!(manager_completions, 1);
        harness.service.verify(&id).await.expect("verify");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_retry_poll_skips_an_in_flight_dispatch() {
        let (adapter, entered_rx, gate_tx) = StallingAdapter::with_channels();
        let instances = Arc::new(InMemoryInstanceStore::new());
        let service = build_service(
            adapter.clone(),
            single_step_template(),
            InMemoryNotificationSink::new(),
            instances.clone(),
        );
        let now = Utc::now();

        let submitted = service
            .submit(entity("PO-1013"), SubmissionContext::default(), UserId::new("u-s"), now)
            .await
            .expect("submit");
        let id = submitted.instance_id;

        let decide_service = service.clone();
        let decide_id = id.clone();
        let decide = tokio::spawn(async move {
            decide_service
                .decide(&decide_id, UserId::new("u-m"), DecisionKind::Approve, None, now)
                .await
        });
        await_adapter_entry(entered_rx).await;

        // While the first attempt is inside the adapter, its persisted
        // claim keeps the instance off the due list.
        assert_eq!(service.retry_due_dispatches(now).await.expect("poll"), 0);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);

        gate_tx.send(()).expect("release");
        decide.await.expect("join").expect("decision");

        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        let stored = instances.get(&id).await.expect("get").expect("instance");
        assert!(matches!(stored.dispatch, DispatchState::Dispatched { attempts: 1, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn expired_claims_are_retaken_without_failing_the_original_driver() {
        let (adapter, entered_rx, gate_tx) = StallingAdapter::with_channels();
        let instances = Arc::new(InMemoryInstanceStore::new());
        let service = build_service(
            adapter.clone(),
            single_step_template(),
            InMemoryNotificationSink::new(),
            instances.clone(),
        );
        let now = Utc::now();

        let submitted = service
            .submit(entity("PO-1014"), SubmissionContext::default(), UserId::new("u-s"), now)
            .await
            .expect("submit");
        let id = submitted.instance_id;

        let decide_service = service.clone();
        let decide_id = id.clone();
        let decide = tokio::spawn(async move {
            decide_service
                .decide(&decide_id, UserId::new("u-m"), DecisionKind::Approve, None, now)
                .await
        });
        await_adapter_entry(entered_rx).await;

        // Past the claim's retry deadline the slot is presumed abandoned
        // and the poll runs the side effect itself.
        let later = now + Duration::seconds(5);
        assert_eq!(service.retry_due_dispatches(later).await.expect("poll"), 1);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);

        // The stalled driver wakes up, loses the finish write, and the
        // decision still reports success.
        gate_tx.send(()).expect("release");
        decide.await.expect("join").expect("decision");

        let stored = instances.get(&id).await.expect("get").expect("instance");
        assert!(matches!(stored.dispatch, DispatchState::Dispatched { attempts: 2, .. }));

        let history = service.history(&id).await.expect("history");
        let dispatched =
            history.iter().filter(|e| e.kind == AuditKind::ActionDispatched).count();
        assert_eq!(dispatched, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_decisions_for_the_last_missing_approver_serialize() {
        let harness = harness(RecordingAdapter::new(ENTITY_TYPE), two_level_template());
        let now = Utc::now();

        let submitted = harness
            .service
            .submit(entity("PO-1015"), SubmissionContext::default(), UserId::new("u-s"), now)
            .await
            .expect("submit");
        let id = submitted.instance_id;
        harness
            .service
            .decide(&id, UserId::new("u-x"), DecisionKind::Approve, None, now)
            .await
            .expect("first approver");

        // Two drivers race to record the step's last missing approval.
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let service = harness.service.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    service
                        .decide(&id, UserId::new("u-y"), DecisionKind::Approve, None, now)
                        .await
                })
            })
            .collect();
        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.expect("join"));
        }

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let loser = results.into_iter().find(Result::is_err).expect("one loser").unwrap_err();
        assert!(
            matches!(
                loser,
                EngineError::ConcurrentModification { .. }
                    | EngineError::Transition(
                        crate::machine::TransitionError::DuplicateDecision { .. }
                    )
                    | EngineError::Transition(
                        crate::machine::TransitionError::ApproverNotEligible { .. }
                    )
            ),
            "unexpected loser error: {loser:?}"
        );

        let summary = harness.service.get_instance(&id).await.expect("summary");
        assert_eq!(summary.status, InstanceStatus::Pending);
        assert_eq!(summary.current_step_id.as_deref(), Some("director"));
        assert_eq!(summary.steps[0].decisions, 2);

        let history = harness.service.history(&id).await.expect("history");
        let manager_completions = history
            .iter()
            .filter(|e| {
                e.kind == AuditKind::StepCompleted
                    && e.metadata.get("step_id").map(String::as_str) == Some("manager")
            })
            .count();
        assert_eq!(manager_completions, 1);
        harness.service.verify(&id).await.expect("verify");
    }

    #[tokio::test]
    async fn unknown_instance_lookups_fail_cleanly() {
        let harness = harness(RecordingAdapter::new(ENTITY_TYPE), two_level_template());
        let missing = crate::domain::instance::InstanceId("no-such".to_string());

        let error = harness.service.get_instance(&missing).await.expect_err("missing");
        assert!(matches!(error, EngineError::InstanceNotFound { .. }));
        assert_eq!(error.category(), ErrorCategory::State);
    }
}
