use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{AuditKind, EventRecord};
use crate::directory::{ApproverDirectory, DirectoryError};
use crate::domain::context::SubmissionContext;
use crate::domain::entity::{EntityRef, UserId};
use crate::domain::instance::{
    ApprovalInstance, Decision, DecisionKind, Delegation, DelegationReason, DispatchState,
    InstanceId, InstanceStatus, StepExecution, StepStatus,
};
use crate::domain::template::{ApprovalTemplate, StepMode};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("instance `{instance_id}` is not pending (status: {status:?})")]
    InstanceNotPending { instance_id: InstanceId, status: InstanceStatus },
    #[error("approver `{approver}` is not eligible for step `{step_id}` of instance `{instance_id}`")]
    ApproverNotEligible { instance_id: InstanceId, approver: UserId, step_id: String },
    #[error("approver `{approver}` already decided step `{step_id}` of instance `{instance_id}`")]
    DuplicateDecision { instance_id: InstanceId, approver: UserId, step_id: String },
    #[error("step `{step_id}` is not the current step of instance `{instance_id}`")]
    StepNotCurrent { instance_id: InstanceId, step_id: String },
    #[error("delegate `{to}` is already eligible for step `{step_id}` of instance `{instance_id}`")]
    DelegateConflict { instance_id: InstanceId, to: UserId, step_id: String },
    #[error("requester `{requester}` may not cancel instance `{instance_id}`")]
    CancelDenied { instance_id: InstanceId, requester: UserId },
    #[error("step `{step_id}` of instance `{instance_id}` resolved to an empty eligible set")]
    EmptyEligibleSet { instance_id: InstanceId, step_id: String },
    #[error("instance `{instance_id}` has no active step")]
    NoActiveStep { instance_id: InstanceId },
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// Result of one successful transition: the updated aggregate plus the
/// event material the caller must append to the audit log.
#[derive(Clone, Debug)]
pub struct TransitionOutcome {
    pub instance: ApprovalInstance,
    pub events: Vec<EventRecord>,
}

/// Creates a new instance at step 0 (or deeper, if leading steps
/// auto-skip; an all-skip template goes terminal APPROVED immediately).
pub fn submit_instance(
    id: InstanceId,
    entity: EntityRef,
    template: ApprovalTemplate,
    context: SubmissionContext,
    submitted_by: UserId,
    directory: &dyn ApproverDirectory,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, TransitionError> {
    let mut instance = ApprovalInstance {
        id: id.clone(),
        entity: entity.clone(),
        template,
        context,
        status: InstanceStatus::Pending,
        current_step: None,
        steps: Vec::new(),
        dispatch: DispatchState::NotRequired,
        created_by: submitted_by.clone(),
        created_at: now,
        updated_at: now,
        revision: 1,
    };

    let mut events = vec![EventRecord::new(AuditKind::Submitted, submitted_by.0.clone(), now)
        .with_metadata("entity_type", entity.entity_type.0.clone())
        .with_metadata("entity_id", entity.entity_id.0.clone())
        .with_metadata("template_id", instance.template.id.clone())
        .with_metadata("template_version", instance.template.version.to_string())];

    enter_step(&mut instance, 0, directory, now, &mut events)?;

    Ok(TransitionOutcome { instance, events })
}

/// Records one approver decision on the current step and evaluates step
/// completion per the step's mode.
pub fn apply_decision(
    mut instance: ApprovalInstance,
    approver: UserId,
    kind: DecisionKind,
    comment: Option<String>,
    directory: &dyn ApproverDirectory,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, TransitionError> {
    ensure_pending(&instance)?;

    let index = instance
        .current_step
        .ok_or_else(|| TransitionError::NoActiveStep { instance_id: instance.id.clone() })?;
    let step = instance
        .template
        .steps
        .get(index)
        .cloned()
        .ok_or_else(|| TransitionError::NoActiveStep { instance_id: instance.id.clone() })?;
    let exec_pos = instance
        .steps
        .iter()
        .position(|exec| exec.step_id == step.id)
        .ok_or_else(|| TransitionError::NoActiveStep { instance_id: instance.id.clone() })?;

    let mut events = Vec::new();
    let completion = {
        let instance_id = instance.id.clone();
        let exec = &mut instance.steps[exec_pos];

        let eligible_now = match step.mode {
            StepMode::SerialAny => exec.eligible.get(exec.serial_cursor) == Some(&approver),
            _ => exec.eligible.contains(&approver),
        };
        if !eligible_now {
            return Err(TransitionError::ApproverNotEligible {
                instance_id,
                approver,
                step_id: step.id,
            });
        }
        if exec.has_decision_from(&approver) {
            return Err(TransitionError::DuplicateDecision {
                instance_id,
                approver,
                step_id: step.id,
            });
        }

        exec.decisions.push(Decision {
            decision_id: Uuid::new_v4().to_string(),
            approver: approver.clone(),
            kind,
            comment: comment.clone(),
            decided_at: now,
        });

        let mut decided = EventRecord::new(AuditKind::Decided, approver.0.clone(), now)
            .with_metadata("step_id", step.id.clone())
            .with_metadata(
                "decision",
                match kind {
                    DecisionKind::Approve => "approve",
                    DecisionKind::Reject => "reject",
                },
            );
        if let Some(comment) = &comment {
            decided = decided.with_metadata("comment", comment.clone());
        }
        events.push(decided);

        let total = exec.eligible.len();
        match (step.mode, kind) {
            (StepMode::All, DecisionKind::Reject) | (StepMode::SerialAny, DecisionKind::Reject) => {
                Some(StepStatus::Rejected)
            }
            (StepMode::Any, DecisionKind::Reject) => {
                (exec.rejections() == total).then_some(StepStatus::Rejected)
            }
            (StepMode::All, DecisionKind::Approve) => {
                (exec.approvals() == total).then_some(StepStatus::Approved)
            }
            (StepMode::Any, DecisionKind::Approve) => Some(StepStatus::Approved),
            (StepMode::SerialAny, DecisionKind::Approve) => {
                exec.serial_cursor += 1;
                (exec.serial_cursor >= total).then_some(StepStatus::Approved)
            }
        }
    };

    if let Some(step_status) = completion {
        let exec = &mut instance.steps[exec_pos];
        exec.status = step_status;
        exec.completed_at = Some(now);
        events.push(
            EventRecord::new(AuditKind::StepCompleted, "engine", now)
                .with_metadata("step_id", step.id.clone())
                .with_metadata("status", step_status.as_str()),
        );

        match step_status {
            StepStatus::Rejected => {
                finalize(&mut instance, InstanceStatus::Rejected, now, &mut events, &[]);
            }
            StepStatus::Approved => {
                enter_step(&mut instance, index + 1, directory, now, &mut events)?;
            }
            StepStatus::Pending | StepStatus::Skipped => {}
        }
    }

    instance.revision += 1;
    instance.updated_at = now;
    Ok(TransitionOutcome { instance, events })
}

/// Terminal CANCELLED. Capability (submitter or adapter-approved override)
/// is resolved by the caller and passed in as `allowed`.
pub fn apply_cancel(
    mut instance: ApprovalInstance,
    requester: UserId,
    reason: Option<String>,
    allowed: bool,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, TransitionError> {
    ensure_pending(&instance)?;
    if !allowed {
        return Err(TransitionError::CancelDenied { instance_id: instance.id.clone(), requester });
    }

    let mut extras = vec![("requested_by", requester.0.clone())];
    if let Some(reason) = reason {
        extras.push(("reason", reason));
    }

    let mut events = Vec::new();
    finalize(&mut instance, InstanceStatus::Cancelled, now, &mut events, &extras);
    instance.revision += 1;
    instance.updated_at = now;
    Ok(TransitionOutcome { instance, events })
}

/// Swaps `from` for `to` in the current step's frozen eligible set. Not a
/// decision: it neither approves nor advances anything.
pub fn apply_delegation(
    mut instance: ApprovalInstance,
    from: UserId,
    to: UserId,
    step_id: &str,
    reason: DelegationReason,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome, TransitionError> {
    ensure_pending(&instance)?;

    let instance_id = instance.id.clone();
    let current_id = instance
        .current_step_definition()
        .map(|step| step.id.clone())
        .ok_or_else(|| TransitionError::NoActiveStep { instance_id: instance_id.clone() })?;
    if current_id != step_id {
        return Err(TransitionError::StepNotCurrent {
            instance_id,
            step_id: step_id.to_string(),
        });
    }

    let exec = instance
        .current_step_execution_mut()
        .ok_or_else(|| TransitionError::NoActiveStep { instance_id: instance_id.clone() })?;

    let Some(position) = exec.eligible.iter().position(|user| user == &from) else {
        return Err(TransitionError::ApproverNotEligible {
            instance_id,
            approver: from,
            step_id: step_id.to_string(),
        });
    };
    if exec.has_decision_from(&from) {
        return Err(TransitionError::DuplicateDecision {
            instance_id,
            approver: from,
            step_id: step_id.to_string(),
        });
    }
    if exec.eligible.contains(&to) {
        return Err(TransitionError::DelegateConflict {
            instance_id,
            to,
            step_id: step_id.to_string(),
        });
    }

    exec.eligible[position] = to.clone();
    exec.delegations.push(Delegation {
        from: from.clone(),
        to: to.clone(),
        reason,
        delegated_at: now,
    });

    let mut events = vec![EventRecord::new(AuditKind::Delegated, from.0.clone(), now)
        .with_metadata("step_id", step_id.to_string())
        .with_metadata("from", from.0.clone())
        .with_metadata("to", to.0.clone())
        .with_metadata(
            "reason",
            match reason {
                DelegationReason::Manual => "manual",
                DelegationReason::Escalation => "escalation",
            },
        )];
    if reason == DelegationReason::Escalation {
        events.push(
            EventRecord::new(AuditKind::Escalated, "scheduler", now)
                .with_metadata("step_id", step_id.to_string())
                .with_metadata("from", from.0)
                .with_metadata("to", to.0),
        );
    }

    instance.revision += 1;
    instance.updated_at = now;
    Ok(TransitionOutcome { instance, events })
}

fn ensure_pending(instance: &ApprovalInstance) -> Result<(), TransitionError> {
    if instance.status.is_terminal() {
        return Err(TransitionError::InstanceNotPending {
            instance_id: instance.id.clone(),
            status: instance.status,
        });
    }
    Ok(())
}

/// Enters the step at `index`, applying auto-skip recursion. Runs off the
/// template's end into terminal APPROVED.
fn enter_step(
    instance: &mut ApprovalInstance,
    start_index: usize,
    directory: &dyn ApproverDirectory,
    now: DateTime<Utc>,
    events: &mut Vec<EventRecord>,
) -> Result<(), TransitionError> {
    let mut index = start_index;
    loop {
        let Some(step) = instance.template.steps.get(index).cloned() else {
            finalize(instance, InstanceStatus::Approved, now, events, &[]);
            return Ok(());
        };

        if step.skip_when.as_ref().is_some_and(|rule| rule.satisfied_by(&instance.context)) {
            instance.steps.push(StepExecution {
                step_id: step.id.clone(),
                status: StepStatus::Skipped,
                eligible: Vec::new(),
                serial_cursor: 0,
                decisions: Vec::new(),
                delegations: Vec::new(),
                entered_at: now,
                completed_at: Some(now),
            });
            events.push(
                EventRecord::new(AuditKind::StepEntered, "engine", now)
                    .with_metadata("step_id", step.id.clone())
                    .with_metadata("step_index", index.to_string())
                    .with_metadata("skipped", "true"),
            );
            events.push(
                EventRecord::new(AuditKind::StepCompleted, "engine", now)
                    .with_metadata("step_id", step.id)
                    .with_metadata("status", StepStatus::Skipped.as_str()),
            );
            index += 1;
            continue;
        }

        let eligible = directory.resolve(&step.selector)?;
        if eligible.is_empty() {
            return Err(TransitionError::EmptyEligibleSet {
                instance_id: instance.id.clone(),
                step_id: step.id,
            });
        }

        let approvers = eligible
            .iter()
            .map(|user| user.0.as_str())
            .collect::<Vec<_>>()
            .join(",");
        instance.steps.push(StepExecution {
            step_id: step.id.clone(),
            status: StepStatus::Pending,
            eligible,
            serial_cursor: 0,
            decisions: Vec::new(),
            delegations: Vec::new(),
            entered_at: now,
            completed_at: None,
        });
        instance.current_step = Some(index);
        events.push(
            EventRecord::new(AuditKind::StepEntered, "engine", now)
                .with_metadata("step_id", step.id)
                .with_metadata("step_index", index.to_string())
                .with_metadata("approvers", approvers),
        );
        return Ok(());
    }
}

/// Terminal transition. Setting the dispatch flag here, in the same write
/// as the status change, is what makes side-effect dispatch exactly-once.
fn finalize(
    instance: &mut ApprovalInstance,
    status: InstanceStatus,
    now: DateTime<Utc>,
    events: &mut Vec<EventRecord>,
    extras: &[(&str, String)],
) {
    instance.status = status;
    instance.current_step = None;
    instance.dispatch =
        DispatchState::Pending { attempts: 0, next_attempt_at: now, last_error: None };

    let kind = match status {
        InstanceStatus::Approved => AuditKind::Approved,
        InstanceStatus::Rejected => AuditKind::Rejected,
        InstanceStatus::Cancelled => AuditKind::Cancelled,
        InstanceStatus::Pending => return,
    };
    let mut event = EventRecord::new(kind, "engine", now)
        .with_metadata("final_status", status.as_str());
    for (key, value) in extras {
        event = event.with_metadata(*key, value.clone());
    }
    events.push(event);
}
