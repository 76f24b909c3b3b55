use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::context::SubmissionContext;
use crate::domain::entity::{EntityRef, UserId};
use crate::domain::template::{ApprovalTemplate, Step, TemplateVersion};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Approved,
    Rejected,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approve,
    Reject,
}

/// One approver action on one step. Immutable once recorded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub approver: UserId,
    pub kind: DecisionKind,
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationReason {
    Manual,
    Escalation,
}

/// Record of an eligible-set substitution on a step. Does not count as an
/// approval decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub from: UserId,
    pub to: UserId,
    pub reason: DelegationReason,
    pub delegated_at: DateTime<Utc>,
}

/// One step actually entered by an instance. The eligible set is resolved
/// once at entry and never re-derived, so a later org-chart change cannot
/// invalidate in-progress approvals.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_id: String,
    pub status: StepStatus,
    pub eligible: Vec<UserId>,
    /// Position of the currently eligible approver for serial-any steps.
    pub serial_cursor: usize,
    pub decisions: Vec<Decision>,
    pub delegations: Vec<Delegation>,
    pub entered_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    pub fn has_decision_from(&self, approver: &UserId) -> bool {
        self.decisions.iter().any(|decision| &decision.approver == approver)
    }

    pub fn approvals(&self) -> usize {
        self.decisions.iter().filter(|d| d.kind == DecisionKind::Approve).count()
    }

    pub fn rejections(&self) -> usize {
        self.decisions.iter().filter(|d| d.kind == DecisionKind::Reject).count()
    }
}

/// Side-effect delivery state for a terminal instance. `Pending` is set in
/// the same write as the terminal transition, which is what makes the
/// exactly-once dispatch guarantee hold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DispatchState {
    NotRequired,
    Pending {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: Option<String>,
    },
    Dispatched {
        attempts: u32,
        completed_at: DateTime<Utc>,
    },
    Failed {
        attempts: u32,
        last_error: String,
        failed_at: DateTime<Utc>,
    },
}

impl DispatchState {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRequired => "not_required",
            Self::Pending { .. } => "pending",
            Self::Dispatched { .. } => "dispatched",
            Self::Failed { .. } => "failed",
        }
    }
}

/// The mutable approval aggregate. Owned by the state machine; every
/// successful transition bumps `revision`, and stores reject writes whose
/// expected revision is stale.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalInstance {
    pub id: InstanceId,
    pub entity: EntityRef,
    pub template: ApprovalTemplate,
    pub context: SubmissionContext,
    pub status: InstanceStatus,
    /// Index into the frozen template's steps; `None` once terminal.
    pub current_step: Option<usize>,
    pub steps: Vec<StepExecution>,
    pub dispatch: DispatchState,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: u64,
}

impl ApprovalInstance {
    pub fn template_version(&self) -> TemplateVersion {
        self.template.version
    }

    pub fn current_step_definition(&self) -> Option<&Step> {
        self.current_step.and_then(|index| self.template.steps.get(index))
    }

    pub fn current_step_execution(&self) -> Option<&StepExecution> {
        let index = self.current_step?;
        let step = self.template.steps.get(index)?;
        self.steps.iter().find(|exec| exec.step_id == step.id)
    }

    pub fn current_step_execution_mut(&mut self) -> Option<&mut StepExecution> {
        let index = self.current_step?;
        let step_id = self.template.steps.get(index)?.id.clone();
        self.steps.iter_mut().find(|exec| exec.step_id == step_id)
    }

    /// Approvers who may act on the current step right now. For serial-any
    /// steps that is the single approver at the cursor.
    pub fn active_approvers(&self) -> Vec<UserId> {
        let Some(step) = self.current_step_definition() else {
            return Vec::new();
        };
        let Some(exec) = self.current_step_execution() else {
            return Vec::new();
        };
        match step.mode {
            crate::domain::template::StepMode::SerialAny => {
                exec.eligible.get(exec.serial_cursor).cloned().into_iter().collect()
            }
            _ => exec
                .eligible
                .iter()
                .filter(|approver| !exec.has_decision_from(approver))
                .cloned()
                .collect(),
        }
    }
}

/// Caller-facing projection of an instance, returned by the service API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub instance_id: InstanceId,
    pub entity: EntityRef,
    pub template_id: String,
    pub template_version: TemplateVersion,
    pub status: InstanceStatus,
    pub current_step: Option<usize>,
    pub current_step_id: Option<String>,
    pub steps: Vec<StepSummary>,
    pub revision: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_id: String,
    pub status: StepStatus,
    pub pending_approvers: Vec<UserId>,
    pub decisions: usize,
}

impl InstanceSummary {
    pub fn of(instance: &ApprovalInstance) -> Self {
        let active = instance.active_approvers();
        let current_step_id =
            instance.current_step_definition().map(|step| step.id.clone());
        let steps = instance
            .steps
            .iter()
            .map(|exec| StepSummary {
                step_id: exec.step_id.clone(),
                status: exec.status,
                pending_approvers: if Some(&exec.step_id) == current_step_id.as_ref() {
                    active.clone()
                } else {
                    Vec::new()
                },
                decisions: exec.decisions.len(),
            })
            .collect();

        Self {
            instance_id: instance.id.clone(),
            entity: instance.entity.clone(),
            template_id: instance.template.id.clone(),
            template_version: instance.template.version,
            status: instance.status,
            current_step: instance.current_step,
            current_step_id,
            steps,
            revision: instance.revision,
        }
    }
}
