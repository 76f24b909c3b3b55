use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::context::SubmissionContext;
use crate::domain::entity::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TemplateVersion(pub u32);

impl std::fmt::Display for TemplateVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// How many of a step's eligible approvers must act before the step
/// completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    /// Every eligible approver must approve; one reject short-circuits.
    All,
    /// First approve completes the step; rejection requires everyone.
    Any,
    /// One approver at a time, in the eligible set's order.
    SerialAny,
}

/// Where a step's eligible approvers come from. Resolved through the
/// identity directory when the step is entered, then frozen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApproverSelector {
    Users { users: Vec<UserId> },
    Role { role: String },
}

/// Predicate letting a step pass without approver involvement when the
/// frozen submission context satisfies it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipRule {
    /// Skip when the submission amount is strictly below the threshold.
    /// An absent amount never skips.
    AmountBelow { threshold: Decimal },
    /// Skip unless the submission is flagged rush.
    UnlessRush,
    /// Skip when the submission department differs from the named one.
    DepartmentIsNot { department_id: String },
}

impl SkipRule {
    pub fn satisfied_by(&self, context: &SubmissionContext) -> bool {
        match self {
            Self::AmountBelow { threshold } => {
                context.amount.is_some_and(|amount| amount < *threshold)
            }
            Self::UnlessRush => !context.is_rush,
            Self::DepartmentIsNot { department_id } => context
                .department_id
                .as_deref()
                .map_or(true, |department| !department.eq_ignore_ascii_case(department_id)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub mode: StepMode,
    pub selector: ApproverSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_when: Option<SkipRule>,
}

impl Step {
    pub fn new(id: impl Into<String>, mode: StepMode, selector: ApproverSelector) -> Self {
        Self { id: id.into(), mode, selector, skip_when: None }
    }

    pub fn with_skip_when(mut self, rule: SkipRule) -> Self {
        self.skip_when = Some(rule);
        self
    }
}

/// Immutable, versioned workflow definition. Instances freeze a full copy
/// at submission so later template edits never touch in-flight approvals.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalTemplate {
    pub id: String,
    pub version: TemplateVersion,
    pub steps: Vec<Step>,
}

impl ApprovalTemplate {
    pub fn new(id: impl Into<String>, version: u32, steps: Vec<Step>) -> Self {
        Self { id: id.into(), version: TemplateVersion(version), steps }
    }

    /// Structural validation applied when a template enters the catalog.
    pub fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err(format!("template `{}` has no steps", self.id));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(format!(
                    "template `{}` has duplicate step id `{}`",
                    self.id, step.id
                ));
            }
            if let ApproverSelector::Users { users } = &step.selector {
                if users.is_empty() {
                    return Err(format!(
                        "template `{}` step `{}` has an empty approver list",
                        self.id, step.id
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{ApprovalTemplate, ApproverSelector, SkipRule, Step, StepMode};
    use crate::domain::context::SubmissionContext;
    use crate::domain::entity::UserId;

    fn users(ids: &[&str]) -> ApproverSelector {
        ApproverSelector::Users { users: ids.iter().map(|id| UserId::new(*id)).collect() }
    }

    #[test]
    fn amount_below_skip_rule_requires_a_present_amount() {
        let rule = SkipRule::AmountBelow { threshold: Decimal::new(50_000, 2) };

        assert!(rule.satisfied_by(
            &SubmissionContext::default().with_amount(Decimal::new(10_000, 2))
        ));
        assert!(!rule.satisfied_by(
            &SubmissionContext::default().with_amount(Decimal::new(50_000, 2))
        ));
        assert!(!rule.satisfied_by(&SubmissionContext::default()));
    }

    #[test]
    fn unless_rush_skips_only_non_rush_submissions() {
        assert!(SkipRule::UnlessRush.satisfied_by(&SubmissionContext::default()));
        assert!(!SkipRule::UnlessRush.satisfied_by(&SubmissionContext::default().rush()));
    }

    #[test]
    fn department_mismatch_skip_rule_matches_other_departments() {
        let rule = SkipRule::DepartmentIsNot { department_id: "finance".to_string() };

        assert!(rule.satisfied_by(&SubmissionContext::default().with_department("sales")));
        assert!(!rule.satisfied_by(&SubmissionContext::default().with_department("Finance")));
        assert!(rule.satisfied_by(&SubmissionContext::default()));
    }

    #[test]
    fn template_validation_rejects_duplicate_step_ids() {
        let template = ApprovalTemplate::new(
            "po-standard",
            1,
            vec![
                Step::new("manager", StepMode::All, users(&["u-mgr"])),
                Step::new("manager", StepMode::Any, users(&["u-dir"])),
            ],
        );

        assert!(template.validate().is_err());
    }

    #[test]
    fn template_validation_rejects_empty_steps_and_empty_approver_lists() {
        assert!(ApprovalTemplate::new("empty", 1, Vec::new()).validate().is_err());

        let no_approvers = ApprovalTemplate::new(
            "po-standard",
            1,
            vec![Step::new("manager", StepMode::All, ApproverSelector::Users { users: vec![] })],
        );
        assert!(no_approvers.validate().is_err());
    }
}
