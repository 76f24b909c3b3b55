use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Facts about the submission that drive template selection and auto-skip
/// evaluation. Frozen onto the instance at creation so later re-evaluation
/// always sees the values that routed it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionContext {
    pub amount: Option<Decimal>,
    pub department_id: Option<String>,
    pub project_stage: Option<String>,
    pub is_rush: bool,
}

impl SubmissionContext {
    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_department(mut self, department_id: impl Into<String>) -> Self {
        self.department_id = Some(department_id.into());
        self
    }

    pub fn with_project_stage(mut self, project_stage: impl Into<String>) -> Self {
        self.project_stage = Some(project_stage.into());
        self
    }

    pub fn rush(mut self) -> Self {
        self.is_rush = true;
        self
    }
}
