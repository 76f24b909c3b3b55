use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::context::SubmissionContext;
use crate::domain::entity::EntityType;
use crate::domain::template::ApprovalTemplate;

/// One candidate-selection rule for an entity type. All present conditions
/// must hold for the rule to match.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRule {
    pub id: String,
    /// Explicit evaluation priority; lower wins. Never insertion order.
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_stage: Option<String>,
    #[serde(default)]
    pub rush_only: bool,
    pub template: ApprovalTemplate,
}

impl TemplateRule {
    fn matches(&self, context: &SubmissionContext) -> bool {
        if let Some(min_amount) = self.min_amount {
            match context.amount {
                Some(amount) if amount >= min_amount => {}
                _ => return false,
            }
        }

        if let Some(department_id) = &self.department_id {
            match context.department_id.as_deref() {
                Some(department) if department.eq_ignore_ascii_case(department_id) => {}
                _ => return false,
            }
        }

        if let Some(project_stage) = &self.project_stage {
            match context.project_stage.as_deref() {
                Some(stage) if stage.eq_ignore_ascii_case(project_stage) => {}
                _ => return false,
            }
        }

        if self.rush_only && !context.is_rush {
            return false;
        }

        true
    }

    fn specificity(&self) -> usize {
        usize::from(self.min_amount.is_some())
            + usize::from(self.department_id.is_some())
            + usize::from(self.project_stage.is_some())
            + usize::from(self.rush_only)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolverError {
    #[error("no matching approval template for entity type `{entity_type}`")]
    NoMatchingTemplate { entity_type: EntityType },
    #[error("duplicate template rule `{rule_id}` for entity type `{entity_type}`")]
    DuplicateRule { entity_type: EntityType, rule_id: String },
    #[error("invalid template for entity type `{entity_type}`: {reason}")]
    InvalidTemplate { entity_type: EntityType, reason: String },
}

/// Ordered-rule template catalog. Like the adapter registry it is built at
/// startup and read-only afterwards; resolution is a pure lookup.
#[derive(Clone, Debug, Default)]
pub struct TemplateCatalog {
    rules_by_type: HashMap<String, Vec<TemplateRule>>,
    defaults_by_type: HashMap<String, ApprovalTemplate>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_rule(
        &mut self,
        entity_type: &EntityType,
        rule: TemplateRule,
    ) -> Result<(), ResolverError> {
        rule.template.validate().map_err(|reason| ResolverError::InvalidTemplate {
            entity_type: entity_type.clone(),
            reason,
        })?;

        let rules = self.rules_by_type.entry(entity_type.key()).or_default();
        if rules.iter().any(|existing| existing.id == rule.id) {
            return Err(ResolverError::DuplicateRule {
                entity_type: entity_type.clone(),
                rule_id: rule.id,
            });
        }
        rules.push(rule);
        Ok(())
    }

    pub fn set_default(
        &mut self,
        entity_type: &EntityType,
        template: ApprovalTemplate,
    ) -> Result<(), ResolverError> {
        template.validate().map_err(|reason| ResolverError::InvalidTemplate {
            entity_type: entity_type.clone(),
            reason,
        })?;
        self.defaults_by_type.insert(entity_type.key(), template);
        Ok(())
    }

    /// First matching rule in (priority, specificity desc, id) order wins;
    /// the per-type default applies only when no rule matches. No match and
    /// no default is a configuration error surfaced to the caller.
    pub fn resolve(
        &self,
        entity_type: &EntityType,
        context: &SubmissionContext,
    ) -> Result<ApprovalTemplate, ResolverError> {
        let key = entity_type.key();

        if let Some(rules) = self.rules_by_type.get(&key) {
            let mut matches: Vec<&TemplateRule> =
                rules.iter().filter(|rule| rule.matches(context)).collect();
            matches.sort_by(|left, right| {
                left.priority
                    .cmp(&right.priority)
                    .then_with(|| right.specificity().cmp(&left.specificity()))
                    .then_with(|| left.id.cmp(&right.id))
            });
            if let Some(rule) = matches.first() {
                return Ok(rule.template.clone());
            }
        }

        self.defaults_by_type
            .get(&key)
            .cloned()
            .ok_or_else(|| ResolverError::NoMatchingTemplate { entity_type: entity_type.clone() })
    }
}
