use std::collections::HashMap;

use thiserror::Error;

use crate::domain::entity::UserId;
use crate::domain::template::ApproverSelector;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("unknown approver role `{role}`")]
    UnknownRole { role: String },
    #[error("approver role `{role}` resolved to no members")]
    EmptyRole { role: String },
}

/// Identity-provider seam: maps a step's approver selector to the concrete
/// ordered user list frozen into the step execution at entry. The engine
/// calls this as a pure function and never manages authentication itself.
pub trait ApproverDirectory: Send + Sync {
    fn resolve(&self, selector: &ApproverSelector) -> Result<Vec<UserId>, DirectoryError>;
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryDirectory {
    members_by_role: HashMap<String, Vec<UserId>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Member order is preserved; serial-any steps approve in this order.
    pub fn with_role(mut self, role: impl Into<String>, members: Vec<UserId>) -> Self {
        self.members_by_role.insert(role.into().to_ascii_lowercase(), members);
        self
    }
}

impl ApproverDirectory for InMemoryDirectory {
    fn resolve(&self, selector: &ApproverSelector) -> Result<Vec<UserId>, DirectoryError> {
        match selector {
            ApproverSelector::Users { users } => Ok(users.clone()),
            ApproverSelector::Role { role } => {
                let members = self
                    .members_by_role
                    .get(&role.to_ascii_lowercase())
                    .ok_or_else(|| DirectoryError::UnknownRole { role: role.clone() })?;
                if members.is_empty() {
                    return Err(DirectoryError::EmptyRole { role: role.clone() });
                }
                Ok(members.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ApproverDirectory, DirectoryError, InMemoryDirectory};
    use crate::domain::entity::UserId;
    use crate::domain::template::ApproverSelector;

    #[test]
    fn explicit_user_lists_resolve_verbatim() {
        let directory = InMemoryDirectory::new();
        let users = vec![UserId::new("u-a"), UserId::new("u-b")];

        let resolved = directory
            .resolve(&ApproverSelector::Users { users: users.clone() })
            .expect("resolution");
        assert_eq!(resolved, users);
    }

    #[test]
    fn role_resolution_preserves_member_order() {
        let directory = InMemoryDirectory::new().with_role(
            "finance_approvers",
            vec![UserId::new("u-junior"), UserId::new("u-senior")],
        );

        let resolved = directory
            .resolve(&ApproverSelector::Role { role: "Finance_Approvers".to_string() })
            .expect("resolution");
        assert_eq!(resolved, vec![UserId::new("u-junior"), UserId::new("u-senior")]);
    }

    #[test]
    fn unknown_and_empty_roles_are_configuration_errors() {
        let directory = InMemoryDirectory::new().with_role("empty", Vec::new());

        assert!(matches!(
            directory.resolve(&ApproverSelector::Role { role: "ghosts".to_string() }),
            Err(DirectoryError::UnknownRole { .. })
        ));
        assert!(matches!(
            directory.resolve(&ApproverSelector::Role { role: "empty".to_string() }),
            Err(DirectoryError::EmptyRole { .. })
        ));
    }
}
