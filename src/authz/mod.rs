//! Permission evaluation.
//!
//! `PermissionEvaluator::evaluate` is a pure function of the principal snapshot and
//! the requirement. Checks run in a fixed order (permission, role, department) and
//! the first deny wins.

pub mod policy;

use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, sync::Arc};
use utoipa::ToSchema;

pub use policy::RolePolicy;

use crate::{
    error::AuthError,
    identity::{DepartmentId, Principal, Role},
};

/// What a request needs from its principal. Unset parts are not checked.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Requirement {
    pub permission: Option<String>,
    pub any_of_roles: Option<BTreeSet<Role>>,
    pub resource_department: Option<DepartmentId>,
}

impl Requirement {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }

    #[must_use]
    pub fn any_of_roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.any_of_roles = Some(roles.into_iter().collect());
        self
    }

    #[must_use]
    pub fn department(mut self, department: DepartmentId) -> Self {
        self.resource_department = Some(department);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    UnknownPermission,
    MissingPermission,
    MissingRole,
    DepartmentMismatch,
}

impl DenyReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownPermission => "unknown_permission",
            Self::MissingPermission => "missing_permission",
            Self::MissingRole => "missing_role",
            Self::DepartmentMismatch => "department_mismatch",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    #[must_use]
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Convert a decision into the gate result the middleware short-circuits on.
    ///
    /// # Errors
    /// Returns `PermissionDenied` or `DepartmentMismatch` on deny.
    pub fn into_result(self, requirement: &Requirement) -> Result<(), AuthError> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny(DenyReason::DepartmentMismatch) => Err(AuthError::DepartmentMismatch),
            Self::Deny(reason) => {
                let detail = requirement
                    .permission
                    .clone()
                    .unwrap_or_else(|| reason.as_str().to_string());
                Err(AuthError::PermissionDenied(detail))
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct PermissionEvaluator {
    policy: Arc<RolePolicy>,
}

impl PermissionEvaluator {
    #[must_use]
    pub fn new(policy: Arc<RolePolicy>) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &RolePolicy {
        &self.policy
    }

    #[must_use]
    pub fn evaluate(&self, principal: &Principal, requirement: &Requirement) -> Decision {
        if let Some(permission) = requirement.permission.as_deref() {
            if !self.policy.is_known_permission(permission) {
                return Decision::Deny(DenyReason::UnknownPermission);
            }
            if !self.policy.grants(&principal.roles, permission) {
                return Decision::Deny(DenyReason::MissingPermission);
            }
        }

        if let Some(roles) = requirement.any_of_roles.as_ref() {
            if principal.roles.is_disjoint(roles) {
                return Decision::Deny(DenyReason::MissingRole);
            }
        }

        if let Some(department) = requirement.resource_department.as_ref() {
            if principal.department != *department
                && !self.policy.is_cross_department(&principal.roles)
            {
                return Decision::Deny(DenyReason::DepartmentMismatch);
            }
        }

        Decision::Allow
    }
}
