//! Static role → permission policy.
//!
//! The policy is loaded once at start and never edited at request time. Roles
//! listed under `cross_department` are the only override for department scoping.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::Path,
};

use crate::identity::Role;

pub const ROLE_SUPER_ADMIN: &str = "super_admin";
pub const ROLE_FLEET_ADMIN: &str = "fleet_admin";
pub const ROLE_FLEET_MANAGER: &str = "fleet_manager";
pub const ROLE_DISPATCHER: &str = "dispatcher";
pub const ROLE_VIEWER: &str = "viewer";

const DEFAULT_PERMISSIONS: &[&str] = &[
    "vehicles:read",
    "vehicles:write",
    "vehicles:delete",
    "facilities:read",
    "facilities:write",
    "facilities:delete",
    "departments:read",
    "departments:write",
    "personnel:read",
    "personnel:write",
    "personnel:delete",
    "audit:read",
];

/// On-disk policy shape.
///
/// ```json
/// {
///   "permissions": ["vehicles:read", "vehicles:write"],
///   "roles": { "dispatcher": ["vehicles:read"] },
///   "cross_department": ["super_admin"]
/// }
/// ```
#[derive(Debug, Deserialize)]
struct PolicyDocument {
    permissions: Vec<String>,
    roles: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    cross_department: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct RolePolicy {
    permissions: BTreeSet<String>,
    grants: HashMap<Role, BTreeSet<String>>,
    cross_department: BTreeSet<Role>,
}

impl RolePolicy {
    /// Built-in fleet administration policy.
    #[must_use]
    pub fn fleet_default() -> Self {
        let all: BTreeSet<String> = DEFAULT_PERMISSIONS.iter().map(ToString::to_string).collect();
        let pick = |names: &[&str]| -> BTreeSet<String> {
            names.iter().map(ToString::to_string).collect()
        };

        let mut grants = HashMap::new();
        grants.insert(Role::new(ROLE_SUPER_ADMIN), all.clone());
        grants.insert(
            Role::new(ROLE_FLEET_ADMIN),
            all.iter()
                .filter(|permission| !permission.starts_with("departments:write"))
                .cloned()
                .collect(),
        );
        grants.insert(
            Role::new(ROLE_FLEET_MANAGER),
            pick(&[
                "vehicles:read",
                "vehicles:write",
                "facilities:read",
                "facilities:write",
                "departments:read",
                "personnel:read",
                "personnel:write",
            ]),
        );
        grants.insert(
            Role::new(ROLE_DISPATCHER),
            pick(&[
                "vehicles:read",
                "vehicles:write",
                "facilities:read",
                "departments:read",
                "personnel:read",
            ]),
        );
        grants.insert(
            Role::new(ROLE_VIEWER),
            pick(&[
                "vehicles:read",
                "facilities:read",
                "departments:read",
                "personnel:read",
            ]),
        );

        Self {
            permissions: all,
            grants,
            cross_department: BTreeSet::from([Role::new(ROLE_SUPER_ADMIN)]),
        }
    }

    /// Load a policy from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if a role grants a
    /// permission that the policy does not declare.
    pub fn from_json(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read role policy {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("invalid role policy {}", path.display()))
    }

    /// Parse a policy document.
    ///
    /// # Errors
    /// Returns an error on malformed JSON or undeclared permissions.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let document: PolicyDocument = serde_json::from_str(raw)?;
        let permissions: BTreeSet<String> = document
            .permissions
            .iter()
            .map(|permission| permission.trim().to_string())
            .collect();

        let mut grants = HashMap::with_capacity(document.roles.len());
        for (role, granted) in document.roles {
            let granted: BTreeSet<String> =
                granted.iter().map(|p| p.trim().to_string()).collect();
            if let Some(undeclared) = granted.iter().find(|p| !permissions.contains(*p)) {
                bail!("role {role} grants undeclared permission {undeclared}");
            }
            grants.insert(Role::new(&role), granted);
        }

        let cross_department: BTreeSet<Role> = document
            .cross_department
            .iter()
            .map(|role| Role::new(role))
            .collect();
        if let Some(unknown) = cross_department.iter().find(|r| !grants.contains_key(*r)) {
            bail!("cross-department role {unknown} is not defined");
        }

        Ok(Self {
            permissions,
            grants,
            cross_department,
        })
    }

    #[must_use]
    pub fn is_known_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    /// True if any of `roles` grants `permission`.
    pub fn grants<'a>(&self, roles: impl IntoIterator<Item = &'a Role>, permission: &str) -> bool {
        roles.into_iter().any(|role| {
            self.grants
                .get(role)
                .is_some_and(|granted| granted.contains(permission))
        })
    }

    pub fn is_cross_department<'a>(&self, roles: impl IntoIterator<Item = &'a Role>) -> bool {
        roles
            .into_iter()
            .any(|role| self.cross_department.contains(role))
    }

    #[must_use]
    pub fn role_count(&self) -> usize {
        self.grants.len()
    }
}

impl Default for RolePolicy {
    fn default() -> Self {
        Self::fleet_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_has_single_cross_department_role() {
        let policy = RolePolicy::fleet_default();
        assert!(policy.is_cross_department([&Role::new(ROLE_SUPER_ADMIN)]));
        for role in [ROLE_FLEET_ADMIN, ROLE_FLEET_MANAGER, ROLE_DISPATCHER, ROLE_VIEWER] {
            assert!(!policy.is_cross_department([&Role::new(role)]), "{role}");
        }
    }

    #[test]
    fn viewer_cannot_write() {
        let policy = RolePolicy::fleet_default();
        let viewer = Role::new(ROLE_VIEWER);
        assert!(policy.grants([&viewer], "vehicles:read"));
        assert!(!policy.grants([&viewer], "vehicles:write"));
    }

    #[test]
    fn parses_policy_document() {
        let policy = RolePolicy::from_json_str(
            r#"{
                "permissions": ["a:read", "a:write"],
                "roles": { "Reader": ["a:read"], "root": ["a:read", "a:write"] },
                "cross_department": ["root"]
            }"#,
        )
        .unwrap();
        assert_eq!(policy.role_count(), 2);
        assert!(policy.grants([&Role::new("reader")], "a:read"));
        assert!(policy.is_cross_department([&Role::new("root")]));
        assert!(!policy.is_known_permission("b:read"));
    }

    #[test]
    fn rejects_undeclared_permission() {
        let err = RolePolicy::from_json_str(
            r#"{"permissions": ["a:read"], "roles": {"r": ["a:write"]}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("a:write"));
    }

    #[test]
    fn rejects_unknown_cross_department_role() {
        let result = RolePolicy::from_json_str(
            r#"{"permissions": [], "roles": {}, "cross_department": ["ghost"]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("fleetgate-policy-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{"permissions": ["x:read"], "roles": {"viewer": ["x:read"]}}"#,
        )
        .unwrap();
        let policy = RolePolicy::from_json(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(policy.grants([&Role::new("viewer")], "x:read"));
    }
}
