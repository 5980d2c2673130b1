//! Identity types shared by every gate: users, principals, roles and departments.
//!
//! A `User` is the durable record kept by the user directory. A `Principal` is
//! rebuilt for every request by the authentication gateway and never persisted.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt,
    sync::{Arc, Mutex},
};
use utoipa::ToSchema;
use uuid::Uuid;

/// Organizational department that owns resources (e.g. `MOH`, `MOA`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(try_from = "String", into = "String")]
#[schema(value_type = String, example = "MOH")]
pub struct DepartmentId(String);

impl DepartmentId {
    /// Parse a department identifier, normalizing case and surrounding whitespace.
    ///
    /// # Errors
    /// Returns an error when the identifier is empty or contains characters
    /// outside `[A-Z0-9_-]`.
    pub fn parse(value: &str) -> Result<Self, String> {
        let normalized = value.trim().to_ascii_uppercase();
        let valid = Regex::new(r"^[A-Z0-9_-]{1,32}$").is_ok_and(|re| re.is_match(&normalized));
        if valid {
            Ok(Self(normalized))
        } else {
            Err(format!("invalid department id: {value:?}"))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DepartmentId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DepartmentId> for String {
    fn from(value: DepartmentId) -> Self {
        value.0
    }
}

impl fmt::Display for DepartmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role name as configured in the role policy (e.g. `fleet_admin`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
#[schema(value_type = String, example = "fleet_admin")]
pub struct Role(String);

impl Role {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(name.trim().to_ascii_lowercase())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable identity record held by the user directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub department: DepartmentId,
    pub roles: BTreeSet<Role>,
    #[serde(default)]
    pub clearance_level: u8,
    /// Flipped to `true` only by a committed MFA enrollment.
    #[serde(default)]
    pub mfa_enrolled: bool,
}

impl User {
    #[must_use]
    pub fn new(id: Uuid, department: DepartmentId, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            id,
            department,
            roles: roles.into_iter().collect(),
            clearance_level: 0,
            mfa_enrolled: false,
        }
    }

    #[must_use]
    pub fn with_clearance_level(mut self, level: u8) -> Self {
        self.clearance_level = level;
        self
    }
}

/// Runtime identity resolved for a single request.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct Principal {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub roles: BTreeSet<Role>,
    pub department: DepartmentId,
    pub clearance_level: u8,
    /// True only when this session passed a second factor and the user is enrolled.
    pub mfa_satisfied: bool,
}

impl Principal {
    #[must_use]
    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }
}

/// Source of the current time, injectable so TTLs and TOTP windows are testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map_or_else(|poisoned| *poisoned.into_inner(), |now| *now)
    }
}
