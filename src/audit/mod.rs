//! Append-only audit trail of sensitive operations and authorization decisions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;
use ulid::Ulid;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{credentials::StoreError, identity::DepartmentId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
    SystemError,
}

impl AuditOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Denied => "denied",
            Self::SystemError => "system_error",
        }
    }
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct AuditEntry {
    #[schema(value_type = String)]
    pub id: Ulid,
    pub actor_id: Option<Uuid>,
    pub operation: String,
    pub target_department: Option<DepartmentId>,
    pub outcome: AuditOutcome,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    #[must_use]
    pub fn new(
        actor_id: Option<Uuid>,
        operation: &str,
        target_department: Option<DepartmentId>,
        outcome: AuditOutcome,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            actor_id,
            operation: operation.to_string(),
            target_department,
            outcome,
            timestamp,
        }
    }
}

#[async_trait]
pub trait AuditRecorder: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), StoreError>;
}

/// Keeps entries in memory, in append order.
#[derive(Default)]
pub struct MemoryAuditRecorder {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl AuditRecorder for MemoryAuditRecorder {
    async fn record(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.entries.lock().await.push(entry);
        Ok(())
    }
}

/// Emits every entry on the `audit` tracing target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditRecorder;

#[async_trait]
impl AuditRecorder for TracingAuditRecorder {
    async fn record(&self, entry: AuditEntry) -> Result<(), StoreError> {
        info!(
            target: "audit",
            audit_id = %entry.id,
            actor_id = ?entry.actor_id,
            operation = %entry.operation,
            target_department = ?entry.target_department.as_ref().map(DepartmentId::as_str),
            outcome = entry.outcome.as_str(),
            timestamp = %entry.timestamp.to_rfc3339(),
            "audit"
        );
        Ok(())
    }
}
