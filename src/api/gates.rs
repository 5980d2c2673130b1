//! axum adapters for the authorization gates.
//!
//! Each middleware runs one gate and either continues with the request or
//! answers with the gate's terminal error. Route layers stack them in order:
//! `authenticate` first, then `require_mfa` or `require_department_access`,
//! then `audit` closest to the handler.

use axum::{
    Json,
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

use crate::{
    audit::AuditOutcome,
    error::{AuthError, ErrorBody},
    identity::{DepartmentId, Principal},
    service::{AuthorizationService, StepUpProof},
};

pub const SESSION_COOKIE_NAME: &str = "fleetgate_session";
pub const HEADER_STEP_UP_TOTP: &str = "x-mfa-totp";
pub const HEADER_STEP_UP_BACKUP_CODE: &str = "x-mfa-backup-code";

/// Resolve the bearer token or session cookie and attach the `Principal`.
pub async fn authenticate(
    State(service): State<Arc<AuthorizationService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = extract_session_token(request.headers());
    match service.authenticate_token(token.as_deref()).await {
        Ok(principal) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}

/// Demand a satisfied second factor, accepting an inline step-up proof from
/// the `x-mfa-totp` or `x-mfa-backup-code` header.
pub async fn require_mfa(
    State(service): State<Arc<AuthorizationService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(principal) = request.extensions().get::<Principal>().cloned() else {
        return AuthError::InvalidToken.into_response();
    };
    let proof = step_up_proof(request.headers());
    match service.require_mfa(&principal, proof).await {
        Ok(principal) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}

/// Department scoping for routes with a single `:department` segment.
pub async fn require_department_access(
    State(service): State<Arc<AuthorizationService>>,
    Path(department): Path<String>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(principal) = request.extensions().get::<Principal>().cloned() else {
        return AuthError::InvalidToken.into_response();
    };
    let Ok(department) = DepartmentId::parse(&department) else {
        debug!("Rejected malformed department id");
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "invalid_request",
            }),
        )
            .into_response();
    };
    match service
        .require_department_access(&principal, &department)
        .await
    {
        Ok(()) => {
            request.extensions_mut().insert(department);
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}

/// State for `audit`: the service plus the operation name to record.
#[derive(Clone)]
pub struct Audited {
    service: Arc<AuthorizationService>,
    operation: &'static str,
}

impl Audited {
    #[must_use]
    pub fn new(service: &Arc<AuthorizationService>, operation: &'static str) -> Self {
        Self {
            service: Arc::clone(service),
            operation,
        }
    }
}

/// Record one audit entry for the wrapped handler. A handler that panics or a
/// request dropped mid-flight is recorded as `SystemError` by the guard.
pub async fn audit(State(audited): State<Audited>, request: Request, next: Next) -> Response {
    let Some(principal) = request.extensions().get::<Principal>().cloned() else {
        return AuthError::InvalidToken.into_response();
    };
    let department = request.extensions().get::<DepartmentId>().cloned();
    let guard = audited
        .service
        .begin_audit(&principal, audited.operation, department);
    let response = next.run(request).await;
    guard.finish(outcome_for_status(response.status())).await;
    response
}

#[must_use]
pub fn outcome_for_status(status: StatusCode) -> AuditOutcome {
    if status.is_success() {
        AuditOutcome::Success
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        AuditOutcome::Denied
    } else if status.is_server_error() {
        AuditOutcome::SystemError
    } else {
        AuditOutcome::Failure
    }
}

fn step_up_proof(headers: &HeaderMap) -> Option<StepUpProof> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };
    header(HEADER_STEP_UP_TOTP)
        .map(StepUpProof::Totp)
        .or_else(|| header(HEADER_STEP_UP_BACKUP_CODE).map(StepUpProof::BackupCode))
}

/// Bearer token first, then the session cookie.
#[must_use]
pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = extract_bearer_token(headers) {
        return Some(token);
    }
    let value = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    value.split(';').find_map(|pair| {
        let (key, val) = pair.trim().split_once('=')?;
        (key.trim() == SESSION_COOKIE_NAME && !val.trim().is_empty())
            .then(|| val.trim().to_string())
    })
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
