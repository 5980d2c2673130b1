//! Authorization and enrollment error taxonomy.
//!
//! Business failures are returned as `AuthError` variants and translated by the
//! HTTP harness into a status plus a coarse public category. Infrastructure faults
//! collapse into `Unavailable` so every gate fails closed.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::credentials::StoreError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("expired token")]
    ExpiredToken,
    #[error("revoked token")]
    RevokedToken,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("department mismatch")]
    DepartmentMismatch,
    #[error("MFA required")]
    MfaRequired,
    #[error("MFA not enrolled")]
    MfaNotEnrolled,
    #[error("invalid MFA code")]
    MfaInvalidCode,
    #[error("too many MFA attempts")]
    MfaRateLimited,
    #[error("enrollment session expired")]
    EnrollmentExpired,
    #[error("credential already registered")]
    EnrollmentConflict,
    #[error("enrollment failed: {0}")]
    EnrollmentFailed(String),
    #[error("no enrollment in progress")]
    EnrollmentNotFound,
    #[error("enrollment is not in a state that accepts this step")]
    EnrollmentStateMismatch,
    #[error("backup code already used")]
    BackupCodeAlreadyUsed,
    #[error("authenticator sign counter regressed")]
    CloneDetected,
    #[error("authorization backend unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    /// Public category disclosed to clients. Never carries internal detail.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidToken | Self::ExpiredToken | Self::RevokedToken | Self::CloneDetected => {
                "unauthorized"
            }
            Self::PermissionDenied(_) | Self::DepartmentMismatch => "forbidden",
            Self::MfaRequired | Self::BackupCodeAlreadyUsed => "mfa_required",
            Self::MfaNotEnrolled => "mfa_not_enrolled",
            Self::MfaInvalidCode => "invalid_code",
            Self::MfaRateLimited => "rate_limited",
            Self::EnrollmentExpired => "enrollment_expired",
            Self::EnrollmentConflict => "enrollment_conflict",
            Self::EnrollmentFailed(_) => "enrollment_failed",
            Self::EnrollmentNotFound => "enrollment_not_found",
            Self::EnrollmentStateMismatch => "invalid_state",
            Self::Unavailable(_) => "unavailable",
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidToken | Self::ExpiredToken | Self::RevokedToken | Self::CloneDetected => {
                StatusCode::UNAUTHORIZED
            }
            Self::PermissionDenied(_)
            | Self::DepartmentMismatch
            | Self::MfaRequired
            | Self::MfaNotEnrolled
            | Self::BackupCodeAlreadyUsed => StatusCode::FORBIDDEN,
            Self::MfaInvalidCode | Self::EnrollmentFailed(_) => StatusCode::BAD_REQUEST,
            Self::MfaRateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::EnrollmentExpired => StatusCode::GONE,
            Self::EnrollmentConflict | Self::EnrollmentStateMismatch => StatusCode::CONFLICT,
            Self::EnrollmentNotFound => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// True for faults that are not a decision about the caller.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// JSON body of every deny response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.category(),
        };
        (self.status(), Json(body)).into_response()
    }
}
