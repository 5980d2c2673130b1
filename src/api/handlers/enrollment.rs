//! MFA enrollment endpoints.
//!
//! The client only drives the server-held state machine: every response
//! carries the current state, and secrets or challenges appear once.

use axum::{
    Json,
    extract::{Extension, State},
};
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::{
    enrollment::{EnrollmentMethod, EnrollmentState, StartPayload},
    error::{AuthError, ErrorBody},
    identity::Principal,
    service::AuthorizationService,
};

#[derive(ToSchema, Deserialize, Debug)]
pub struct StartRequest {
    pub method: EnrollmentMethod,
}

#[derive(ToSchema, Serialize, Debug)]
pub struct StartResponse {
    pub state: EnrollmentState,
    pub method: EnrollmentMethod,
    pub expires_at: DateTime<Utc>,
    /// WebAuthn creation options for `navigator.credentials.create`.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub challenge: Option<Value>,
    /// Base32 TOTP secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioning_uri: Option<String>,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct VerifyTotpRequest {
    pub code: String,
}

#[derive(ToSchema, Serialize, Debug)]
pub struct VerifyTotpResponse {
    pub state: EnrollmentState,
    /// Shown once; only hashes are kept.
    pub backup_codes: Vec<String>,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct WebauthnVerifyRequest {
    /// `PublicKeyCredential` returned by the browser.
    #[serde(alias = "assertion")]
    #[schema(value_type = Object)]
    pub credential: Value,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct StateResponse {
    pub state: EnrollmentState,
}

#[derive(ToSchema, Serialize, Debug)]
pub struct StatusResponse {
    pub state: EnrollmentState,
    pub method: Option<EnrollmentMethod>,
    pub started_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[utoipa::path(
    get,
    path = "/v1/mfa/enrollment",
    responses(
        (status = 200, description = "Current enrollment state", body = StatusResponse),
        (status = 401, description = "Missing, expired or revoked session", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "enrollment"
)]
pub async fn status(
    State(service): State<Arc<AuthorizationService>>,
    Extension(principal): Extension<Principal>,
) -> Json<StatusResponse> {
    let status = service.enrollment_status(&principal).await;
    Json(StatusResponse {
        state: status.state,
        method: status.method,
        started_at: status.started_at,
        expires_at: status.expires_at,
    })
}

#[utoipa::path(
    delete,
    path = "/v1/mfa/enrollment",
    responses(
        (status = 200, description = "Enrollment abandoned", body = StateResponse),
        (status = 404, description = "No enrollment in progress", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "enrollment"
)]
pub async fn cancel(
    State(service): State<Arc<AuthorizationService>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<StateResponse>, AuthError> {
    let state = service.cancel_enrollment(&principal).await?;
    Ok(Json(StateResponse { state }))
}

#[utoipa::path(
    post,
    path = "/v1/mfa/enrollment/start",
    request_body = StartRequest,
    responses(
        (status = 200, description = "Enrollment started; any earlier attempt is discarded", body = StartResponse),
        (status = 400, description = "Security key challenge could not be built", body = ErrorBody),
        (status = 401, description = "Missing, expired or revoked session", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "enrollment"
)]
pub async fn start(
    State(service): State<Arc<AuthorizationService>>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>, AuthError> {
    let started = service
        .start_enrollment(&principal, request.method)
        .await?;

    let mut response = StartResponse {
        state: started.state,
        method: started.method,
        expires_at: started.expires_at,
        challenge: None,
        secret: None,
        provisioning_uri: None,
    };
    match started.payload {
        StartPayload::Webauthn { challenge } => response.challenge = Some(challenge),
        StartPayload::Totp {
            secret,
            provisioning_uri,
        } => {
            response.secret = Some(secret.expose_secret().to_string());
            response.provisioning_uri = Some(provisioning_uri);
        }
    }
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/v1/mfa/enrollment/totp/ack",
    responses(
        (status = 200, description = "Secret acknowledged", body = StateResponse),
        (status = 409, description = "Not a TOTP enrollment", body = ErrorBody),
        (status = 410, description = "Enrollment expired", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "enrollment"
)]
pub async fn acknowledge(
    State(service): State<Arc<AuthorizationService>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<StateResponse>, AuthError> {
    let state = service.acknowledge_totp_secret(&principal).await?;
    Ok(Json(StateResponse { state }))
}

#[utoipa::path(
    post,
    path = "/v1/mfa/enrollment/totp/verify",
    request_body = VerifyTotpRequest,
    responses(
        (status = 200, description = "Code accepted, backup codes issued", body = VerifyTotpResponse),
        (status = 400, description = "Code did not match", body = ErrorBody),
        (status = 409, description = "Not awaiting a code", body = ErrorBody),
        (status = 410, description = "Enrollment expired", body = ErrorBody),
        (status = 429, description = "Too many attempts; enrollment abandoned", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "enrollment"
)]
pub async fn verify_totp(
    State(service): State<Arc<AuthorizationService>>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<VerifyTotpRequest>,
) -> Result<Json<VerifyTotpResponse>, AuthError> {
    let issued = service
        .verify_enrollment_totp(&principal, &request.code)
        .await?;
    Ok(Json(VerifyTotpResponse {
        state: issued.state,
        backup_codes: issued.codes,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/mfa/enrollment/commit",
    responses(
        (status = 200, description = "Factor committed", body = StateResponse),
        (status = 409, description = "Backup codes not issued yet", body = ErrorBody),
        (status = 503, description = "Credential store unavailable; retry", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "enrollment"
)]
pub async fn commit(
    State(service): State<Arc<AuthorizationService>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<StateResponse>, AuthError> {
    let state = service.commit_enrollment(&principal).await?;
    Ok(Json(StateResponse { state }))
}

#[utoipa::path(
    post,
    path = "/v1/mfa/enrollment/webauthn/verify",
    request_body = WebauthnVerifyRequest,
    responses(
        (status = 200, description = "Security key committed", body = StateResponse),
        (status = 400, description = "Registration ceremony rejected", body = ErrorBody),
        (status = 409, description = "Key bound to another account", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "enrollment"
)]
pub async fn verify_webauthn(
    State(service): State<Arc<AuthorizationService>>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<WebauthnVerifyRequest>,
) -> Result<Json<StateResponse>, AuthError> {
    let state = service
        .finish_webauthn_enrollment(&principal, &request.credential)
        .await?;
    Ok(Json(StateResponse { state }))
}
