//! Explicit step-up endpoints for sessions that have not yet passed a second
//! factor.

use axum::{
    Json,
    extract::{Extension, State},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::{
    error::{AuthError, ErrorBody},
    identity::Principal,
    service::{AuthorizationService, StepUpProof},
};

/// One of `totp` or `backup_code`. `totp` wins if both are sent.
#[derive(ToSchema, Deserialize, Debug, Default)]
pub struct StepUpRequest {
    pub totp: Option<String>,
    pub backup_code: Option<String>,
}

impl StepUpRequest {
    fn into_proof(self) -> Option<StepUpProof> {
        self.totp
            .map(StepUpProof::Totp)
            .or_else(|| self.backup_code.map(StepUpProof::BackupCode))
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct StepUpResponse {
    pub mfa_satisfied: bool,
}

#[derive(ToSchema, Serialize, Debug)]
pub struct WebauthnChallenge {
    /// WebAuthn request options for `navigator.credentials.get`.
    #[schema(value_type = Object)]
    pub challenge: Value,
}

#[derive(ToSchema, Deserialize, Debug)]
pub struct WebauthnAssertion {
    #[serde(alias = "assertion")]
    #[schema(value_type = Object)]
    pub credential: Value,
}

#[utoipa::path(
    post,
    path = "/v1/mfa/step-up",
    request_body = StepUpRequest,
    responses(
        (status = 200, description = "Session stepped up", body = StepUpResponse),
        (status = 403, description = "Code rejected, already used, or no factor enrolled", body = ErrorBody),
        (status = 429, description = "Too many attempts", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "step-up"
)]
pub async fn step_up(
    State(service): State<Arc<AuthorizationService>>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<StepUpRequest>,
) -> Result<Json<StepUpResponse>, AuthError> {
    let principal = service
        .require_mfa(&principal, request.into_proof())
        .await?;
    Ok(Json(StepUpResponse {
        mfa_satisfied: principal.mfa_satisfied,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/mfa/step-up/webauthn/start",
    responses(
        (status = 200, description = "Assertion challenge", body = WebauthnChallenge),
        (status = 403, description = "No security key enrolled", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "step-up"
)]
pub async fn webauthn_start(
    State(service): State<Arc<AuthorizationService>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<WebauthnChallenge>, AuthError> {
    let challenge = service.begin_webauthn_step_up(&principal).await?;
    Ok(Json(WebauthnChallenge { challenge }))
}

#[utoipa::path(
    post,
    path = "/v1/mfa/step-up/webauthn/finish",
    request_body = WebauthnAssertion,
    responses(
        (status = 200, description = "Session stepped up", body = StepUpResponse),
        (status = 401, description = "Authenticator counter regressed", body = ErrorBody),
        (status = 403, description = "Assertion rejected", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "step-up"
)]
pub async fn webauthn_finish(
    State(service): State<Arc<AuthorizationService>>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<WebauthnAssertion>,
) -> Result<Json<StepUpResponse>, AuthError> {
    let principal = service
        .finish_webauthn_step_up(&principal, &request.credential)
        .await?;
    Ok(Json(StepUpResponse {
        mfa_satisfied: principal.mfa_satisfied,
    }))
}
