use axum::{Json, extract::Extension};

use crate::identity::Principal;

#[utoipa::path(
    get,
    path = "/v1/me",
    params(
        ("x-mfa-totp" = Option<String>, Header, description = "TOTP code for inline step-up"),
        ("x-mfa-backup-code" = Option<String>, Header, description = "Backup code for inline step-up")
    ),
    responses(
        (status = 200, description = "Caller's principal", body = Principal),
        (status = 401, description = "Missing, expired or revoked session", body = crate::error::ErrorBody),
        (status = 403, description = "Second factor required or not enrolled", body = crate::error::ErrorBody),
        (status = 429, description = "Too many step-up attempts", body = crate::error::ErrorBody)
    ),
    security(("session" = [])),
    tag = "authz"
)]
/// The caller's principal. Requires a session that passed a second factor.
pub async fn me(Extension(principal): Extension<Principal>) -> Json<Principal> {
    Json(principal)
}
