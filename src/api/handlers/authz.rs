//! Authorization checks exposed to clients.

use axum::{
    Json,
    extract::{Extension, State},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::{
    authz::Requirement,
    error::{AuthError, ErrorBody},
    identity::{DepartmentId, Principal, Role},
    service::AuthorizationService,
};

#[derive(ToSchema, Deserialize, Debug, Default)]
pub struct CheckRequest {
    pub permission: Option<String>,
    pub any_of_roles: Option<Vec<Role>>,
    pub department: Option<DepartmentId>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct CheckResponse {
    pub allowed: bool,
    /// Deny category. Never says which check failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct DepartmentAccess {
    pub department: DepartmentId,
    pub allowed: bool,
}

#[utoipa::path(
    post,
    path = "/v1/authz/check",
    request_body = CheckRequest,
    responses(
        (status = 200, description = "Decision for the caller", body = CheckResponse),
        (status = 401, description = "Missing, expired or revoked session", body = ErrorBody),
        (status = 503, description = "Authorization backend unavailable", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "authz"
)]
pub async fn check(
    State(service): State<Arc<AuthorizationService>>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<CheckRequest>,
) -> Result<Json<CheckResponse>, AuthError> {
    let mut requirement = Requirement::new();
    if let Some(permission) = request.permission {
        requirement = requirement.permission(permission);
    }
    if let Some(roles) = request.any_of_roles {
        requirement = requirement.any_of_roles(roles);
    }
    if let Some(department) = request.department {
        requirement = requirement.department(department);
    }

    match service
        .authorize(&principal, &requirement, "authz.check")
        .await
    {
        Ok(()) => Ok(Json(CheckResponse {
            allowed: true,
            reason: None,
        })),
        Err(err) if err.is_infrastructure() => Err(err),
        Err(err) => Ok(Json(CheckResponse {
            allowed: false,
            reason: Some(err.category().to_string()),
        })),
    }
}

#[utoipa::path(
    get,
    path = "/v1/departments/{department}/access",
    params(("department" = String, Path, description = "Department code, e.g. MOH")),
    responses(
        (status = 200, description = "Caller may act on the department", body = DepartmentAccess),
        (status = 401, description = "Missing, expired or revoked session", body = ErrorBody),
        (status = 403, description = "Department outside the caller's scope", body = ErrorBody)
    ),
    security(("session" = [])),
    tag = "authz"
)]
pub async fn department_access(
    Extension(department): Extension<DepartmentId>,
) -> Json<DepartmentAccess> {
    Json(DepartmentAccess {
        department,
        allowed: true,
    })
}
