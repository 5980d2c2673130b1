//! HTTP surface over [`AuthorizationService`].

use anyhow::Result;
use axum::{
    Router,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;

use crate::service::AuthorizationService;

pub mod gates;
pub mod handlers;
pub mod headers;
mod openapi;

pub use openapi::openapi;

use self::gates::Audited;
use self::handlers::{authz, enrollment, health, me, step_up};

/// Build the application router.
///
/// Every `/v1` route is authenticated. `/v1/me` also demands a satisfied
/// second factor, department routes are scoped by their path segment, and
/// sensitive operations leave one audit entry each.
pub fn router(service: Arc<AuthorizationService>) -> Router {
    let audited = |operation: &'static str| {
        from_fn_with_state(Audited::new(&service, operation), gates::audit)
    };

    let mfa_gated = Router::new()
        .route("/v1/me", get(me::me))
        .route_layer(from_fn_with_state(service.clone(), gates::require_mfa));

    let department_scoped = Router::new()
        .route(
            "/v1/departments/:department/access",
            get(authz::department_access).layer(audited("departments.access")),
        )
        .route_layer(from_fn_with_state(
            service.clone(),
            gates::require_department_access,
        ));

    let authenticated = Router::new()
        .route("/v1/authz/check", post(authz::check))
        .route(
            "/v1/mfa/enrollment",
            get(enrollment::status).delete(enrollment::cancel),
        )
        .route(
            "/v1/mfa/enrollment/start",
            post(enrollment::start).layer(audited("mfa.enrollment.start")),
        )
        .route(
            "/v1/mfa/enrollment/totp/ack",
            post(enrollment::acknowledge),
        )
        .route(
            "/v1/mfa/enrollment/totp/verify",
            post(enrollment::verify_totp),
        )
        .route(
            "/v1/mfa/enrollment/commit",
            post(enrollment::commit).layer(audited("mfa.enrollment.commit")),
        )
        .route(
            "/v1/mfa/enrollment/webauthn/verify",
            post(enrollment::verify_webauthn).layer(audited("mfa.enrollment.webauthn")),
        )
        .route("/v1/mfa/step-up", post(step_up::step_up))
        .route(
            "/v1/mfa/step-up/webauthn/start",
            post(step_up::webauthn_start),
        )
        .route(
            "/v1/mfa/step-up/webauthn/finish",
            post(step_up::webauthn_finish),
        )
        .merge(mfa_gated)
        .merge(department_scoped)
        .route_layer(from_fn_with_state(service.clone(), gates::authenticate));

    Router::new()
        .route("/health", get(health::health))
        .route("/openapi.json", get(openapi::openapi_json))
        .merge(authenticated)
        .with_state(service)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(from_fn(headers::security_headers)),
        )
}

/// Start the server
/// # Errors
/// Return error if the listener cannot be bound or the server fails
pub async fn serve(port: u16, service: Arc<AuthorizationService>) -> Result<()> {
    let app = router(service);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Gracefully shutdown");
            }
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
