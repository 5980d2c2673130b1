use axum::Json;
use utoipa::{
    Modify, OpenApi,
    openapi::{
        Contact, Info, InfoBuilder, License, Tag,
        security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    },
};

use super::handlers::{authz, enrollment, health, me, step_up};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        me::me,
        authz::check,
        authz::department_access,
        enrollment::status,
        enrollment::cancel,
        enrollment::start,
        enrollment::acknowledge,
        enrollment::verify_totp,
        enrollment::commit,
        enrollment::verify_webauthn,
        step_up::step_up,
        step_up::webauthn_start,
        step_up::webauthn_finish,
    ),
    modifiers(&SessionSecurity)
)]
struct ApiDoc;

/// Session tokens travel as `Authorization: Bearer` or the session cookie.
struct SessionSecurity;

impl Modify for SessionSecurity {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "session",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .description(Some(format!(
                        "Opaque session token, also accepted from the `{}` cookie",
                        super::gates::SESSION_COOKIE_NAME
                    )))
                    .build(),
            ),
        );
    }
}

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();
    doc.info = cargo_info();
    doc.tags = Some(vec![
        tag("health", "Liveness and build information"),
        tag("authz", "Role, permission and department checks"),
        tag("enrollment", "Second factor enrollment"),
        tag("step-up", "Second factor verification for the current session"),
    ]);
    doc
}

/// Serve the generated document.
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(openapi())
}

fn tag(name: &str, description: &str) -> Tag {
    let mut tag = Tag::new(name);
    tag.description = Some(description.to_string());
    tag
}

fn cargo_info() -> Info {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();
    info
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let authors = env!("CARGO_PKG_AUTHORS");
    let primary = authors.split(';').next().map(str::trim)?;
    if primary.is_empty() {
        return None;
    }

    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    Some(value.trim()).filter(|trimmed| !trimmed.is_empty())
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|v| !v.is_empty())
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    match author.find('<') {
        Some(start) => (
            non_empty(&author[..start]),
            non_empty(author[start + 1..].trim_end_matches('>')),
        ),
        None => (non_empty(author), None),
    }
}
