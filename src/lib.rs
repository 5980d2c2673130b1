//! # Fleetgate (request authorization and MFA enrollment)
//!
//! `fleetgate` sits in front of fleet-administration endpoints and decides, per
//! request, whether the caller may proceed.
//!
//! ## Gates
//!
//! Requests pass through a fixed chain of gates. Each gate either lets the
//! request continue or stops it with a terminal [`error::AuthError`]:
//!
//! - **Authenticate:** an opaque session token (bearer header or cookie) is
//!   resolved to a [`identity::Principal`]. Tokens are stored only as SHA-256
//!   hashes.
//! - **Permission / role:** the static role policy grants permissions per role.
//! - **Department scoping:** a principal may act only on its own department
//!   unless one of its roles is cross-department (`super_admin`).
//! - **MFA:** routes marked sensitive demand a session that passed a second
//!   factor, either already or through an inline step-up proof.
//!
//! Denials are audited and answered with a category only, never with the
//! check that failed.
//!
//! ## MFA enrollment
//!
//! Enrollment is a server-held state machine per user. A factor (TOTP with
//! backup codes, or a WebAuthn security key) is written to the credential
//! store only at the final commit, so an abandoned or expired attempt leaves
//! nothing behind.

pub mod api;
pub mod audit;
pub mod authz;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod enrollment;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod rate_limit;
pub mod service;
pub mod totp;
pub mod webauthn;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
