//! Map validated CLI matches to the action to run.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{ARG_PORT, auth, mfa};
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let mfa = mfa::Options::parse(matches)?;
    let auth = auth::Options::parse(matches);

    Ok(Action::Server(Args {
        port,
        totp_issuer: mfa.totp_issuer,
        totp_period_seconds: mfa.totp_period_seconds,
        totp_digits: mfa.totp_digits,
        backup_code_count: mfa.backup_code_count,
        backup_code_pepper: mfa.backup_code_pepper,
        enrollment_ttl_seconds: mfa.enrollment_ttl_seconds,
        max_attempts: mfa.max_attempts,
        attempt_window_seconds: mfa.attempt_window_seconds,
        store_timeout_ms: auth.store_timeout_ms,
        webauthn_rp_id: auth.webauthn_rp_id,
        webauthn_rp_origin: auth.webauthn_rp_origin,
        role_policy: auth.role_policy,
        seed_file: auth.seed_file,
    }))
}
