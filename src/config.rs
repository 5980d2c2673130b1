//! Runtime configuration consumed once at start.

use std::time::Duration;
use url::Url;

use crate::rate_limit::SlidingWindow;

const DEFAULT_TOTP_ISSUER: &str = "fleetgate";
const DEFAULT_TOTP_DIGITS: usize = 6;
const DEFAULT_TOTP_PERIOD_SECONDS: u64 = 30;
const DEFAULT_BACKUP_CODE_COUNT: usize = 10;
const DEFAULT_ENROLLMENT_TTL_SECONDS: u64 = 10 * 60;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_ATTEMPT_WINDOW_SECONDS: u64 = 5 * 60;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;

/// Upper bound for the enrollment TTL and the attempt window.
pub const MAX_WINDOW_SECONDS: u64 = 24 * 60 * 60;
const DEFAULT_RP_ORIGIN: &str = "https://fleetgate.localhost";

/// Second-factor settings shared by enrollment and step-up.
#[derive(Clone, Debug)]
pub struct MfaConfig {
    totp_issuer: String,
    totp_digits: usize,
    totp_period_seconds: u64,
    backup_code_count: usize,
    enrollment_ttl_seconds: u64,
    max_attempts: u32,
    attempt_window_seconds: u64,
}

impl MfaConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            totp_issuer: DEFAULT_TOTP_ISSUER.to_string(),
            totp_digits: DEFAULT_TOTP_DIGITS,
            totp_period_seconds: DEFAULT_TOTP_PERIOD_SECONDS,
            backup_code_count: DEFAULT_BACKUP_CODE_COUNT,
            enrollment_ttl_seconds: DEFAULT_ENROLLMENT_TTL_SECONDS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_window_seconds: DEFAULT_ATTEMPT_WINDOW_SECONDS,
        }
    }

    #[must_use]
    pub fn with_totp_issuer(mut self, issuer: String) -> Self {
        self.totp_issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_totp_digits(mut self, digits: usize) -> Self {
        self.totp_digits = digits;
        self
    }

    #[must_use]
    pub fn with_totp_period_seconds(mut self, seconds: u64) -> Self {
        self.totp_period_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_backup_code_count(mut self, count: usize) -> Self {
        self.backup_code_count = count;
        self
    }

    #[must_use]
    pub fn with_enrollment_ttl_seconds(mut self, seconds: u64) -> Self {
        self.enrollment_ttl_seconds = seconds.min(MAX_WINDOW_SECONDS);
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_attempt_window_seconds(mut self, seconds: u64) -> Self {
        self.attempt_window_seconds = seconds.min(MAX_WINDOW_SECONDS);
        self
    }

    #[must_use]
    pub fn totp_issuer(&self) -> &str {
        &self.totp_issuer
    }

    #[must_use]
    pub fn totp_digits(&self) -> usize {
        self.totp_digits
    }

    #[must_use]
    pub fn totp_period_seconds(&self) -> u64 {
        self.totp_period_seconds
    }

    #[must_use]
    pub fn backup_code_count(&self) -> usize {
        self.backup_code_count
    }

    #[must_use]
    pub fn enrollment_ttl(&self) -> chrono::Duration {
        window_duration(self.enrollment_ttl_seconds)
    }

    #[must_use]
    pub fn enrollment_ttl_std(&self) -> Duration {
        Duration::from_secs(self.enrollment_ttl_seconds)
    }

    #[must_use]
    pub fn attempt_window(&self) -> SlidingWindow {
        SlidingWindow::new(
            self.max_attempts,
            window_duration(self.attempt_window_seconds),
        )
    }
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Relying party and store settings.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    store_timeout: Duration,
    webauthn_rp_id: String,
    webauthn_rp_origin: String,
}

impl AuthConfig {
    /// Build from the public origin. The RP id defaults to the origin's host.
    #[must_use]
    pub fn new(rp_origin: &str) -> Self {
        let rp_id = Url::parse(rp_origin)
            .ok()
            .and_then(|u: Url| u.host_str().map(ToString::to_string))
            .unwrap_or_else(|| "localhost".to_string());

        Self {
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            webauthn_rp_id: rp_id,
            webauthn_rp_origin: rp_origin.trim_end_matches('/').to_string(),
        }
    }

    #[must_use]
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_webauthn_rp_id(mut self, rp_id: String) -> Self {
        self.webauthn_rp_id = rp_id;
        self
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    #[must_use]
    pub fn webauthn_rp_id(&self) -> &str {
        &self.webauthn_rp_id
    }

    #[must_use]
    pub fn webauthn_rp_origin(&self) -> &str {
        &self.webauthn_rp_origin
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new(DEFAULT_RP_ORIGIN)
    }
}
fn window_duration(seconds: u64) -> chrono::Duration {
    let seconds = i64::try_from(seconds.min(MAX_WINDOW_SECONDS)).unwrap_or(0);
    chrono::Duration::try_seconds(seconds).unwrap_or_default()
}
