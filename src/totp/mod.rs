//! TOTP secrets and code checks.
//!
//! Secrets are generated fresh for every enrollment attempt and handed around as
//! base32 inside `SecretString`. Verification accepts the current step and one
//! step of skew either side, nothing wider.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use totp_rs::{Algorithm, Secret, TOTP};

use crate::credentials::TotpAlgorithm;

const DEFAULT_DIGITS: usize = 6;
const DEFAULT_PERIOD_SECONDS: u64 = 30;
const SKEW_STEPS: u8 = 1;

/// A freshly generated secret and its `otpauth://` URI for QR rendering.
pub struct ProvisionedSecret {
    pub secret: SecretString,
    pub provisioning_uri: String,
}

#[derive(Clone, Debug)]
pub struct TotpSettings {
    issuer: String,
    digits: usize,
    period: u64,
}

impl TotpSettings {
    #[must_use]
    pub fn new(issuer: String) -> Self {
        Self {
            issuer,
            digits: DEFAULT_DIGITS,
            period: DEFAULT_PERIOD_SECONDS,
        }
    }

    #[must_use]
    pub fn with_digits(mut self, digits: usize) -> Self {
        self.digits = digits;
        self
    }

    #[must_use]
    pub fn with_period(mut self, period: u64) -> Self {
        self.period = period;
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn digits(&self) -> usize {
        self.digits
    }

    #[must_use]
    pub fn period(&self) -> u64 {
        self.period
    }

    #[must_use]
    pub fn algorithm(&self) -> TotpAlgorithm {
        TotpAlgorithm::Sha1
    }

    fn build(&self, secret_base32: &str, account: &str) -> Result<TOTP> {
        let secret_bytes = Secret::Encoded(secret_base32.to_string())
            .to_bytes()
            .map_err(|e| anyhow!("TOTP secret decode error: {e:?}"))?;
        TOTP::new(
            Algorithm::SHA1,
            self.digits,
            SKEW_STEPS,
            self.period,
            secret_bytes,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| anyhow!("TOTP init error: {e}"))
    }

    /// Generate a new random secret for `account`.
    ///
    /// # Errors
    /// Returns an error if the settings are rejected by the TOTP implementation
    /// (digits outside 6..=8, or `:` in issuer or account).
    pub fn generate(&self, account: &str) -> Result<ProvisionedSecret> {
        let secret_bytes = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| anyhow!("Secret gen error: {e:?}"))?;
        let totp = TOTP::new(
            Algorithm::SHA1,
            self.digits,
            SKEW_STEPS,
            self.period,
            secret_bytes,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| anyhow!("TOTP init error: {e}"))?;

        Ok(ProvisionedSecret {
            secret: SecretString::from(totp.get_secret_base32()),
            provisioning_uri: totp.get_url(),
        })
    }

    /// Check `code` at `at`, allowing one period of clock skew either way.
    ///
    /// # Errors
    /// Returns an error if the stored secret cannot be decoded.
    pub fn verify(&self, secret: &SecretString, code: &str, at: DateTime<Utc>) -> Result<bool> {
        let code = code.trim();
        if code.len() != self.digits || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(false);
        }
        let totp = self.build(secret.expose_secret(), "verify")?;
        Ok(totp.check(code, unix_seconds(at)))
    }

    /// Code valid at `at`. Used by clients in tests and by tooling.
    ///
    /// # Errors
    /// Returns an error if the secret cannot be decoded.
    pub fn code_at(&self, secret: &SecretString, at: DateTime<Utc>) -> Result<String> {
        let totp = self.build(secret.expose_secret(), "generate")?;
        Ok(totp.generate(unix_seconds(at)))
    }
}

fn unix_seconds(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp()).unwrap_or_default()
}
