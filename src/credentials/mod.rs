//! Credential and session storage contracts.
//!
//! The core talks to storage only through these traits. Every method either
//! completes atomically for its user key or fails with a `StoreError`; business
//! outcomes (conflicts, used codes, counter regressions) come back as values.

pub mod backup_codes;
pub mod memory;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::{fmt, future::Future, time::Duration};
use thiserror::Error;
use uuid::Uuid;

use crate::identity::User;

pub use backup_codes::BackupCodeHasher;
pub use memory::MemoryStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
    #[error("credential store timed out")]
    Timeout,
}

/// Run a store call with an upper bound on its duration.
///
/// # Errors
/// Returns `StoreError::Timeout` if `fut` does not finish within `timeout`, or the
/// store's own error.
pub async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout),
    }
}

/// Server-side session record. The raw token is never stored, only its hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub mfa_satisfied: bool,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TotpAlgorithm {
    Sha1,
}

pub struct TotpCredential {
    pub secret: SecretString,
    pub algorithm: TotpAlgorithm,
    pub digits: usize,
    pub period: u64,
    pub created_at: DateTime<Utc>,
}

impl Clone for TotpCredential {
    fn clone(&self) -> Self {
        Self {
            secret: SecretString::from(self.secret.expose_secret().to_owned()),
            algorithm: self.algorithm,
            digits: self.digits,
            period: self.period,
            created_at: self.created_at,
        }
    }
}

impl fmt::Debug for TotpCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TotpCredential")
            .field("algorithm", &self.algorithm)
            .field("digits", &self.digits)
            .field("period", &self.period)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl TotpCredential {
    #[must_use]
    pub fn secret_base32(&self) -> &str {
        self.secret.expose_secret()
    }
}

/// Registered security key. `public_key` is the serialized `webauthn-rs` key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebAuthnCredential {
    pub credential_id: Vec<u8>,
    pub public_key: Vec<u8>,
    pub sign_counter: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupCode {
    pub code_hash: String,
    pub used: bool,
    pub issued_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The credential id is already bound to another user.
    CredentialConflict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Redemption {
    Redeemed,
    AlreadyUsed,
    NoMatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterCheck {
    Accepted,
    /// The reported counter is lower than the stored one.
    Regressed,
    UnknownCredential,
}

/// Session sub-interface consumed by the authentication gateway.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn lookup_session(&self, token_hash: &[u8]) -> Result<Option<SessionRecord>, StoreError>;

    /// Mark a session as having passed a second factor. Returns false if the
    /// session no longer exists.
    async fn promote_mfa_satisfied(&self, session_id: Uuid) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError>;
}

/// Long-lived authentication factors per user.
#[async_trait]
pub trait CredentialStore: SessionStore + UserDirectory {
    async fn totp_credential(&self, user_id: Uuid) -> Result<Option<TotpCredential>, StoreError>;

    async fn webauthn_credential(
        &self,
        user_id: Uuid,
    ) -> Result<Option<WebAuthnCredential>, StoreError>;

    /// Replace the user's TOTP secret and full backup-code set, and set
    /// `mfa_enrolled`, in one step.
    async fn commit_totp_enrollment(
        &self,
        user_id: Uuid,
        credential: TotpCredential,
        codes: Vec<BackupCode>,
    ) -> Result<CommitOutcome, StoreError>;

    /// Replace the user's security key and set `mfa_enrolled`, in one step.
    async fn commit_webauthn_enrollment(
        &self,
        user_id: Uuid,
        credential: WebAuthnCredential,
    ) -> Result<CommitOutcome, StoreError>;

    /// Store the counter reported by an assertion if it did not go backwards.
    async fn record_webauthn_use(
        &self,
        user_id: Uuid,
        credential_id: &[u8],
        counter: u32,
    ) -> Result<CounterCheck, StoreError>;

    /// All backup codes for the user, used ones included.
    async fn backup_codes(&self, user_id: Uuid) -> Result<Vec<BackupCode>, StoreError>;

    /// Flip `used` on the code with this hash, once.
    async fn redeem_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<Redemption, StoreError>;
}

/// Create a new opaque session token. Only its hash is kept server-side.
///
/// # Errors
/// Returns an error if the OS random source fails.
pub fn generate_session_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate session token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

#[must_use]
pub fn hash_session_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}
