//! MFA enrollment state machine.
//!
//! Flow overview:
//! 1) `start` replaces any previous attempt and provisions a TOTP secret or a
//!    security key challenge.
//! 2) TOTP: `acknowledge_secret`, then `verify_totp` with a code from the app.
//!    A match issues the backup codes once; `commit` persists secret, codes and
//!    the enrolled flag together.
//! 3) Security key: `finish_webauthn` validates the attestation and commits.
//!
//! Sessions expire after the configured TTL and are then reported as
//! `Abandoned`. Nothing from an unfinished attempt ever reaches the credential
//! store, and an existing factor stays valid until the new one commits.

mod session;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub use session::{EnrollmentMethod, EnrollmentState};
use session::{EnrollmentSession, SessionRegistry};

use crate::{
    audit::{AuditEntry, AuditOutcome, AuditRecorder},
    config::MfaConfig,
    credentials::{
        BackupCodeHasher, CommitOutcome, CredentialStore, TotpCredential, WebAuthnCredential,
        bounded,
    },
    error::AuthError,
    identity::Clock,
    rate_limit::{RateLimitDecision, SlidingWindow},
    totp::TotpSettings,
    webauthn::{CeremonyError, SecurityKeyCeremony},
};

/// What the client needs to continue after `start`.
pub enum StartPayload {
    Webauthn { challenge: Value },
    Totp {
        secret: SecretString,
        provisioning_uri: String,
    },
}

pub struct StartedEnrollment {
    pub method: EnrollmentMethod,
    pub state: EnrollmentState,
    pub expires_at: DateTime<Utc>,
    pub payload: StartPayload,
}

impl std::fmt::Debug for StartedEnrollment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartedEnrollment")
            .field("method", &self.method)
            .field("state", &self.state)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnrollmentStatus {
    pub state: EnrollmentState,
    pub method: Option<EnrollmentMethod>,
    pub started_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl EnrollmentStatus {
    fn idle(state: EnrollmentState) -> Self {
        Self {
            state,
            method: None,
            started_at: None,
            expires_at: None,
        }
    }
}

/// Plaintext backup codes, shown exactly once.
#[derive(Debug)]
pub struct IssuedBackupCodes {
    pub state: EnrollmentState,
    pub codes: Vec<String>,
}

pub struct EnrollmentCoordinator {
    store: Arc<dyn CredentialStore>,
    audit: Arc<dyn AuditRecorder>,
    ceremony: Arc<dyn SecurityKeyCeremony>,
    hasher: Arc<BackupCodeHasher>,
    clock: Arc<dyn Clock>,
    totp: TotpSettings,
    attempts: SlidingWindow,
    ttl: chrono::Duration,
    backup_code_count: usize,
    store_timeout: Duration,
    sessions: SessionRegistry,
}

impl EnrollmentCoordinator {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        audit: Arc<dyn AuditRecorder>,
        ceremony: Arc<dyn SecurityKeyCeremony>,
        hasher: Arc<BackupCodeHasher>,
        clock: Arc<dyn Clock>,
        config: &MfaConfig,
        store_timeout: Duration,
    ) -> Self {
        let totp = TotpSettings::new(config.totp_issuer().to_string())
            .with_digits(config.totp_digits())
            .with_period(config.totp_period_seconds());
        Self {
            store,
            audit,
            ceremony,
            hasher,
            clock,
            totp,
            attempts: config.attempt_window(),
            ttl: config.enrollment_ttl(),
            backup_code_count: config.backup_code_count(),
            store_timeout,
            sessions: SessionRegistry::default(),
        }
    }

    #[must_use]
    pub fn totp_settings(&self) -> &TotpSettings {
        &self.totp
    }

    /// Begin a new enrollment, superseding any attempt already in progress.
    ///
    /// # Errors
    /// `InvalidToken` if the user is unknown, `EnrollmentFailed` if the security
    /// key challenge cannot be built, `Unavailable` on store faults.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn start(
        &self,
        user_id: Uuid,
        method: EnrollmentMethod,
    ) -> Result<StartedEnrollment, AuthError> {
        bounded(self.store_timeout, self.store.get_user(user_id))
            .await?
            .ok_or(AuthError::InvalidToken)?;

        let slot = self.sessions.slot(user_id);
        let mut current = slot.lock().await;
        if let Some(previous) = current.take() {
            info!(previous = %previous.id, "Superseding enrollment in progress");
            self.ceremony.discard(previous.id).await;
        }

        let mut session = EnrollmentSession::new(method, self.clock.now(), self.ttl);
        let payload = match method {
            EnrollmentMethod::Totp => {
                let provisioned = self
                    .totp
                    .generate(&user_id.to_string())
                    .map_err(|e| AuthError::Unavailable(e.to_string()))?;
                session.totp_secret = Some(SecretString::from(
                    provisioned.secret.expose_secret().to_owned(),
                ));
                StartPayload::Totp {
                    secret: provisioned.secret,
                    provisioning_uri: provisioned.provisioning_uri,
                }
            }
            EnrollmentMethod::Webauthn => {
                let exclude: Vec<Vec<u8>> =
                    bounded(self.store_timeout, self.store.webauthn_credential(user_id))
                        .await?
                        .map(|existing| existing.credential_id)
                        .into_iter()
                        .collect();
                let challenge = self
                    .ceremony
                    .begin_registration(session.id, user_id, &user_id.to_string(), &exclude)
                    .await
                    .map_err(|e| AuthError::EnrollmentFailed(e.to_string()))?;
                StartPayload::Webauthn { challenge }
            }
        };

        let started = StartedEnrollment {
            method,
            state: session.state,
            expires_at: session.expires_at,
            payload,
        };
        info!(session_id = %session.id, ?method, "Enrollment started");
        *current = Some(session);
        Ok(started)
    }

    /// The client has stored the TOTP secret; codes are accepted from now on.
    ///
    /// # Errors
    /// `EnrollmentNotFound`, `EnrollmentExpired`, or `EnrollmentStateMismatch`.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn acknowledge_secret(&self, user_id: Uuid) -> Result<EnrollmentState, AuthError> {
        let slot = self.sessions.slot(user_id);
        let mut current = slot.lock().await;
        let session = self.live(user_id, &mut current).await?;
        match session.state {
            EnrollmentState::SetupTotp | EnrollmentState::VerifyTotp => {
                session.state = EnrollmentState::VerifyTotp;
                Ok(session.state)
            }
            _ => Err(AuthError::EnrollmentStateMismatch),
        }
    }

    /// Check a code against the in-progress secret. A match issues the backup
    /// codes; too many misses abandon the attempt.
    ///
    /// # Errors
    /// `MfaInvalidCode` on mismatch, `MfaRateLimited` once the attempt budget is
    /// spent (the session is gone afterwards), plus the session errors.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn verify_totp(
        &self,
        user_id: Uuid,
        code: &str,
    ) -> Result<IssuedBackupCodes, AuthError> {
        let slot = self.sessions.slot(user_id);
        let mut current = slot.lock().await;
        let now = self.clock.now();
        let session = self.live(user_id, &mut current).await?;
        if !matches!(
            session.state,
            EnrollmentState::SetupTotp | EnrollmentState::VerifyTotp
        ) {
            return Err(AuthError::EnrollmentStateMismatch);
        }
        session.state = EnrollmentState::VerifyTotp;

        let secret = session
            .totp_secret
            .as_ref()
            .ok_or(AuthError::EnrollmentStateMismatch)?;
        let matched = self
            .totp
            .verify(secret, code, now)
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        if !matched {
            if self.attempts.record(&mut session.failures, now) == RateLimitDecision::Limited {
                let abandoned = current.take();
                drop(current);
                warn!("Too many TOTP attempts, enrollment abandoned");
                self.abandon(user_id, abandoned, AuditOutcome::Denied).await;
                return Err(AuthError::MfaRateLimited);
            }
            return Err(AuthError::MfaInvalidCode);
        }

        let hasher = Arc::clone(&self.hasher);
        let count = self.backup_code_count;
        let issued = tokio::task::spawn_blocking(move || hasher.issue(count, now))
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        session.pending_codes = Some(issued.records);
        session.state = EnrollmentState::BackupCodesIssued;
        info!("TOTP verified, backup codes issued");
        Ok(IssuedBackupCodes {
            state: session.state,
            codes: issued.plaintext,
        })
    }

    /// Persist the TOTP secret, the backup codes and the enrolled flag together.
    /// Any earlier TOTP credential and its codes are replaced in the same step.
    ///
    /// # Errors
    /// `Unavailable` leaves the session in place so the client can retry.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn commit(&self, user_id: Uuid) -> Result<EnrollmentState, AuthError> {
        let slot = self.sessions.slot(user_id);
        let mut current = slot.lock().await;
        let now = self.clock.now();
        let session = self.live(user_id, &mut current).await?;
        if session.state != EnrollmentState::BackupCodesIssued {
            return Err(AuthError::EnrollmentStateMismatch);
        }
        let (Some(secret), Some(codes)) = (&session.totp_secret, &session.pending_codes) else {
            return Err(AuthError::EnrollmentStateMismatch);
        };

        let credential = TotpCredential {
            secret: SecretString::from(secret.expose_secret().to_owned()),
            algorithm: self.totp.algorithm(),
            digits: self.totp.digits(),
            period: self.totp.period(),
            created_at: now,
        };
        let outcome = bounded(
            self.store_timeout,
            self.store
                .commit_totp_enrollment(user_id, credential, codes.clone()),
        )
        .await?;
        if outcome == CommitOutcome::CredentialConflict {
            return Err(AuthError::EnrollmentConflict);
        }

        *current = None;
        info!("TOTP enrollment committed");
        Ok(EnrollmentState::Complete)
    }

    /// Validate the security key attestation and commit it.
    ///
    /// # Errors
    /// `EnrollmentFailed` for a rejected ceremony and `EnrollmentConflict` for a
    /// key bound to another user; both leave the session in `SetupWebauthn`.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn finish_webauthn(
        &self,
        user_id: Uuid,
        response: &Value,
    ) -> Result<EnrollmentState, AuthError> {
        let slot = self.sessions.slot(user_id);
        let mut current = slot.lock().await;
        let now = self.clock.now();
        let session = self.live(user_id, &mut current).await?;
        if session.state != EnrollmentState::SetupWebauthn {
            return Err(AuthError::EnrollmentStateMismatch);
        }

        let key = self
            .ceremony
            .finish_registration(session.id, response)
            .await
            .map_err(|e| match e {
                CeremonyError::UnknownCeremony => {
                    AuthError::EnrollmentFailed("challenge expired".to_string())
                }
                other => AuthError::EnrollmentFailed(other.to_string()),
            })?;

        let credential = WebAuthnCredential {
            credential_id: key.credential_id,
            public_key: key.public_key,
            sign_counter: key.sign_count,
            created_at: now,
        };
        let outcome = bounded(
            self.store_timeout,
            self.store.commit_webauthn_enrollment(user_id, credential),
        )
        .await?;
        if outcome == CommitOutcome::CredentialConflict {
            warn!("Security key already bound to another account");
            return Err(AuthError::EnrollmentConflict);
        }

        *current = None;
        info!("Security key enrollment committed");
        Ok(EnrollmentState::Complete)
    }

    /// Abandon the current attempt.
    ///
    /// # Errors
    /// `EnrollmentNotFound` if there is nothing to cancel.
    #[instrument(skip_all, fields(user_id = %user_id))]
    pub async fn cancel(&self, user_id: Uuid) -> Result<EnrollmentState, AuthError> {
        let slot = self
            .sessions
            .existing(user_id)
            .ok_or(AuthError::EnrollmentNotFound)?;
        let abandoned = slot.lock().await.take();
        if abandoned.is_none() {
            return Err(AuthError::EnrollmentNotFound);
        }
        self.abandon(user_id, abandoned, AuditOutcome::Failure).await;
        Ok(EnrollmentState::Abandoned)
    }

    /// Current state for the user. A lapsed session is destroyed and reported
    /// once as `Abandoned`.
    pub async fn status(&self, user_id: Uuid) -> EnrollmentStatus {
        let Some(slot) = self.sessions.existing(user_id) else {
            return EnrollmentStatus::idle(EnrollmentState::ChooseMethod);
        };
        let mut current = slot.lock().await;
        if current
            .as_ref()
            .is_some_and(|session| session.is_expired(self.clock.now()))
        {
            let expired = current.take();
            drop(current);
            self.abandon(user_id, expired, AuditOutcome::Failure).await;
            return EnrollmentStatus::idle(EnrollmentState::Abandoned);
        }
        match current.as_ref() {
            None => EnrollmentStatus::idle(EnrollmentState::ChooseMethod),
            Some(session) => EnrollmentStatus {
                state: session.state,
                method: Some(session.method),
                started_at: Some(session.created_at),
                expires_at: Some(session.expires_at),
            },
        }
    }

    /// Destroy lapsed sessions and their ceremony state. Returns how many
    /// sessions were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut purged = 0;
        for (user_id, slot) in self.sessions.snapshot() {
            let Ok(mut current) = slot.try_lock() else {
                continue;
            };
            if current.as_ref().is_some_and(|s| s.is_expired(now)) {
                let expired = current.take();
                drop(current);
                self.abandon(user_id, expired, AuditOutcome::Failure).await;
                purged += 1;
            }
        }
        self.sessions.compact();
        self.ceremony.purge_expired().await;
        purged
    }

    /// The live session, or the reason there is none. Expired sessions are
    /// destroyed here.
    async fn live<'a>(
        &self,
        user_id: Uuid,
        current: &'a mut Option<EnrollmentSession>,
    ) -> Result<&'a mut EnrollmentSession, AuthError> {
        let now = self.clock.now();
        if current.as_ref().is_some_and(|s| s.is_expired(now)) {
            let expired = current.take();
            self.abandon(user_id, expired, AuditOutcome::Failure).await;
            return Err(AuthError::EnrollmentExpired);
        }
        current.as_mut().ok_or(AuthError::EnrollmentNotFound)
    }

    async fn abandon(
        &self,
        user_id: Uuid,
        session: Option<EnrollmentSession>,
        outcome: AuditOutcome,
    ) {
        let Some(session) = session else {
            return;
        };
        self.ceremony.discard(session.id).await;
        let entry = AuditEntry::new(
            Some(user_id),
            "mfa.enrollment.abandoned",
            None,
            outcome,
            self.clock.now(),
        );
        if let Err(err) = bounded(self.store_timeout, self.audit.record(entry)).await {
            error!(user_id = %user_id, "Failed to record enrollment abandonment: {err}");
        }
    }
}
