//! `AuthorizationService`: the per-request gates composed from the gateway, the
//! permission evaluator, the credential store and the audit trail.
//!
//! Every gate returns `Ok` to continue or an `AuthError` the harness turns into
//! a terminal response. Denials are audited as `Denied`, infrastructure faults
//! as `SystemError`, and both fail closed.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    audit::{AuditEntry, AuditOutcome, AuditRecorder},
    authz::{Decision, PermissionEvaluator, Requirement, RolePolicy},
    config::{AuthConfig, MfaConfig},
    credentials::{BackupCodeHasher, CounterCheck, CredentialStore, Redemption, bounded},
    enrollment::{
        EnrollmentCoordinator, EnrollmentMethod, EnrollmentState, EnrollmentStatus,
        IssuedBackupCodes, StartedEnrollment,
    },
    error::AuthError,
    gateway::AuthenticationGateway,
    identity::{Clock, DepartmentId, Principal, Role, User},
    rate_limit::{AttemptLimiter, RateLimitDecision},
    totp::TotpSettings,
    webauthn::{CeremonyError, SecurityKeyCeremony},
};

/// Second factor presented inline to `require_mfa`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepUpProof {
    Totp(String),
    BackupCode(String),
}

/// Collaborators injected once at process start.
pub struct ServiceDeps {
    pub store: Arc<dyn CredentialStore>,
    pub audit: Arc<dyn AuditRecorder>,
    pub ceremony: Arc<dyn SecurityKeyCeremony>,
    pub hasher: Arc<BackupCodeHasher>,
    pub policy: Arc<RolePolicy>,
    pub clock: Arc<dyn Clock>,
}

/// Pending security key assertion for one session.
struct PendingAssertion {
    ceremony_id: Uuid,
    user_id: Uuid,
    expires_at: DateTime<Utc>,
}

pub struct AuthorizationService {
    store: Arc<dyn CredentialStore>,
    audit: Arc<dyn AuditRecorder>,
    ceremony: Arc<dyn SecurityKeyCeremony>,
    hasher: Arc<BackupCodeHasher>,
    clock: Arc<dyn Clock>,
    evaluator: PermissionEvaluator,
    gateway: AuthenticationGateway,
    enrollment: EnrollmentCoordinator,
    limiter: AttemptLimiter,
    store_timeout: Duration,
    assertion_ttl: chrono::Duration,
    assertions: Mutex<HashMap<Uuid, PendingAssertion>>,
}

impl AuthorizationService {
    #[must_use]
    pub fn new(deps: ServiceDeps, mfa: &MfaConfig, auth: &AuthConfig) -> Self {
        let store_timeout = auth.store_timeout();
        let gateway =
            AuthenticationGateway::new(Arc::clone(&deps.store), Arc::clone(&deps.clock), store_timeout);
        let enrollment = EnrollmentCoordinator::new(
            Arc::clone(&deps.store),
            Arc::clone(&deps.audit),
            Arc::clone(&deps.ceremony),
            Arc::clone(&deps.hasher),
            Arc::clone(&deps.clock),
            mfa,
            store_timeout,
        );
        let limiter = AttemptLimiter::new(mfa.attempt_window(), Arc::clone(&deps.clock));

        Self {
            evaluator: PermissionEvaluator::new(deps.policy),
            store: deps.store,
            audit: deps.audit,
            ceremony: deps.ceremony,
            hasher: deps.hasher,
            clock: deps.clock,
            gateway,
            enrollment,
            limiter,
            store_timeout,
            assertion_ttl: mfa.enrollment_ttl(),
            assertions: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn evaluator(&self) -> &PermissionEvaluator {
        &self.evaluator
    }

    #[must_use]
    pub fn enrollment(&self) -> &EnrollmentCoordinator {
        &self.enrollment
    }

    /// Resolve the request token into a principal.
    ///
    /// # Errors
    /// `InvalidToken` when no token was presented, otherwise whatever the
    /// gateway reports. Store faults are audited as `SystemError`.
    pub async fn authenticate_token(&self, token: Option<&str>) -> Result<Principal, AuthError> {
        let Some(token) = token else {
            return Err(AuthError::InvalidToken);
        };
        match self.gateway.authenticate(token).await {
            Ok(principal) => Ok(principal),
            Err(err) => {
                if err.is_infrastructure() {
                    error!("Authentication backend failed: {err}");
                    self.record(None, "authenticate", None, AuditOutcome::SystemError)
                        .await;
                } else {
                    debug!("Rejected token: {err}");
                }
                Err(err)
            }
        }
    }

    /// Run the evaluator and audit a deny.
    ///
    /// # Errors
    /// `PermissionDenied` or `DepartmentMismatch`.
    pub async fn authorize(
        &self,
        principal: &Principal,
        requirement: &Requirement,
        operation: &str,
    ) -> Result<(), AuthError> {
        let decision = self.evaluator.evaluate(principal, requirement);
        if let Decision::Deny(reason) = &decision {
            info!(
                user_id = %principal.user_id,
                operation,
                reason = reason.as_str(),
                "Authorization denied"
            );
            self.record(
                Some(principal.user_id),
                operation,
                requirement.resource_department.clone(),
                AuditOutcome::Denied,
            )
            .await;
        }
        decision.into_result(requirement)
    }

    /// # Errors
    /// `PermissionDenied` if no role of the principal grants `permission`.
    pub async fn require_permission(
        &self,
        principal: &Principal,
        permission: &str,
    ) -> Result<(), AuthError> {
        let requirement = Requirement::new().permission(permission);
        self.authorize(principal, &requirement, "authz.permission")
            .await
    }

    /// # Errors
    /// `PermissionDenied` if the principal holds none of `roles`.
    pub async fn require_role(
        &self,
        principal: &Principal,
        roles: impl IntoIterator<Item = Role>,
    ) -> Result<(), AuthError> {
        let requirement = Requirement::new().any_of_roles(roles);
        self.authorize(principal, &requirement, "authz.role").await
    }

    /// # Errors
    /// `DepartmentMismatch` unless the departments match or a role of the
    /// principal is cross-department.
    pub async fn require_department_access(
        &self,
        principal: &Principal,
        department: &DepartmentId,
    ) -> Result<(), AuthError> {
        let requirement = Requirement::new().department(department.clone());
        self.authorize(principal, &requirement, "authz.department")
            .await
    }

    /// Demand a second factor for this session. A satisfied session passes
    /// straight through; otherwise an inline TOTP or backup code may step it up.
    ///
    /// Returns the principal with `mfa_satisfied` set.
    ///
    /// # Errors
    /// `MfaNotEnrolled` when the user has no factor (nothing is mutated),
    /// `MfaRateLimited`, `BackupCodeAlreadyUsed`, or `MfaRequired`.
    #[instrument(skip_all, fields(user_id = %principal.user_id))]
    pub async fn require_mfa(
        &self,
        principal: &Principal,
        proof: Option<StepUpProof>,
    ) -> Result<Principal, AuthError> {
        if principal.mfa_satisfied {
            return Ok(principal.clone());
        }
        let result = self.step_up(principal, proof).await;
        self.record_result(principal, "mfa.step_up", &result).await;
        result
    }

    async fn step_up(
        &self,
        principal: &Principal,
        proof: Option<StepUpProof>,
    ) -> Result<Principal, AuthError> {
        let user = self.enrolled_user(principal.user_id).await?;
        let Some(proof) = proof else {
            return Err(AuthError::MfaRequired);
        };
        if self.limiter.register_attempt(user.id) == RateLimitDecision::Limited {
            warn!("Step-up attempted while rate limited");
            return Err(AuthError::MfaRateLimited);
        }

        let verdict = match proof {
            StepUpProof::Totp(code) => self.check_totp(user.id, &code).await?,
            StepUpProof::BackupCode(code) => self.redeem_backup_code(user.id, &code).await?,
        };
        match verdict {
            Ok(()) => self.promote(principal).await,
            Err(err) => Err(self.failed_attempt(user.id, err)),
        }
    }

    /// Outer error: infrastructure. Inner error: the proof did not hold.
    async fn check_totp(
        &self,
        user_id: Uuid,
        code: &str,
    ) -> Result<Result<(), AuthError>, AuthError> {
        let Some(credential) =
            bounded(self.store_timeout, self.store.totp_credential(user_id)).await?
        else {
            return Ok(Err(AuthError::MfaRequired));
        };
        let settings = TotpSettings::new(self.enrollment.totp_settings().issuer().to_string())
            .with_digits(credential.digits)
            .with_period(credential.period);
        let matched = settings
            .verify(&credential.secret, code, self.clock.now())
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        Ok(if matched {
            Ok(())
        } else {
            Err(AuthError::MfaRequired)
        })
    }

    async fn redeem_backup_code(
        &self,
        user_id: Uuid,
        code: &str,
    ) -> Result<Result<(), AuthError>, AuthError> {
        let stored = bounded(self.store_timeout, self.store.backup_codes(user_id)).await?;
        let hasher = Arc::clone(&self.hasher);
        let code = code.to_string();
        let matched = tokio::task::spawn_blocking(move || {
            hasher
                .find_match(&code, &stored)
                .map(|found| found.code_hash.clone())
        })
        .await
        .map_err(|e| AuthError::Unavailable(e.to_string()))?;

        let Some(code_hash) = matched else {
            return Ok(Err(AuthError::MfaRequired));
        };
        let redemption = bounded(
            self.store_timeout,
            self.store.redeem_backup_code(user_id, &code_hash),
        )
        .await?;
        Ok(match redemption {
            Redemption::Redeemed => {
                info!(user_id = %user_id, "Backup code redeemed");
                Ok(())
            }
            Redemption::AlreadyUsed => Err(AuthError::BackupCodeAlreadyUsed),
            Redemption::NoMatch => Err(AuthError::MfaRequired),
        })
    }

    /// Start a security key assertion for the current session.
    ///
    /// # Errors
    /// `MfaNotEnrolled` without a registered key, `MfaRateLimited`, or
    /// `MfaRequired` when the challenge cannot be built.
    #[instrument(skip_all, fields(user_id = %principal.user_id))]
    pub async fn begin_webauthn_step_up(&self, principal: &Principal) -> Result<Value, AuthError> {
        let result = self.begin_assertion(principal).await;
        if let Err(err) = &result {
            self.record(
                Some(principal.user_id),
                "mfa.step_up.webauthn.start",
                None,
                outcome_for(err),
            )
            .await;
        }
        result
    }

    async fn begin_assertion(&self, principal: &Principal) -> Result<Value, AuthError> {
        let user = self.enrolled_user(principal.user_id).await?;
        let credential = bounded(self.store_timeout, self.store.webauthn_credential(user.id))
            .await?
            .ok_or(AuthError::MfaNotEnrolled)?;
        if self.limiter.check(user.id) == RateLimitDecision::Limited {
            return Err(AuthError::MfaRateLimited);
        }

        let ceremony_id = Uuid::new_v4();
        let challenge = self
            .ceremony
            .begin_assertion(ceremony_id, &[credential])
            .await
            .map_err(|e| {
                warn!("Failed to start security key assertion: {e}");
                AuthError::MfaRequired
            })?;

        let previous = self.assertions.lock().await.insert(
            principal.session_id,
            PendingAssertion {
                ceremony_id,
                user_id: user.id,
                expires_at: self.clock.now() + self.assertion_ttl,
            },
        );
        if let Some(previous) = previous {
            self.ceremony.discard(previous.ceremony_id).await;
        }
        Ok(challenge)
    }

    /// Finish the security key assertion and step the session up.
    ///
    /// # Errors
    /// `CloneDetected` when the authenticator counter went backwards, whatever
    /// the signature says. `MfaRequired` for any other failed assertion.
    #[instrument(skip_all, fields(user_id = %principal.user_id))]
    pub async fn finish_webauthn_step_up(
        &self,
        principal: &Principal,
        response: &Value,
    ) -> Result<Principal, AuthError> {
        let result = self.finish_assertion(principal, response).await;
        self.record_result(principal, "mfa.step_up.webauthn", &result)
            .await;
        result
    }

    async fn finish_assertion(
        &self,
        principal: &Principal,
        response: &Value,
    ) -> Result<Principal, AuthError> {
        let pending = self
            .assertions
            .lock()
            .await
            .remove(&principal.session_id)
            .filter(|pending| pending.user_id == principal.user_id)
            .ok_or(AuthError::MfaRequired)?;
        if pending.expires_at <= self.clock.now() {
            self.ceremony.discard(pending.ceremony_id).await;
            return Err(AuthError::MfaRequired);
        }
        if self.limiter.register_attempt(pending.user_id) == RateLimitDecision::Limited {
            self.ceremony.discard(pending.ceremony_id).await;
            warn!("Security key step-up attempted while rate limited");
            return Err(AuthError::MfaRateLimited);
        }

        let asserted = match self
            .ceremony
            .finish_assertion(pending.ceremony_id, response)
            .await
        {
            Ok(asserted) => asserted,
            Err(CeremonyError::PossibleClone) => {
                error!("Security key assertion flagged as possible clone");
                return Err(AuthError::CloneDetected);
            }
            Err(err) => {
                debug!("Security key assertion rejected: {err}");
                return Err(self.failed_attempt(pending.user_id, AuthError::MfaRequired));
            }
        };

        let check = bounded(
            self.store_timeout,
            self.store
                .record_webauthn_use(pending.user_id, &asserted.credential_id, asserted.counter),
        )
        .await?;
        match check {
            CounterCheck::Accepted => self.promote(principal).await,
            CounterCheck::Regressed => {
                error!(counter = asserted.counter, "Security key counter regressed");
                Err(AuthError::CloneDetected)
            }
            CounterCheck::UnknownCredential => {
                Err(self.failed_attempt(pending.user_id, AuthError::MfaRequired))
            }
        }
    }

    /// Start an audit scope for a sensitive operation. The entry is written
    /// exactly once: by `finish`, or as `SystemError` if the guard is dropped
    /// first (panic or cancelled request).
    #[must_use]
    pub fn begin_audit(
        &self,
        principal: &Principal,
        operation: &str,
        department: Option<DepartmentId>,
    ) -> AuditGuard {
        AuditGuard {
            audit: Arc::clone(&self.audit),
            clock: Arc::clone(&self.clock),
            timeout: self.store_timeout,
            actor_id: Some(principal.user_id),
            operation: operation.to_string(),
            department,
            finished: false,
        }
    }

    /// Run `operation` inside an audit scope and record its outcome.
    ///
    /// # Errors
    /// Whatever `operation` returns.
    pub async fn audit_sensitive_operation<T, F>(
        &self,
        principal: &Principal,
        name: &str,
        department: Option<DepartmentId>,
        operation: F,
    ) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, AuthError>>,
    {
        let guard = self.begin_audit(principal, name, department);
        let result = operation.await;
        let outcome = match &result {
            Ok(_) => AuditOutcome::Success,
            Err(err) => outcome_for(err),
        };
        guard.finish(outcome).await;
        result
    }

    #[instrument(skip_all, fields(user_id = %principal.user_id))]
    pub async fn start_enrollment(
        &self,
        principal: &Principal,
        method: EnrollmentMethod,
    ) -> Result<StartedEnrollment, AuthError> {
        self.ensure_may_enroll(principal).await?;
        self.enrollment.start(principal.user_id, method).await
    }

    pub async fn acknowledge_totp_secret(
        &self,
        principal: &Principal,
    ) -> Result<EnrollmentState, AuthError> {
        self.ensure_may_enroll(principal).await?;
        self.enrollment.acknowledge_secret(principal.user_id).await
    }

    pub async fn verify_enrollment_totp(
        &self,
        principal: &Principal,
        code: &str,
    ) -> Result<IssuedBackupCodes, AuthError> {
        self.ensure_may_enroll(principal).await?;
        self.enrollment.verify_totp(principal.user_id, code).await
    }

    /// Commit a TOTP enrollment. The factor was just proven in this session,
    /// so the session is promoted as well.
    pub async fn commit_enrollment(&self, principal: &Principal) -> Result<EnrollmentState, AuthError> {
        self.ensure_may_enroll(principal).await?;
        let state = self.enrollment.commit(principal.user_id).await?;
        self.promote_after_enrollment(principal).await;
        Ok(state)
    }

    pub async fn finish_webauthn_enrollment(
        &self,
        principal: &Principal,
        response: &Value,
    ) -> Result<EnrollmentState, AuthError> {
        self.ensure_may_enroll(principal).await?;
        let state = self
            .enrollment
            .finish_webauthn(principal.user_id, response)
            .await?;
        self.promote_after_enrollment(principal).await;
        Ok(state)
    }

    pub async fn cancel_enrollment(&self, principal: &Principal) -> Result<EnrollmentState, AuthError> {
        self.ensure_may_enroll(principal).await?;
        self.enrollment.cancel(principal.user_id).await
    }

    pub async fn enrollment_status(&self, principal: &Principal) -> EnrollmentStatus {
        self.enrollment.status(principal.user_id).await
    }

    /// Periodically destroy lapsed enrollment sessions and security key
    /// assertions.
    pub fn spawn_enrollment_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let purged = service.enrollment.purge_expired().await;
                if purged > 0 {
                    info!(purged, "Purged expired enrollment sessions");
                }
                let purged = service.purge_lapsed_assertions().await;
                if purged > 0 {
                    info!(purged, "Purged lapsed security key assertions");
                }
            }
        })
    }

    /// Drop step-up assertions that were started but never finished in time.
    pub async fn purge_lapsed_assertions(&self) -> usize {
        let now = self.clock.now();
        let mut lapsed = Vec::new();
        self.assertions.lock().await.retain(|_, pending| {
            if pending.expires_at <= now {
                lapsed.push(pending.ceremony_id);
                false
            } else {
                true
            }
        });
        for ceremony_id in &lapsed {
            self.ceremony.discard(*ceremony_id).await;
        }
        lapsed.len()
    }

    /// Once a user has a factor, changing enrollment needs a session that
    /// already passed it.
    async fn ensure_may_enroll(&self, principal: &Principal) -> Result<(), AuthError> {
        if principal.mfa_satisfied {
            return Ok(());
        }
        let user = bounded(self.store_timeout, self.store.get_user(principal.user_id))
            .await?
            .ok_or(AuthError::InvalidToken)?;
        if user.mfa_enrolled {
            warn!(user_id = %principal.user_id, "Re-enrollment refused without a second factor");
            Err(AuthError::MfaRequired)
        } else {
            Ok(())
        }
    }

    async fn enrolled_user(&self, user_id: Uuid) -> Result<User, AuthError> {
        let user = bounded(self.store_timeout, self.store.get_user(user_id))
            .await?
            .ok_or(AuthError::InvalidToken)?;
        if user.mfa_enrolled {
            Ok(user)
        } else {
            Err(AuthError::MfaNotEnrolled)
        }
    }

    async fn promote(&self, principal: &Principal) -> Result<Principal, AuthError> {
        let promoted = bounded(
            self.store_timeout,
            self.store.promote_mfa_satisfied(principal.session_id),
        )
        .await?;
        if !promoted {
            return Err(AuthError::InvalidToken);
        }
        self.limiter.reset(principal.user_id);
        info!(session_id = %principal.session_id, "Session stepped up");
        Ok(Principal {
            mfa_satisfied: true,
            ..principal.clone()
        })
    }

    async fn promote_after_enrollment(&self, principal: &Principal) {
        if let Err(err) = self.promote(principal).await {
            warn!("Enrollment committed but session was not promoted: {err}");
        }
    }

    /// The attempt was counted when it was registered; report whether it used
    /// up the window.
    fn failed_attempt(&self, user_id: Uuid, err: AuthError) -> AuthError {
        if self.limiter.check(user_id) == RateLimitDecision::Limited {
            warn!(user_id = %user_id, "Step-up attempts exhausted");
            AuthError::MfaRateLimited
        } else {
            err
        }
    }

    async fn record_result<T>(&self, principal: &Principal, operation: &str, result: &Result<T, AuthError>) {
        let outcome = match result {
            Ok(_) => AuditOutcome::Success,
            Err(err) => outcome_for(err),
        };
        self.record(Some(principal.user_id), operation, None, outcome)
            .await;
    }

    async fn record(
        &self,
        actor_id: Option<Uuid>,
        operation: &str,
        department: Option<DepartmentId>,
        outcome: AuditOutcome,
    ) {
        let entry = AuditEntry::new(actor_id, operation, department, outcome, self.clock.now());
        if let Err(err) = bounded(self.store_timeout, self.audit.record(entry)).await {
            error!(operation, "Failed to record audit entry: {err}");
        }
    }
}

/// Audit outcome for a failed gate or operation.
#[must_use]
pub fn outcome_for(err: &AuthError) -> AuditOutcome {
    if err.is_infrastructure() {
        AuditOutcome::SystemError
    } else if err.status().as_u16() == 401 || err.status().as_u16() == 403 {
        AuditOutcome::Denied
    } else {
        AuditOutcome::Failure
    }
}

/// Pending audit entry for one sensitive operation.
pub struct AuditGuard {
    audit: Arc<dyn AuditRecorder>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    actor_id: Option<Uuid>,
    operation: String,
    department: Option<DepartmentId>,
    finished: bool,
}

impl AuditGuard {
    pub async fn finish(mut self, outcome: AuditOutcome) {
        self.finished = true;
        let entry = self.entry(outcome);
        if let Err(err) = bounded(self.timeout, self.audit.record(entry)).await {
            error!(operation = %self.operation, "Failed to record audit entry: {err}");
        }
    }

    fn entry(&self, outcome: AuditOutcome) -> AuditEntry {
        AuditEntry::new(
            self.actor_id,
            &self.operation,
            self.department.clone(),
            outcome,
            self.clock.now(),
        )
    }
}

impl Drop for AuditGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let entry = self.entry(AuditOutcome::SystemError);
        warn!(operation = %self.operation, "Sensitive operation ended without an outcome");
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!(operation = %self.operation, "No runtime to record audit entry");
            return;
        };
        let audit = Arc::clone(&self.audit);
        let timeout = self.timeout;
        handle.spawn(async move {
            if let Err(err) = bounded(timeout, audit.record(entry)).await {
                error!("Failed to record audit entry: {err}");
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests;
