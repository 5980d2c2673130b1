use super::*;
use crate::{
    audit::MemoryAuditRecorder,
    authz::policy::{ROLE_FLEET_ADMIN, ROLE_SUPER_ADMIN, ROLE_VIEWER},
    credentials::{
        MemoryStore, SessionStore, UserDirectory, hash_session_token,
        testing::{SlowStore, UnavailableStore},
    },
    identity::ManualClock,
    webauthn::fake::FakeCeremony,
};
use chrono::Utc;
use secrecy::{SecretSlice, SecretString};

struct Harness {
    service: AuthorizationService,
    store: Arc<MemoryStore>,
    audit: Arc<MemoryAuditRecorder>,
    clock: ManualClock,
}

fn hasher() -> Arc<BackupCodeHasher> {
    Arc::new(
        BackupCodeHasher::new(SecretSlice::from(b"pepper".to_vec()))
            .with_params(argon2::Params::new(8, 1, 1, None).unwrap()),
    )
}

fn build(store: Arc<dyn CredentialStore>, audit: Arc<MemoryAuditRecorder>, clock: &ManualClock) -> AuthorizationService {
    AuthorizationService::new(
        ServiceDeps {
            store,
            audit,
            ceremony: Arc::new(FakeCeremony::default()),
            hasher: hasher(),
            policy: Arc::new(RolePolicy::fleet_default()),
            clock: Arc::new(clock.clone()),
        },
        &MfaConfig::new(),
        &AuthConfig::default(),
    )
}

fn harness() -> Harness {
    let clock = ManualClock::new(Utc::now());
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    let audit = Arc::new(MemoryAuditRecorder::new());
    let service = build(store.clone(), audit.clone(), &clock);
    Harness {
        service,
        store,
        audit,
        clock,
    }
}

fn dept(name: &str) -> DepartmentId {
    DepartmentId::parse(name).unwrap()
}

impl Harness {
    async fn user(&self, department: &str, role: &str) -> Uuid {
        let user = User::new(Uuid::new_v4(), dept(department), [Role::new(role)]);
        let id = user.id;
        self.store.insert_user(user).await;
        id
    }

    async fn login(&self, user_id: Uuid) -> (String, Principal) {
        let token = self
            .store
            .issue_session(user_id, chrono::Duration::hours(1), false)
            .await
            .unwrap();
        let principal = self
            .service
            .authenticate_token(Some(&token))
            .await
            .unwrap();
        (token, principal)
    }

    async fn session_satisfied(&self, token: &str) -> bool {
        self.store
            .lookup_session(&hash_session_token(token))
            .await
            .unwrap()
            .unwrap()
            .mfa_satisfied
    }

    /// Enroll TOTP through the service and return the secret and backup codes.
    async fn enroll_totp(&self, principal: &Principal) -> (SecretString, Vec<String>) {
        let started = self
            .service
            .start_enrollment(principal, EnrollmentMethod::Totp)
            .await
            .unwrap();
        let crate::enrollment::StartPayload::Totp { secret, .. } = started.payload else {
            panic!("expected a TOTP payload");
        };
        let code = self.code(&secret);
        let issued = self
            .service
            .verify_enrollment_totp(principal, &code)
            .await
            .unwrap();
        self.service.commit_enrollment(principal).await.unwrap();
        (secret, issued.codes)
    }

    fn code(&self, secret: &SecretString) -> String {
        self.service
            .enrollment()
            .totp_settings()
            .code_at(secret, self.clock.now())
            .unwrap()
    }
}

#[tokio::test]
async fn missing_token_is_invalid() {
    let h = harness();
    assert_eq!(
        h.service.authenticate_token(None).await.unwrap_err(),
        AuthError::InvalidToken
    );
    assert_eq!(
        h.service.authenticate_token(Some("nope")).await.unwrap_err(),
        AuthError::InvalidToken
    );
}

#[tokio::test]
async fn revoked_and_expired_tokens_are_rejected() {
    let h = harness();
    let user = h.user("MOH", ROLE_VIEWER).await;
    let (token, _) = h.login(user).await;
    assert!(h.store.revoke_session(&token).await);
    assert_eq!(
        h.service.authenticate_token(Some(&token)).await.unwrap_err(),
        AuthError::RevokedToken
    );

    let (token, _) = h.login(user).await;
    h.clock.advance(chrono::Duration::hours(2));
    assert_eq!(
        h.service.authenticate_token(Some(&token)).await.unwrap_err(),
        AuthError::ExpiredToken
    );
}

#[tokio::test]
async fn unavailable_store_fails_closed_with_system_error() {
    let clock = ManualClock::new(Utc::now());
    let audit = Arc::new(MemoryAuditRecorder::new());
    let service = build(Arc::new(UnavailableStore), audit.clone(), &clock);

    let err = service.authenticate_token(Some("token")).await.unwrap_err();
    assert!(err.is_infrastructure());
    let entries = audit.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::SystemError);
}

#[tokio::test]
async fn department_mismatch_is_denied_and_audited() {
    let h = harness();
    let admin = h.user("MOH", ROLE_FLEET_ADMIN).await;
    let (_, principal) = h.login(admin).await;

    let err = h
        .service
        .require_department_access(&principal, &dept("MOA"))
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::DepartmentMismatch);
    assert_eq!(err.category(), "forbidden");

    let entries = h.audit.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Denied);
    assert_eq!(entries[0].actor_id, Some(admin));
    assert_eq!(entries[0].target_department, Some(dept("MOA")));
}

#[tokio::test]
async fn own_department_and_cross_department_role_pass() {
    let h = harness();
    let admin = h.user("MOH", ROLE_FLEET_ADMIN).await;
    let root = h.user("MOH", ROLE_SUPER_ADMIN).await;
    let (_, admin) = h.login(admin).await;
    let (_, root) = h.login(root).await;

    h.service
        .require_department_access(&admin, &dept("MOH"))
        .await
        .unwrap();
    h.service
        .require_department_access(&root, &dept("MOA"))
        .await
        .unwrap();
    assert!(h.audit.entries().await.is_empty());
}

#[tokio::test]
async fn permission_and_role_gates() {
    let h = harness();
    let viewer = h.user("MOH", ROLE_VIEWER).await;
    let (_, viewer) = h.login(viewer).await;

    h.service
        .require_permission(&viewer, "vehicles:read")
        .await
        .unwrap();
    assert_eq!(
        h.service
            .require_permission(&viewer, "vehicles:write")
            .await
            .unwrap_err(),
        AuthError::PermissionDenied("vehicles:write".to_string())
    );
    assert!(matches!(
        h.service
            .require_permission(&viewer, "rockets:launch")
            .await,
        Err(AuthError::PermissionDenied(_))
    ));
    h.service
        .require_role(&viewer, [Role::new(ROLE_VIEWER), Role::new(ROLE_FLEET_ADMIN)])
        .await
        .unwrap();
    assert!(h
        .service
        .require_role(&viewer, [Role::new(ROLE_SUPER_ADMIN)])
        .await
        .is_err());
    assert_eq!(h.audit.entries().await.len(), 3);
}

#[tokio::test]
async fn unenrolled_user_gets_not_enrolled_without_mutation() {
    let h = harness();
    let user = h.user("MOH", ROLE_VIEWER).await;
    let (token, principal) = h.login(user).await;

    let err = h
        .service
        .require_mfa(&principal, Some(StepUpProof::Totp("123456".to_string())))
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::MfaNotEnrolled);
    assert!(!h.session_satisfied(&token).await);
    assert!(!h.store.get_user(user).await.unwrap().unwrap().mfa_enrolled);
}

#[tokio::test]
async fn enrollment_promotes_the_enrolling_session() {
    let h = harness();
    let user = h.user("MOH", ROLE_VIEWER).await;
    let (token, principal) = h.login(user).await;
    h.enroll_totp(&principal).await;

    assert!(h.session_satisfied(&token).await);
    let principal = h.service.authenticate_token(Some(&token)).await.unwrap();
    assert!(principal.mfa_satisfied);
    h.service.require_mfa(&principal, None).await.unwrap();
}

#[tokio::test]
async fn totp_step_up_promotes_session() {
    let h = harness();
    let user = h.user("MOH", ROLE_VIEWER).await;
    let (_, enrolling) = h.login(user).await;
    let (secret, _) = h.enroll_totp(&enrolling).await;

    let (token, principal) = h.login(user).await;
    assert!(!principal.mfa_satisfied);
    assert_eq!(
        h.service.require_mfa(&principal, None).await.unwrap_err(),
        AuthError::MfaRequired
    );

    let stepped = h
        .service
        .require_mfa(&principal, Some(StepUpProof::Totp(h.code(&secret))))
        .await
        .unwrap();
    assert!(stepped.mfa_satisfied);
    assert!(h.session_satisfied(&token).await);
}

#[tokio::test]
async fn backup_code_redeems_once() {
    let h = harness();
    let user = h.user("MOH", ROLE_VIEWER).await;
    let (_, enrolling) = h.login(user).await;
    let (_, codes) = h.enroll_totp(&enrolling).await;

    let (_, first) = h.login(user).await;
    h.service
        .require_mfa(&first, Some(StepUpProof::BackupCode(codes[0].to_lowercase())))
        .await
        .unwrap();

    let (token, second) = h.login(user).await;
    let err = h
        .service
        .require_mfa(&second, Some(StepUpProof::BackupCode(codes[0].clone())))
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::BackupCodeAlreadyUsed);
    assert!(!h.session_satisfied(&token).await);

    h.service
        .require_mfa(&second, Some(StepUpProof::BackupCode(codes[1].clone())))
        .await
        .unwrap();
}

#[tokio::test]
async fn step_up_is_rate_limited() {
    let h = harness();
    let user = h.user("MOH", ROLE_VIEWER).await;
    let (_, enrolling) = h.login(user).await;
    let (secret, _) = h.enroll_totp(&enrolling).await;
    let (_, principal) = h.login(user).await;

    let right: u32 = h.code(&secret).parse().unwrap();
    let wrong = format!("{:06}", (right + 500_000) % 1_000_000);
    for _ in 0..4 {
        assert_eq!(
            h.service
                .require_mfa(&principal, Some(StepUpProof::Totp(wrong.clone())))
                .await
                .unwrap_err(),
            AuthError::MfaRequired
        );
    }
    assert_eq!(
        h.service
            .require_mfa(&principal, Some(StepUpProof::Totp(wrong)))
            .await
            .unwrap_err(),
        AuthError::MfaRateLimited
    );
    assert_eq!(
        h.service
            .require_mfa(&principal, Some(StepUpProof::Totp(h.code(&secret))))
            .await
            .unwrap_err(),
        AuthError::MfaRateLimited
    );

    h.clock.advance(chrono::Duration::minutes(5));
    h.service
        .require_mfa(&principal, Some(StepUpProof::Totp(h.code(&secret))))
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_guesses_share_the_step_up_limit() {
    let h = harness();
    let user = h.user("MOH", ROLE_VIEWER).await;
    let (_, enrolling) = h.login(user).await;
    let (secret, _) = h.enroll_totp(&enrolling).await;
    let (token, principal) = h.login(user).await;

    let slow = Arc::new(build(
        Arc::new(SlowStore::new(h.store.clone(), Duration::from_millis(20))),
        h.audit.clone(),
        &h.clock,
    ));
    let right: u32 = h.code(&secret).parse().unwrap();
    let wrong = format!("{:06}", (right + 500_000) % 1_000_000);

    let mut guesses = tokio::task::JoinSet::new();
    for _ in 0..63 {
        let service = Arc::clone(&slow);
        let principal = principal.clone();
        let code = wrong.clone();
        guesses.spawn(async move {
            service
                .require_mfa(&principal, Some(StepUpProof::Totp(code)))
                .await
        });
    }
    // Every wrong guess is now parked on the slow TOTP lookup or refused.
    tokio::time::sleep(Duration::from_millis(1)).await;

    let err = slow
        .require_mfa(&principal, Some(StepUpProof::Totp(h.code(&secret))))
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::MfaRateLimited);

    while let Some(result) = guesses.join_next().await {
        assert!(matches!(
            result.unwrap(),
            Err(AuthError::MfaRequired | AuthError::MfaRateLimited)
        ));
    }
    assert!(!h.session_satisfied(&token).await);
}

#[tokio::test]
async fn enrolled_user_cannot_re_enroll_from_unsatisfied_session() {
    let h = harness();
    let user = h.user("MOH", ROLE_VIEWER).await;
    let (_, enrolling) = h.login(user).await;
    let (secret, codes) = h.enroll_totp(&enrolling).await;

    let (token, other) = h.login(user).await;
    assert!(!other.mfa_satisfied);
    for method in [EnrollmentMethod::Totp, EnrollmentMethod::Webauthn] {
        assert_eq!(
            h.service.start_enrollment(&other, method).await.unwrap_err(),
            AuthError::MfaRequired
        );
    }
    assert_eq!(
        h.service.commit_enrollment(&other).await.unwrap_err(),
        AuthError::MfaRequired
    );
    assert_eq!(
        h.service
            .finish_webauthn_enrollment(&other, &serde_json::json!({"credential_id": "key-9"}))
            .await
            .unwrap_err(),
        AuthError::MfaRequired
    );
    assert_eq!(
        h.service.cancel_enrollment(&other).await.unwrap_err(),
        AuthError::MfaRequired
    );
    assert!(!h.session_satisfied(&token).await);

    // The original factor is untouched.
    let (_, fresh) = h.login(user).await;
    h.service
        .require_mfa(&fresh, Some(StepUpProof::Totp(h.code(&secret))))
        .await
        .unwrap();
    let (_, backup) = h.login(user).await;
    h.service
        .require_mfa(&backup, Some(StepUpProof::BackupCode(codes[0].clone())))
        .await
        .unwrap();
}

#[tokio::test]
async fn satisfied_session_may_re_enroll() {
    let h = harness();
    let user = h.user("MOH", ROLE_VIEWER).await;
    let (_, enrolling) = h.login(user).await;
    let (secret, _) = h.enroll_totp(&enrolling).await;

    let (_, principal) = h.login(user).await;
    let stepped = h
        .service
        .require_mfa(&principal, Some(StepUpProof::Totp(h.code(&secret))))
        .await
        .unwrap();
    let (new_secret, _) = h.enroll_totp(&stepped).await;

    let (_, fresh) = h.login(user).await;
    assert_eq!(
        h.service
            .require_mfa(&fresh, Some(StepUpProof::Totp(h.code(&secret))))
            .await
            .unwrap_err(),
        AuthError::MfaRequired
    );
    h.service
        .require_mfa(&fresh, Some(StepUpProof::Totp(h.code(&new_secret))))
        .await
        .unwrap();
}

#[tokio::test]
async fn lapsed_assertions_are_purged() {
    let h = harness();
    let user = h.user("MOH", ROLE_VIEWER).await;
    let (_, enrolling) = h.login(user).await;
    h.service
        .start_enrollment(&enrolling, EnrollmentMethod::Webauthn)
        .await
        .unwrap();
    h.service
        .finish_webauthn_enrollment(
            &enrolling,
            &serde_json::json!({"credential_id": "key-1", "counter": 1}),
        )
        .await
        .unwrap();

    let (_, idle) = h.login(user).await;
    let (_, active) = h.login(user).await;
    h.service.begin_webauthn_step_up(&idle).await.unwrap();
    h.clock.advance(chrono::Duration::minutes(11));
    h.service.begin_webauthn_step_up(&active).await.unwrap();

    assert_eq!(h.service.purge_lapsed_assertions().await, 1);
    assert_eq!(h.service.purge_lapsed_assertions().await, 0);
    assert_eq!(
        h.service
            .finish_webauthn_step_up(
                &idle,
                &serde_json::json!({"credential_id": "key-1", "counter": 2}),
            )
            .await
            .unwrap_err(),
        AuthError::MfaRequired
    );
    h.service
        .finish_webauthn_step_up(
            &active,
            &serde_json::json!({"credential_id": "key-1", "counter": 2}),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn unfinished_assertion_expires() {
    let h = harness();
    let user = h.user("MOH", ROLE_VIEWER).await;
    let (_, enrolling) = h.login(user).await;
    h.service
        .start_enrollment(&enrolling, EnrollmentMethod::Webauthn)
        .await
        .unwrap();
    h.service
        .finish_webauthn_enrollment(
            &enrolling,
            &serde_json::json!({"credential_id": "key-1", "counter": 1}),
        )
        .await
        .unwrap();

    let (_, principal) = h.login(user).await;
    h.service.begin_webauthn_step_up(&principal).await.unwrap();
    h.clock.advance(chrono::Duration::minutes(11));
    assert_eq!(
        h.service
            .finish_webauthn_step_up(
                &principal,
                &serde_json::json!({"credential_id": "key-1", "counter": 2}),
            )
            .await
            .unwrap_err(),
        AuthError::MfaRequired
    );
}

#[tokio::test]
async fn counter_regression_is_clone_detected() {
    let h = harness();
    let user = h.user("MOH", ROLE_VIEWER).await;
    let (_, enrolling) = h.login(user).await;
    h.service
        .start_enrollment(&enrolling, EnrollmentMethod::Webauthn)
        .await
        .unwrap();
    h.service
        .finish_webauthn_enrollment(
            &enrolling,
            &serde_json::json!({"credential_id": "key-1", "counter": 42}),
        )
        .await
        .unwrap();

    let (token, principal) = h.login(user).await;
    h.service.begin_webauthn_step_up(&principal).await.unwrap();
    let err = h
        .service
        .finish_webauthn_step_up(
            &principal,
            &serde_json::json!({"credential_id": "key-1", "counter": 10}),
        )
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::CloneDetected);
    assert!(!h.session_satisfied(&token).await);

    h.service.begin_webauthn_step_up(&principal).await.unwrap();
    let stepped = h
        .service
        .finish_webauthn_step_up(
            &principal,
            &serde_json::json!({"credential_id": "key-1", "counter": 43}),
        )
        .await
        .unwrap();
    assert!(stepped.mfa_satisfied);
}

#[tokio::test]
async fn webauthn_finish_without_start_is_rejected() {
    let h = harness();
    let user = h.user("MOH", ROLE_VIEWER).await;
    let (_, principal) = h.login(user).await;
    let err = h
        .service
        .finish_webauthn_step_up(&principal, &serde_json::json!({"credential_id": "key-1"}))
        .await
        .unwrap_err();
    assert_eq!(err, AuthError::MfaRequired);
}

#[tokio::test]
async fn totp_only_user_cannot_use_security_key() {
    let h = harness();
    let user = h.user("MOH", ROLE_VIEWER).await;
    let (_, enrolling) = h.login(user).await;
    h.enroll_totp(&enrolling).await;
    let (_, principal) = h.login(user).await;
    assert_eq!(
        h.service
            .begin_webauthn_step_up(&principal)
            .await
            .unwrap_err(),
        AuthError::MfaNotEnrolled
    );
}

#[tokio::test]
async fn sensitive_operation_is_audited_once() {
    let h = harness();
    let user = h.user("MOH", ROLE_FLEET_ADMIN).await;
    let (_, principal) = h.login(user).await;

    let value = h
        .service
        .audit_sensitive_operation(&principal, "vehicles.delete", Some(dept("MOH")), async {
            Ok::<_, AuthError>(7)
        })
        .await
        .unwrap();
    assert_eq!(value, 7);

    let err = h
        .service
        .audit_sensitive_operation(&principal, "vehicles.delete", None, async {
            Err::<(), _>(AuthError::Unavailable("db".to_string()))
        })
        .await
        .unwrap_err();
    assert!(err.is_infrastructure());

    let entries = h.audit.entries().await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].outcome, AuditOutcome::Success);
    assert_eq!(entries[0].target_department, Some(dept("MOH")));
    assert_eq!(entries[1].outcome, AuditOutcome::SystemError);
}

#[tokio::test]
async fn dropped_audit_guard_records_system_error() {
    let h = harness();
    let user = h.user("MOH", ROLE_FLEET_ADMIN).await;
    let (_, principal) = h.login(user).await;

    drop(h.service.begin_audit(&principal, "vehicles.write", None));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let entries = h.audit.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].operation, "vehicles.write");
    assert_eq!(entries[0].outcome, AuditOutcome::SystemError);
}

#[test]
fn outcome_follows_error_class() {
    assert_eq!(
        outcome_for(&AuthError::DepartmentMismatch),
        AuditOutcome::Denied
    );
    assert_eq!(outcome_for(&AuthError::CloneDetected), AuditOutcome::Denied);
    assert_eq!(
        outcome_for(&AuthError::EnrollmentNotFound),
        AuditOutcome::Failure
    );
    assert_eq!(
        outcome_for(&AuthError::Unavailable(String::new())),
        AuditOutcome::SystemError
    );
}
