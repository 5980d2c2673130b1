use crate::{
    api,
    audit::TracingAuditRecorder,
    authz::RolePolicy,
    cli::telemetry,
    config::{AuthConfig, MfaConfig},
    credentials::{BackupCodeHasher, MemoryStore},
    identity::{Clock, SystemClock, User},
    service::{AuthorizationService, ServiceDeps},
    webauthn::WebauthnCeremony,
};
use anyhow::{Context, Result, ensure};
use secrecy::{ExposeSecret, SecretSlice, SecretString};
use serde::Deserialize;
use std::{fs, path::Path, sync::Arc, time::Duration};
use tracing::{debug, info};
use uuid::Uuid;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_SEED_SESSION_TTL_SECONDS: i64 = 8 * 60 * 60;
const MAX_SEED_SESSION_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub totp_issuer: String,
    pub totp_period_seconds: u64,
    pub totp_digits: u8,
    pub backup_code_count: u8,
    pub backup_code_pepper: SecretString,
    pub enrollment_ttl_seconds: u64,
    pub max_attempts: u32,
    pub attempt_window_seconds: u64,
    pub store_timeout_ms: u64,
    pub webauthn_rp_id: Option<String>,
    pub webauthn_rp_origin: String,
    pub role_policy: Option<String>,
    pub seed_file: Option<String>,
}

/// Development bootstrap: users plus pre-issued session tokens.
#[derive(Debug, Deserialize)]
struct Seed {
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    sessions: Vec<SeedSession>,
}

#[derive(Debug, Deserialize)]
struct SeedSession {
    token: String,
    user_id: Uuid,
    #[serde(default = "default_seed_ttl")]
    ttl_seconds: i64,
    #[serde(default)]
    mfa_satisfied: bool,
}

const fn default_seed_ttl() -> i64 {
    DEFAULT_SEED_SESSION_TTL_SECONDS
}

/// Execute the server action.
/// # Errors
/// Returns an error if the policy, seed file or relying party settings are
/// invalid, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let mfa_config = MfaConfig::new()
        .with_totp_issuer(args.totp_issuer)
        .with_totp_digits(usize::from(args.totp_digits))
        .with_totp_period_seconds(args.totp_period_seconds)
        .with_backup_code_count(usize::from(args.backup_code_count))
        .with_enrollment_ttl_seconds(args.enrollment_ttl_seconds)
        .with_max_attempts(args.max_attempts)
        .with_attempt_window_seconds(args.attempt_window_seconds);

    let mut auth_config = AuthConfig::new(&args.webauthn_rp_origin)
        .with_store_timeout(Duration::from_millis(args.store_timeout_ms));
    if let Some(rp_id) = args.webauthn_rp_id {
        auth_config = auth_config.with_webauthn_rp_id(rp_id);
    }
    debug!("MFA config: {:?}", mfa_config);
    debug!("Auth config: {:?}", auth_config);

    let policy = match &args.role_policy {
        Some(path) => RolePolicy::from_json(Path::new(path))?,
        None => RolePolicy::fleet_default(),
    };
    info!(roles = policy.role_count(), "Role policy loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new(Arc::clone(&clock)));
    if let Some(path) = &args.seed_file {
        load_seed(&store, Path::new(path)).await?;
    }

    let ceremony = WebauthnCeremony::new(
        auth_config.webauthn_rp_id(),
        auth_config.webauthn_rp_origin(),
        mfa_config.enrollment_ttl_std(),
    )
    .context("Invalid WebAuthn relying party settings")?;

    let pepper = SecretSlice::from(args.backup_code_pepper.expose_secret().as_bytes().to_vec());

    let service = Arc::new(AuthorizationService::new(
        ServiceDeps {
            store,
            audit: Arc::new(TracingAuditRecorder),
            ceremony: Arc::new(ceremony),
            hasher: Arc::new(BackupCodeHasher::new(pepper)),
            policy: Arc::new(policy),
            clock,
        },
        &mfa_config,
        &auth_config,
    ));

    let sweeper = service.spawn_enrollment_sweeper(SWEEP_INTERVAL);

    let result = api::serve(args.port, service).await;

    sweeper.abort();
    telemetry::shutdown_tracer();

    result
}

async fn load_seed(store: &MemoryStore, path: &Path) -> Result<()> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed file: {}", path.display()))?;
    let seed = parse_seed(&raw)
        .with_context(|| format!("Invalid seed file: {}", path.display()))?;

    let mut sessions = Vec::with_capacity(seed.sessions.len());
    for session in &seed.sessions {
        sessions.push((session, seed_session_ttl(session)?));
    }

    let users = seed.users.len();
    for user in seed.users {
        store.insert_user(user).await;
    }
    for (session, ttl) in &sessions {
        store
            .insert_session_token(&session.token, session.user_id, *ttl, session.mfa_satisfied)
            .await;
    }
    info!(users, sessions = sessions.len(), "Seed loaded");
    Ok(())
}

fn seed_session_ttl(session: &SeedSession) -> Result<chrono::Duration> {
    ensure!(
        (1..=MAX_SEED_SESSION_TTL_SECONDS).contains(&session.ttl_seconds),
        "Seed session for user {} has ttl_seconds {} outside 1..={}",
        session.user_id,
        session.ttl_seconds,
        MAX_SEED_SESSION_TTL_SECONDS
    );
    chrono::Duration::try_seconds(session.ttl_seconds)
        .with_context(|| format!("Invalid ttl_seconds for user {}", session.user_id))
}

fn parse_seed(raw: &str) -> Result<Seed> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_defaults_ttl_and_mfa() {
        let seed = parse_seed(
            r#"{
                "users": [
                    {"id": "6f1c1f8e-3f4c-4d9b-9a53-0d2b4ad3b0a1", "department": "MOH", "roles": ["fleet_admin"]}
                ],
                "sessions": [
                    {"token": "dev-token", "user_id": "6f1c1f8e-3f4c-4d9b-9a53-0d2b4ad3b0a1"}
                ]
            }"#,
        );
        assert!(seed.is_ok());
        if let Ok(seed) = seed {
            assert_eq!(seed.users.len(), 1);
            assert!(!seed.users[0].mfa_enrolled);
            assert_eq!(seed.sessions[0].ttl_seconds, DEFAULT_SEED_SESSION_TTL_SECONDS);
            assert!(!seed.sessions[0].mfa_satisfied);
        }
    }

    #[test]
    fn empty_seed_is_valid() {
        let seed = parse_seed("{}");
        assert!(seed.is_ok_and(|seed| seed.users.is_empty() && seed.sessions.is_empty()));
    }

    #[tokio::test]
    async fn seeded_token_authenticates() {
        let dir = std::env::temp_dir().join(format!("fleetgate-seed-{}", Uuid::new_v4()));
        assert!(fs::create_dir_all(&dir).is_ok());
        let path = dir.join("seed.json");
        let user_id = Uuid::new_v4();
        let raw = format!(
            r#"{{"users":[{{"id":"{user_id}","department":"MOA","roles":["viewer"]}}],
                "sessions":[{{"token":"dev-token","user_id":"{user_id}","ttl_seconds":60}}]}}"#
        );
        assert!(fs::write(&path, raw).is_ok());

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = MemoryStore::new(clock);
        assert!(load_seed(&store, &path).await.is_ok());
        assert!(store.revoke_session("dev-token").await);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn out_of_range_seed_ttl_is_an_error() {
        let dir = std::env::temp_dir().join(format!("fleetgate-seed-{}", Uuid::new_v4()));
        assert!(fs::create_dir_all(&dir).is_ok());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = MemoryStore::new(clock);

        for ttl in [i64::MAX.to_string(), "0".to_string()] {
            let path = dir.join(format!("seed-{ttl}.json"));
            let raw = format!(
                r#"{{"sessions":[{{"token":"dev-token","user_id":"{}","ttl_seconds":{ttl}}}]}}"#,
                Uuid::new_v4()
            );
            assert!(fs::write(&path, raw).is_ok());
            assert!(load_seed(&store, &path).await.is_err(), "ttl {ttl}");
        }
        assert!(!store.revoke_session("dev-token").await);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_seed_file_is_an_error() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = MemoryStore::new(clock);
        let result = load_seed(&store, Path::new("/nonexistent/fleetgate-seed.json")).await;
        assert!(result.is_err());
    }
}
