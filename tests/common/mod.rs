#![allow(dead_code, clippy::unwrap_used)]

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderMap, Request, StatusCode},
};
use chrono::Utc;
use fleetgate::{
    api,
    audit::MemoryAuditRecorder,
    authz::RolePolicy,
    config::{AuthConfig, MfaConfig},
    credentials::{BackupCodeHasher, MemoryStore, WebAuthnCredential},
    identity::{Clock, DepartmentId, ManualClock, Role, User},
    service::{AuthorizationService, ServiceDeps},
    webauthn::{AssertedKey, CeremonyError, RegisteredKey, SecurityKeyCeremony},
};
use secrecy::{SecretSlice, SecretString};
use serde_json::{Value, json};
use std::{collections::HashSet, sync::Arc};
use tokio::sync::Mutex;
use tower::ServiceExt;
use uuid::Uuid;

/// Security key stand-in. A response is `{"credential_id": "...", "counter": n}`;
/// `{"reject": "..."}` fails the ceremony.
#[derive(Default)]
pub struct FakeKeys {
    pending: Mutex<HashSet<Uuid>>,
}

impl FakeKeys {
    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn parse(response: &Value) -> Result<(Vec<u8>, u32), CeremonyError> {
    if let Some(reason) = response.get("reject").and_then(Value::as_str) {
        return Err(CeremonyError::Rejected(reason.to_string()));
    }
    let id = response
        .get("credential_id")
        .and_then(Value::as_str)
        .ok_or_else(|| CeremonyError::Rejected("missing credential_id".to_string()))?;
    let counter = response
        .get("counter")
        .and_then(Value::as_u64)
        .and_then(|c| u32::try_from(c).ok())
        .unwrap_or_default();
    Ok((id.as_bytes().to_vec(), counter))
}

#[async_trait]
impl SecurityKeyCeremony for FakeKeys {
    async fn begin_registration(
        &self,
        ceremony_id: Uuid,
        _user_id: Uuid,
        _user_name: &str,
        _exclude: &[Vec<u8>],
    ) -> Result<Value, CeremonyError> {
        self.pending.lock().await.insert(ceremony_id);
        Ok(json!({ "publicKey": { "challenge": ceremony_id.to_string() } }))
    }

    async fn finish_registration(
        &self,
        ceremony_id: Uuid,
        response: &Value,
    ) -> Result<RegisteredKey, CeremonyError> {
        let mut pending = self.pending.lock().await;
        if !pending.contains(&ceremony_id) {
            return Err(CeremonyError::UnknownCeremony);
        }
        let (credential_id, sign_count) = parse(response)?;
        pending.remove(&ceremony_id);
        Ok(RegisteredKey {
            credential_id,
            public_key: b"{}".to_vec(),
            sign_count,
        })
    }

    async fn begin_assertion(
        &self,
        ceremony_id: Uuid,
        _credentials: &[WebAuthnCredential],
    ) -> Result<Value, CeremonyError> {
        self.pending.lock().await.insert(ceremony_id);
        Ok(json!({ "publicKey": { "challenge": ceremony_id.to_string() } }))
    }

    async fn finish_assertion(
        &self,
        ceremony_id: Uuid,
        response: &Value,
    ) -> Result<AssertedKey, CeremonyError> {
        if !self.pending.lock().await.remove(&ceremony_id) {
            return Err(CeremonyError::UnknownCeremony);
        }
        let (credential_id, counter) = parse(response)?;
        Ok(AssertedKey {
            credential_id,
            counter,
        })
    }

    async fn discard(&self, ceremony_id: Uuid) {
        self.pending.lock().await.remove(&ceremony_id);
    }

    async fn purge_expired(&self) -> usize {
        0
    }
}

pub struct App {
    pub service: Arc<AuthorizationService>,
    pub store: Arc<MemoryStore>,
    pub audit: Arc<MemoryAuditRecorder>,
    pub keys: Arc<FakeKeys>,
    pub clock: ManualClock,
}

pub fn app() -> App {
    let clock = ManualClock::new(Utc::now());
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    let audit = Arc::new(MemoryAuditRecorder::new());
    let keys = Arc::new(FakeKeys::default());
    let hasher = BackupCodeHasher::new(SecretSlice::from(b"test-pepper".to_vec()))
        .with_params(argon2::Params::new(8, 1, 1, None).unwrap());

    let service = Arc::new(AuthorizationService::new(
        ServiceDeps {
            store: store.clone(),
            audit: audit.clone(),
            ceremony: keys.clone(),
            hasher: Arc::new(hasher),
            policy: Arc::new(RolePolicy::fleet_default()),
            clock: Arc::new(clock.clone()),
        },
        &MfaConfig::new(),
        &AuthConfig::default(),
    ));

    App {
        service,
        store,
        audit,
        keys,
        clock,
    }
}

impl App {
    pub fn router(&self) -> Router {
        api::router(self.service.clone())
    }

    pub async fn user(&self, department: &str, role: &str) -> Uuid {
        let user = User::new(
            Uuid::new_v4(),
            DepartmentId::parse(department).unwrap(),
            [Role::new(role)],
        );
        let id = user.id;
        self.store.insert_user(user).await;
        id
    }

    pub async fn token(&self, user_id: Uuid, mfa_satisfied: bool) -> String {
        self.store
            .issue_session(user_id, chrono::Duration::hours(1), mfa_satisfied)
            .await
            .unwrap()
    }

    /// Current TOTP code for a base32 secret handed out at enrollment start.
    pub fn code(&self, secret: &str) -> String {
        self.service
            .enrollment()
            .totp_settings()
            .code_at(&SecretString::from(secret.to_string()), self.clock.now())
            .unwrap()
    }
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

pub async fn send(router: Router, request: Request<Body>) -> Reply {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    Reply {
        status,
        headers,
        body,
    }
}

pub fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

pub fn post(uri: &str, token: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}
