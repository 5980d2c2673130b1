//! In-memory reference store.
//!
//! All records sit behind one async mutex, so every trait method is a single
//! serializable step. Good enough for development and tests; a real deployment
//! would put a database behind the same traits.

use anyhow::Result;
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    BackupCode, CommitOutcome, CounterCheck, CredentialStore, Redemption, SessionRecord,
    SessionStore, StoreError, TotpCredential, UserDirectory, WebAuthnCredential,
    generate_session_token, hash_session_token,
};
use crate::identity::{Clock, User};

#[derive(Default)]
struct Records {
    users: HashMap<Uuid, User>,
    sessions: HashMap<Vec<u8>, SessionRecord>,
    totp: HashMap<Uuid, TotpCredential>,
    webauthn: HashMap<Uuid, WebAuthnCredential>,
    backup_codes: HashMap<Uuid, Vec<BackupCode>>,
}

pub struct MemoryStore {
    records: Mutex<Records>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(Records::default()),
            clock,
        }
    }

    pub async fn insert_user(&self, user: User) {
        self.records.lock().await.users.insert(user.id, user);
    }

    /// Issue a session for `user_id` and return the raw token. The token is not
    /// retrievable afterwards.
    ///
    /// # Errors
    /// Returns an error if token generation fails.
    pub async fn issue_session(
        &self,
        user_id: Uuid,
        ttl: chrono::Duration,
        mfa_satisfied: bool,
    ) -> Result<String> {
        let token = generate_session_token()?;
        self.insert_session_token(&token, user_id, ttl, mfa_satisfied)
            .await;
        Ok(token)
    }

    /// Register a caller-chosen token. Used to load pre-issued development tokens.
    pub async fn insert_session_token(
        &self,
        token: &str,
        user_id: Uuid,
        ttl: chrono::Duration,
        mfa_satisfied: bool,
    ) -> Uuid {
        let record = SessionRecord {
            id: Uuid::new_v4(),
            user_id,
            mfa_satisfied,
            expires_at: self.clock.now() + ttl,
            revoked: false,
        };
        let id = record.id;
        self.records
            .lock()
            .await
            .sessions
            .insert(hash_session_token(token), record);
        id
    }

    /// Revoke a session by its raw token. Returns false if the token is unknown.
    pub async fn revoke_session(&self, token: &str) -> bool {
        let mut records = self.records.lock().await;
        match records.sessions.get_mut(&hash_session_token(token)) {
            Some(session) => {
                session.revoked = true;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn lookup_session(&self, token_hash: &[u8]) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.records.lock().await.sessions.get(token_hash).cloned())
    }

    async fn promote_mfa_satisfied(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        let session = records
            .sessions
            .values_mut()
            .find(|session| session.id == session_id);
        Ok(session.is_some_and(|session| {
            session.mfa_satisfied = true;
            true
        }))
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.records.lock().await.users.get(&user_id).cloned())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn totp_credential(&self, user_id: Uuid) -> Result<Option<TotpCredential>, StoreError> {
        Ok(self.records.lock().await.totp.get(&user_id).cloned())
    }

    async fn webauthn_credential(
        &self,
        user_id: Uuid,
    ) -> Result<Option<WebAuthnCredential>, StoreError> {
        Ok(self.records.lock().await.webauthn.get(&user_id).cloned())
    }

    async fn commit_totp_enrollment(
        &self,
        user_id: Uuid,
        credential: TotpCredential,
        codes: Vec<BackupCode>,
    ) -> Result<CommitOutcome, StoreError> {
        let mut records = self.records.lock().await;
        let Some(user) = records.users.get_mut(&user_id) else {
            return Err(StoreError::Unavailable(format!("user {user_id} not found")));
        };
        user.mfa_enrolled = true;
        records.totp.insert(user_id, credential);
        records.backup_codes.insert(user_id, codes);
        debug!(user_id = %user_id, "Committed TOTP enrollment");
        Ok(CommitOutcome::Committed)
    }

    async fn commit_webauthn_enrollment(
        &self,
        user_id: Uuid,
        credential: WebAuthnCredential,
    ) -> Result<CommitOutcome, StoreError> {
        let mut records = self.records.lock().await;
        let taken = records.webauthn.iter().any(|(owner, existing)| {
            *owner != user_id && existing.credential_id == credential.credential_id
        });
        if taken {
            warn!(user_id = %user_id, "Security key already registered to another user");
            return Ok(CommitOutcome::CredentialConflict);
        }
        let Some(user) = records.users.get_mut(&user_id) else {
            return Err(StoreError::Unavailable(format!("user {user_id} not found")));
        };
        user.mfa_enrolled = true;
        records.webauthn.insert(user_id, credential);
        debug!(user_id = %user_id, "Committed security key enrollment");
        Ok(CommitOutcome::Committed)
    }

    async fn record_webauthn_use(
        &self,
        user_id: Uuid,
        credential_id: &[u8],
        counter: u32,
    ) -> Result<CounterCheck, StoreError> {
        let mut records = self.records.lock().await;
        let Some(credential) = records
            .webauthn
            .get_mut(&user_id)
            .filter(|credential| credential.credential_id == credential_id)
        else {
            return Ok(CounterCheck::UnknownCredential);
        };
        if counter < credential.sign_counter {
            warn!(
                user_id = %user_id,
                stored = credential.sign_counter,
                reported = counter,
                "Security key sign counter regressed"
            );
            return Ok(CounterCheck::Regressed);
        }
        credential.sign_counter = counter;
        Ok(CounterCheck::Accepted)
    }

    async fn backup_codes(&self, user_id: Uuid) -> Result<Vec<BackupCode>, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .backup_codes
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn redeem_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
    ) -> Result<Redemption, StoreError> {
        let mut records = self.records.lock().await;
        let Some(code) = records
            .backup_codes
            .get_mut(&user_id)
            .and_then(|codes| codes.iter_mut().find(|code| code.code_hash == code_hash))
        else {
            return Ok(Redemption::NoMatch);
        };
        if code.used {
            return Ok(Redemption::AlreadyUsed);
        }
        code.used = true;
        Ok(Redemption::Redeemed)
    }
}
