//! Security key ceremonies.
//!
//! The enrollment coordinator and the step-up gate only see the
//! `SecurityKeyCeremony` trait. Challenges and client responses cross it as
//! JSON values so the protocol library stays behind this module.

mod ceremony;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use ceremony::WebauthnCeremony;

use crate::credentials::WebAuthnCredential;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CeremonyError {
    #[error("ceremony not found or expired")]
    UnknownCeremony,
    #[error("ceremony rejected: {0}")]
    Rejected(String),
    #[error("authenticator reported a counter that suggests cloning")]
    PossibleClone,
}

/// Output of a successful registration, ready to be stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredKey {
    pub credential_id: Vec<u8>,
    pub public_key: Vec<u8>,
    pub sign_count: u32,
}

/// Output of a successful assertion. The counter still has to be checked
/// against the stored one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssertedKey {
    pub credential_id: Vec<u8>,
    pub counter: u32,
}

#[async_trait]
pub trait SecurityKeyCeremony: Send + Sync {
    /// Start a registration and return the challenge for the browser.
    async fn begin_registration(
        &self,
        ceremony_id: Uuid,
        user_id: Uuid,
        user_name: &str,
        exclude: &[Vec<u8>],
    ) -> Result<Value, CeremonyError>;

    /// Validate the browser's attestation. On failure the pending state is kept
    /// so the client can retry against the same challenge.
    async fn finish_registration(
        &self,
        ceremony_id: Uuid,
        response: &Value,
    ) -> Result<RegisteredKey, CeremonyError>;

    async fn begin_assertion(
        &self,
        ceremony_id: Uuid,
        credentials: &[WebAuthnCredential],
    ) -> Result<Value, CeremonyError>;

    /// Validate an assertion. Pending state is consumed either way.
    async fn finish_assertion(
        &self,
        ceremony_id: Uuid,
        response: &Value,
    ) -> Result<AssertedKey, CeremonyError>;

    /// Drop any pending state for the ceremony.
    async fn discard(&self, ceremony_id: Uuid);

    /// Drop pending state older than the ceremony TTL. Returns how many were removed.
    async fn purge_expired(&self) -> usize;
}

#[cfg(test)]
pub(crate) mod fake {
    //! Deterministic ceremony for tests. Responses are plain JSON:
    //! `{"credential_id": "...", "counter": n}` or `{"reject": "reason"}`.

    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct FakeCeremony {
        pending: Mutex<HashMap<Uuid, Uuid>>,
    }

    impl FakeCeremony {
        pub(crate) async fn pending(&self) -> usize {
            self.pending.lock().await.len()
        }
    }

    fn parse(response: &Value) -> Result<(Vec<u8>, u32), CeremonyError> {
        if let Some(reason) = response.get("reject").and_then(Value::as_str) {
            return Err(CeremonyError::Rejected(reason.to_string()));
        }
        if response.get("clone").is_some() {
            return Err(CeremonyError::PossibleClone);
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
    impl SecurityKeyCeremony for FakeCeremony {
        async fn begin_registration(
            &self,
            ceremony_id: Uuid,
            user_id: Uuid,
            _user_name: &str,
            _exclude: &[Vec<u8>],
        ) -> Result<Value, CeremonyError> {
            self.pending.lock().await.insert(ceremony_id, user_id);
            Ok(serde_json::json!({ "challenge": ceremony_id.to_string() }))
        }

        async fn finish_registration(
            &self,
            ceremony_id: Uuid,
            response: &Value,
        ) -> Result<RegisteredKey, CeremonyError> {
            let mut pending = self.pending.lock().await;
            if !pending.contains_key(&ceremony_id) {
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
            credentials: &[WebAuthnCredential],
        ) -> Result<Value, CeremonyError> {
            if credentials.is_empty() {
                return Err(CeremonyError::Rejected("no credentials".to_string()));
            }
            self.pending.lock().await.insert(ceremony_id, Uuid::nil());
            Ok(serde_json::json!({ "challenge": ceremony_id.to_string() }))
        }

        async fn finish_assertion(
            &self,
            ceremony_id: Uuid,
            response: &Value,
        ) -> Result<AssertedKey, CeremonyError> {
            if self.pending.lock().await.remove(&ceremony_id).is_none() {
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
}
