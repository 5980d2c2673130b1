//! `webauthn-rs` backed ceremonies for hardware security keys.
//!
//! Uses the `SecurityKey` flavour (second factor, not passkeys). Protocol state
//! between begin and finish lives in memory and expires after the configured TTL.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;
use webauthn_rs::prelude::*;

use super::{AssertedKey, CeremonyError, RegisteredKey, SecurityKeyCeremony};
use crate::credentials::WebAuthnCredential;

struct Pending<T> {
    state: T,
    created_at: Instant,
}

impl<T> Pending<T> {
    fn new(state: T) -> Self {
        Self {
            state,
            created_at: Instant::now(),
        }
    }
}

pub struct WebauthnCeremony {
    webauthn: Arc<Webauthn>,
    ttl: Duration,
    registrations: Mutex<HashMap<Uuid, Pending<SecurityKeyRegistration>>>,
    assertions: Mutex<HashMap<Uuid, Pending<SecurityKeyAuthentication>>>,
}

impl WebauthnCeremony {
    /// Create a ceremony driver for the given relying party.
    ///
    /// # Errors
    /// Returns error if the origin is not a URL or the `WebAuthn` builder rejects
    /// the RP id / origin pair.
    pub fn new(rp_id: &str, rp_origin: &str, ttl: Duration) -> Result<Self> {
        let rp_origin_url = Url::parse(rp_origin)?;
        let webauthn = WebauthnBuilder::new(rp_id, &rp_origin_url)?
            .rp_name("Fleetgate")
            .build()?;

        Ok(Self {
            webauthn: Arc::new(webauthn),
            ttl,
            registrations: Mutex::new(HashMap::new()),
            assertions: Mutex::new(HashMap::new()),
        })
    }

    fn is_live<T>(&self, pending: &Pending<T>) -> bool {
        pending.created_at.elapsed() < self.ttl
    }
}

fn to_value<T: serde::Serialize>(challenge: &T) -> Result<Value, CeremonyError> {
    serde_json::to_value(challenge).map_err(|e| CeremonyError::Rejected(e.to_string()))
}

fn rejected(err: &WebauthnError) -> CeremonyError {
    match err {
        WebauthnError::CredentialPossibleCompromise => CeremonyError::PossibleClone,
        other => CeremonyError::Rejected(other.to_string()),
    }
}

#[async_trait]
impl SecurityKeyCeremony for WebauthnCeremony {
    async fn begin_registration(
        &self,
        ceremony_id: Uuid,
        user_id: Uuid,
        user_name: &str,
        exclude: &[Vec<u8>],
    ) -> Result<Value, CeremonyError> {
        let exclude_credentials: Vec<CredentialID> =
            exclude.iter().map(|id| id.clone().into()).collect();

        let (challenge, registration) = self
            .webauthn
            .start_securitykey_registration(
                user_id,
                user_name,
                user_name,
                Some(exclude_credentials),
                None,
                None,
            )
            .map_err(|e| rejected(&e))?;

        self.registrations
            .lock()
            .await
            .insert(ceremony_id, Pending::new(registration));
        to_value(&challenge)
    }

    async fn finish_registration(
        &self,
        ceremony_id: Uuid,
        response: &Value,
    ) -> Result<RegisteredKey, CeremonyError> {
        let mut states = self.registrations.lock().await;
        let pending = states
            .get(&ceremony_id)
            .filter(|pending| self.is_live(pending))
            .ok_or(CeremonyError::UnknownCeremony)?;

        let credential: RegisterPublicKeyCredential = serde_json::from_value(response.clone())
            .map_err(|e| CeremonyError::Rejected(format!("malformed attestation: {e}")))?;

        let key = self
            .webauthn
            .finish_securitykey_registration(&credential, &pending.state)
            .map_err(|e| {
                warn!(ceremony_id = %ceremony_id, "Security key registration rejected: {e}");
                rejected(&e)
            })?;

        states.remove(&ceremony_id);
        let public_key =
            serde_json::to_vec(&key).map_err(|e| CeremonyError::Rejected(e.to_string()))?;

        Ok(RegisteredKey {
            credential_id: key.cred_id().as_slice().to_vec(),
            public_key,
            sign_count: 0,
        })
    }

    async fn begin_assertion(
        &self,
        ceremony_id: Uuid,
        credentials: &[WebAuthnCredential],
    ) -> Result<Value, CeremonyError> {
        let keys: Vec<SecurityKey> = credentials
            .iter()
            .filter_map(|credential| serde_json::from_slice(&credential.public_key).ok())
            .collect();
        if keys.is_empty() {
            return Err(CeremonyError::Rejected(
                "no security keys registered".to_string(),
            ));
        }

        let (challenge, authentication) = self
            .webauthn
            .start_securitykey_authentication(&keys)
            .map_err(|e| rejected(&e))?;

        self.assertions
            .lock()
            .await
            .insert(ceremony_id, Pending::new(authentication));
        to_value(&challenge)
    }

    async fn finish_assertion(
        &self,
        ceremony_id: Uuid,
        response: &Value,
    ) -> Result<AssertedKey, CeremonyError> {
        let pending = self
            .assertions
            .lock()
            .await
            .remove(&ceremony_id)
            .filter(|pending| self.is_live(pending))
            .ok_or(CeremonyError::UnknownCeremony)?;

        let credential: PublicKeyCredential = serde_json::from_value(response.clone())
            .map_err(|e| CeremonyError::Rejected(format!("malformed assertion: {e}")))?;

        let result = self
            .webauthn
            .finish_securitykey_authentication(&credential, &pending.state)
            .map_err(|e| {
                warn!(ceremony_id = %ceremony_id, "Security key assertion rejected: {e}");
                rejected(&e)
            })?;

        Ok(AssertedKey {
            credential_id: result.cred_id().as_slice().to_vec(),
            counter: result.counter(),
        })
    }

    async fn discard(&self, ceremony_id: Uuid) {
        self.registrations.lock().await.remove(&ceremony_id);
        self.assertions.lock().await.remove(&ceremony_id);
    }

    async fn purge_expired(&self) -> usize {
        let mut removed = 0;
        {
            let mut states = self.registrations.lock().await;
            let before = states.len();
            states.retain(|_, pending| pending.created_at.elapsed() < self.ttl);
            removed += before - states.len();
        }
        {
            let mut states = self.assertions.lock().await;
            let before = states.len();
            states.retain(|_, pending| pending.created_at.elapsed() < self.ttl);
            removed += before - states.len();
        }
        if removed > 0 {
            debug!(removed, "Purged expired security key ceremonies");
        }
        removed
    }
}
