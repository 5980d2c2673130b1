//! Enrollment session records and the per-user registry that holds them.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex as StdMutex, PoisonError},
};
use tokio::sync::Mutex;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::credentials::BackupCode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentMethod {
    Webauthn,
    Totp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentState {
    ChooseMethod,
    SetupWebauthn,
    SetupTotp,
    VerifyTotp,
    BackupCodesIssued,
    Complete,
    Abandoned,
}

/// Server-held state of one enrollment attempt. Nothing in here reaches the
/// credential store before commit.
pub(crate) struct EnrollmentSession {
    pub(crate) id: Uuid,
    pub(crate) method: EnrollmentMethod,
    pub(crate) state: EnrollmentState,
    pub(crate) totp_secret: Option<SecretString>,
    pub(crate) pending_codes: Option<Vec<BackupCode>>,
    pub(crate) failures: VecDeque<DateTime<Utc>>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) expires_at: DateTime<Utc>,
}

impl EnrollmentSession {
    pub(crate) fn new(method: EnrollmentMethod, now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        let state = match method {
            EnrollmentMethod::Webauthn => EnrollmentState::SetupWebauthn,
            EnrollmentMethod::Totp => EnrollmentState::SetupTotp,
        };
        Self {
            id: Uuid::new_v4(),
            method,
            state,
            totp_secret: None,
            pending_codes: None,
            failures: VecDeque::new(),
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub(crate) fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

pub(crate) type Slot = Arc<Mutex<Option<EnrollmentSession>>>;

/// One slot per user. Holding a slot's lock serializes every transition for
/// that user, so at most one session can ever be live.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    slots: StdMutex<HashMap<Uuid, Slot>>,
}

impl SessionRegistry {
    pub(crate) fn slot(&self, user_id: Uuid) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(user_id).or_default())
    }

    pub(crate) fn existing(&self, user_id: Uuid) -> Option<Slot> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .cloned()
    }

    pub(crate) fn snapshot(&self) -> Vec<(Uuid, Slot)> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(user_id, slot)| (*user_id, Arc::clone(slot)))
            .collect()
    }

    /// Drop empty slots nobody else holds. Clones are only handed out under the
    /// map lock, so a strong count of one means no caller can be using it.
    pub(crate) fn compact(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1
                || slot.try_lock().map_or(true, |session| session.is_some())
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
