//! Resolve an opaque session token into a `Principal`.
//!
//! Read-only: validation never extends or refreshes a session.

use std::{sync::Arc, time::Duration};
use tracing::{debug, instrument};

use crate::{
    credentials::{CredentialStore, bounded, hash_session_token},
    error::AuthError,
    identity::{Clock, Principal},
};

pub struct AuthenticationGateway {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl AuthenticationGateway {
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            store,
            clock,
            timeout,
        }
    }

    /// Validate `token` and build the request principal.
    ///
    /// # Errors
    /// `InvalidToken` for unknown tokens or users, `ExpiredToken`, `RevokedToken`,
    /// or `Unavailable` when the store fails or times out.
    #[instrument(skip_all)]
    pub async fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::InvalidToken);
        }

        let token_hash = hash_session_token(token);
        let session = bounded(self.timeout, self.store.lookup_session(&token_hash))
            .await?
            .ok_or(AuthError::InvalidToken)?;

        if session.revoked {
            debug!(session_id = %session.id, "Rejected revoked session");
            return Err(AuthError::RevokedToken);
        }
        if session.expires_at <= self.clock.now() {
            debug!(session_id = %session.id, "Rejected expired session");
            return Err(AuthError::ExpiredToken);
        }

        let user = bounded(self.timeout, self.store.get_user(session.user_id))
            .await?
            .ok_or(AuthError::InvalidToken)?;

        Ok(Principal {
            user_id: user.id,
            session_id: session.id,
            roles: user.roles,
            department: user.department,
            clearance_level: user.clearance_level,
            mfa_satisfied: session.mfa_satisfied && user.mfa_enrolled,
        })
    }
}
