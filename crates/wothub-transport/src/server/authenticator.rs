//! Authentication seam used by the server transports.
//!
//! Token issuance internals are not a transport concern; the transports only
//! need login, refresh and validation. The in-memory implementation backs the
//! tests and the provisioning service.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::RwLock;
use rand::RngCore;
use std::collections::HashMap;
use wothub_messaging::{TransportError, TransportResult};

/// Credential checks and token handling for server transports.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify a password and issue a session token.
    async fn login(&self, client_id: &str, password: &str) -> TransportResult<String>;

    /// Exchange a valid token for a fresh one.
    async fn refresh(&self, client_id: &str, old_token: &str) -> TransportResult<String>;

    /// Resolve a token to the authenticated client id.
    async fn validate(&self, token: &str) -> TransportResult<String>;

    /// Invalidate every session of the client.
    async fn logout(&self, client_id: &str);

    /// Issue a token without a password check. Used by the provisioning
    /// service after approving a device.
    async fn issue_token(&self, client_id: &str) -> TransportResult<String>;
}

/// In-memory credential and session store.
#[derive(Default)]
pub struct InMemoryAuthenticator {
    passwords: RwLock<HashMap<String, String>>,
    sessions: RwLock<HashMap<String, String>>,
}

impl InMemoryAuthenticator {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a client password.
    pub fn add_client(&self, client_id: &str, password: &str) {
        self.passwords.write().insert(client_id.to_string(), password.to_string());
    }

    /// Issue a session token without a password check. Synchronous so
    /// services embedded in the hub can call it from non-async handlers.
    pub fn issue(&self, client_id: &str) -> String {
        self.new_token(client_id)
    }

    fn new_token(&self, client_id: &str) -> String {
        let mut nonce = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut nonce);
        let token = URL_SAFE_NO_PAD.encode(nonce);
        self.sessions.write().insert(token.clone(), client_id.to_string());
        token
    }
}

#[async_trait]
impl Authenticator for InMemoryAuthenticator {
    async fn login(&self, client_id: &str, password: &str) -> TransportResult<String> {
        let ok = self
            .passwords
            .read()
            .get(client_id)
            .map(|p| p == password)
            .unwrap_or(false);
        if !ok {
            return Err(TransportError::unauthorized("invalid login"));
        }
        Ok(self.new_token(client_id))
    }

    async fn refresh(&self, client_id: &str, old_token: &str) -> TransportResult<String> {
        let valid = self
            .sessions
            .read()
            .get(old_token)
            .map(|cid| cid == client_id)
            .unwrap_or(false);
        if !valid {
            return Err(TransportError::unauthorized("invalid token"));
        }
        self.sessions.write().remove(old_token);
        Ok(self.new_token(client_id))
    }

    async fn validate(&self, token: &str) -> TransportResult<String> {
        self.sessions
            .read()
            .get(token)
            .cloned()
            .ok_or_else(|| TransportError::unauthorized("unknown token"))
    }

    async fn logout(&self, client_id: &str) {
        self.sessions.write().retain(|_, cid| cid != client_id);
    }

    async fn issue_token(&self, client_id: &str) -> TransportResult<String> {
        Ok(self.new_token(client_id))
    }
}
