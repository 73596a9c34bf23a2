//! # Token Manager
//!
//! Owns the OAuth2 access token for the OpenSky API and refreshes it through the
//! `client_credentials` grant.
//!
//! ## Core Design Principles:
//! 1. **Double-checked refresh**: the fast path is a shared read of the token.
//!    Only when it is invalid does a caller take the refresh lock, re-check, and
//!    perform the exchange, so concurrent callers trigger one HTTP call.
//! 2. **No internal retries**: a failed exchange returns [`AuthError`] and leaves
//!    the token invalid. Retrying is the caller's policy.
//! 3. **One-shot credential fallback**: an alternate credential set can replace
//!    the primary one exactly once, used when the upstream rate limits us.

use serde::Deserialize;
use std::sync::RwLock as StdRwLock;
use tokio::sync::{Mutex, RwLock};
use url::Url;

use crate::error::AuthError;
use crate::models::{AccessToken, Credentials};

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

struct CredentialSet {
    active: Credentials,
    alternate: Option<Credentials>,
}

/// # Token Manager
///
/// Shared by every fetch through an `Arc`. The token is the only lock-guarded
/// mutable state on the producer path.
pub struct TokenManager {
    client: reqwest::Client,
    auth_url: Url,
    credentials: StdRwLock<CredentialSet>,
    token: RwLock<AccessToken>,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    /// Creates a manager that starts unauthenticated.
    pub fn new(
        client: reqwest::Client,
        auth_url: Url,
        credentials: Credentials,
        alternate: Option<Credentials>,
    ) -> Self {
        Self {
            client,
            auth_url,
            credentials: StdRwLock::new(CredentialSet {
                active: credentials,
                alternate,
            }),
            token: RwLock::new(AccessToken::default()),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Makes sure a valid token is held, exchanging credentials if needed.
    pub async fn ensure_authenticated(&self) -> Result<(), AuthError> {
        self.bearer().await.map(|_| ())
    }

    /// Returns a valid bearer string, refreshing first when the token is invalid.
    pub async fn bearer(&self) -> Result<String, AuthError> {
        // --- Fast path: shared read ---
        {
            let token = self.token.read().await;
            if token.authenticated {
                return Ok(token.bearer.clone());
            }
        }

        // --- Slow path: one refresher at a time ---
        let _guard = self.refresh_lock.lock().await;
        {
            let token = self.token.read().await;
            if token.authenticated {
                return Ok(token.bearer.clone());
            }
        }

        log::info!("Access token missing or invalid. Authenticating against {}", self.auth_url);
        let bearer = self.exchange().await?;
        let mut token = self.token.write().await;
        token.bearer = bearer.clone();
        token.authenticated = true;
        Ok(bearer)
    }

    /// Marks the token invalid if it is still `stale`.
    ///
    /// A caller that got a 401 with an old bearer must not clobber a token that
    /// another caller has refreshed in the meantime.
    pub async fn invalidate(&self, stale: &str) {
        let mut token = self.token.write().await;
        if token.bearer == stale && token.authenticated {
            log::warn!("Access token rejected by upstream. Invalidating.");
            token.authenticated = false;
        }
    }

    /// Unconditionally marks the token invalid.
    pub async fn invalidate_all(&self) {
        self.token.write().await.authenticated = false;
    }

    /// Whether a valid token is currently held.
    pub async fn is_authenticated(&self) -> bool {
        self.token.read().await.authenticated
    }

    /// Switches to the alternate credential set. Returns `false` when there is
    /// none or it is already in use.
    pub fn swap_to_alternate(&self) -> bool {
        let mut set = self
            .credentials
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match set.alternate.take() {
            Some(alternate) => {
                log::warn!(
                    "Switching from client '{}' to alternate client '{}'",
                    set.active.client_id,
                    alternate.client_id
                );
                set.active = alternate;
                true
            }
            None => false,
        }
    }

    /// Client id of the credential set currently in use.
    pub fn active_client_id(&self) -> String {
        self.credentials
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .active
            .client_id
            .clone()
    }

    async fn exchange(&self) -> Result<String, AuthError> {
        let credentials = self
            .credentials
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .active
            .clone();

        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
        ];

        let response = self
            .client
            .post(self.auth_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::MalformedResponse(e.to_string()))?;
        if parsed.access_token.is_empty() {
            return Err(AuthError::MalformedResponse("empty access_token".into()));
        }

        log::info!("Authenticated as '{}'", credentials.client_id);
        Ok(parsed.access_token)
    }
}
