//! # OpenSky Fetch Client
//!
//! Pulls the state vectors of one bounding box from `GET /states/all` with a
//! bearer token from the [`TokenManager`].
//!
//! ## Status handling:
//! - **200**: the body is decoded positionally; bad records are skipped.
//! - **401**: the token is invalidated. Under [`UnauthorizedPolicy::RetryOnce`]
//!   the client re-authenticates and re-issues the same request exactly once.
//! - **429**: the client swaps to the alternate credentials (once), refreshes
//!   the token eagerly and reports [`FetchError::RateLimited`].
//! - **anything else**: [`FetchError::Transport`].

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::decode::decode_states;
use super::token::TokenManager;
use crate::error::FetchError;
use crate::models::{Credentials, StateRecord};

/// Default REST root of the OpenSky API.
pub const DEFAULT_BASE_URL: &str = "https://opensky-network.org/api";
/// Default OpenSky Keycloak token endpoint.
pub const DEFAULT_AUTH_URL: &str =
    "https://auth.opensky-network.org/auth/realms/opensky-network/protocol/openid-connect/token";

/// What the client does when the upstream answers 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnauthorizedPolicy {
    /// Re-authenticate and repeat the request once before giving up.
    #[default]
    RetryOnce,
    /// Return [`FetchError::Unauthorized`] immediately.
    Surface,
}

impl std::str::FromStr for UnauthorizedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "retry-once" | "retry_once" | "retryonce" => Ok(Self::RetryOnce),
            "surface" => Ok(Self::Surface),
            other => Err(format!("unknown 401 policy '{}'", other)),
        }
    }
}

/// Geographic query window in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// Lower latitude bound.
    pub lamin: f64,
    /// Lower longitude bound.
    pub lomin: f64,
    /// Upper latitude bound.
    pub lamax: f64,
    /// Upper longitude bound.
    pub lomax: f64,
}

impl Default for BoundingBox {
    // Indonesian airspace.
    fn default() -> Self {
        Self {
            lamin: -11.0,
            lomin: 95.0,
            lamax: 6.0,
            lomax: 141.0,
        }
    }
}

/// Resolved upstream settings.
#[derive(Debug, Clone)]
pub struct OpenSkySettings {
    /// REST root, e.g. `https://opensky-network.org/api`.
    pub base_url: String,
    /// OAuth2 token endpoint.
    pub auth_url: String,
    /// Query window.
    pub bbox: BoundingBox,
    /// 401 handling.
    pub unauthorized: UnauthorizedPolicy,
    /// Per-request timeout, covering both the token exchange and the query.
    pub request_timeout: Duration,
}

impl Default for OpenSkySettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            bbox: BoundingBox::default(),
            unauthorized: UnauthorizedPolicy::default(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Anything that can produce one snapshot of state vectors.
#[async_trait]
pub trait FetchStates: Send + Sync {
    /// Fetches and decodes one snapshot.
    async fn fetch_states(&self) -> Result<Vec<StateRecord>, FetchError>;
}

enum Reply {
    Body(Vec<u8>),
    Unauthorized,
    RateLimited,
}

/// # OpenSky Client
///
/// Cheap to share behind an `Arc`; the inner `reqwest::Client` pools connections.
pub struct OpenSkyClient {
    client: reqwest::Client,
    states_url: Url,
    tokens: Arc<TokenManager>,
    unauthorized: UnauthorizedPolicy,
}

impl OpenSkyClient {
    /// Builds the HTTP client and token manager from settings and credentials.
    pub fn new(
        settings: &OpenSkySettings,
        credentials: Credentials,
        alternate: Option<Credentials>,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(concat!("skystream/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let auth_url = Url::parse(&settings.auth_url)
            .map_err(|e| FetchError::Transport(format!("invalid auth URL: {}", e)))?;
        let tokens = Arc::new(TokenManager::new(
            client.clone(),
            auth_url,
            credentials,
            alternate,
        ));
        Self::with_tokens(client, settings, tokens)
    }

    /// Builds a client around an existing token manager.
    pub fn with_tokens(
        client: reqwest::Client,
        settings: &OpenSkySettings,
        tokens: Arc<TokenManager>,
    ) -> Result<Self, FetchError> {
        Ok(Self {
            client,
            states_url: states_url(&settings.base_url, &settings.bbox)?,
            tokens,
            unauthorized: settings.unauthorized,
        })
    }

    /// The token manager backing this client.
    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    async fn query(&self, bearer: &str) -> Result<Reply, FetchError> {
        let response = self
            .client
            .get(self.states_url.clone())
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| FetchError::Transport(e.to_string()))?;
                Ok(Reply::Body(body.to_vec()))
            }
            StatusCode::UNAUTHORIZED => Ok(Reply::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS => Ok(Reply::RateLimited),
            other => Err(FetchError::Transport(format!(
                "unexpected status {} from {}",
                other,
                self.states_url.path()
            ))),
        }
    }

    async fn rate_limited(&self) -> Result<Vec<StateRecord>, FetchError> {
        log::warn!("Rate limited by upstream (429).");
        if self.tokens.swap_to_alternate() {
            self.tokens.invalidate_all().await;
            if let Err(e) = self.tokens.ensure_authenticated().await {
                log::warn!("Re-authentication with alternate credentials failed: {}", e);
            }
        }
        Err(FetchError::RateLimited)
    }
}

#[async_trait]
impl FetchStates for OpenSkyClient {
    async fn fetch_states(&self) -> Result<Vec<StateRecord>, FetchError> {
        let bearer = self.tokens.bearer().await?;

        match self.query(&bearer).await? {
            Reply::Body(body) => decode_states(&body),
            Reply::RateLimited => self.rate_limited().await,
            Reply::Unauthorized => {
                self.tokens.invalidate(&bearer).await;
                if self.unauthorized == UnauthorizedPolicy::Surface {
                    return Err(FetchError::Unauthorized);
                }

                log::info!("Re-authenticating and repeating the request once...");
                let bearer = self.tokens.bearer().await?;
                match self.query(&bearer).await? {
                    Reply::Body(body) => decode_states(&body),
                    Reply::RateLimited => self.rate_limited().await,
                    Reply::Unauthorized => {
                        self.tokens.invalidate(&bearer).await;
                        Err(FetchError::Unauthorized)
                    }
                }
            }
        }
    }
}

fn states_url(base: &str, bbox: &BoundingBox) -> Result<Url, FetchError> {
    let raw = format!("{}/states/all", base.trim_end_matches('/'));
    let mut url =
        Url::parse(&raw).map_err(|e| FetchError::Transport(format!("invalid base URL: {}", e)))?;
    url.query_pairs_mut()
        .append_pair("lamin", &bbox.lamin.to_string())
        .append_pair("lomin", &bbox.lomin.to_string())
        .append_pair("lamax", &bbox.lamax.to_string())
        .append_pair("lomax", &bbox.lomax.to_string());
    Ok(url)
}
