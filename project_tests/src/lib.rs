//! # Integration Fixtures
//!
//! Shared helpers for the tests under `tests/`:
//!
//! - [`MockUpstream`]: a local axum server impersonating both the OpenSky
//!   `/states/all` endpoint and the OAuth2 token endpoint, with scripted replies.
//! - [`ScriptedFetcher`]: a [`FetchStates`] stub for poller tests that must not
//!   touch the network.
//! - Sample payloads and a client builder wired to the mock.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use lib_telemetry::retrieve::{BoundingBox, FetchStates, OpenSkyClient, OpenSkySettings, TokenManager, UnauthorizedPolicy};
use lib_telemetry::{Credentials, FetchError, StateRecord};

/// One scripted reply of the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockReply {
    /// 200 with a well-formed body.
    Ok,
    /// The given status with an empty body.
    Status(u16),
    /// 200 with a body that is not what the client expects.
    Garbage,
}

#[derive(Default)]
struct MockState {
    auth_script: Mutex<VecDeque<MockReply>>,
    states_script: Mutex<VecDeque<MockReply>>,
    token_requests: AtomicUsize,
    states_requests: AtomicUsize,
    client_ids: Mutex<Vec<String>>,
    bearers: Mutex<Vec<String>>,
    states_body: Mutex<Value>,
}

impl MockState {
    fn next(script: &Mutex<VecDeque<MockReply>>) -> MockReply {
        script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or(MockReply::Ok)
    }
}

/// # Mock Upstream
///
/// Unscripted requests answer `200` with a valid body. Tokens are issued as
/// `token-1`, `token-2`, ... in request order.
pub struct MockUpstream {
    /// Value for `OpenSkySettings::base_url`.
    pub base_url: String,
    /// Value for `OpenSkySettings::auth_url`.
    pub auth_url: String,
    state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl MockUpstream {
    /// Binds `127.0.0.1:0` and starts serving [`sample_states_body`].
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        *state.states_body.lock().unwrap() = sample_states_body();

        let app = Router::new()
            .route("/api/states/all", get(states_handler))
            .route("/auth/token", post(token_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock upstream");
        let addr = listener.local_addr().expect("mock address");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{}/api", addr),
            auth_url: format!("http://{}/auth/token", addr),
            state,
            task,
        }
    }

    /// Queues replies for the token endpoint.
    pub fn script_auth(&self, replies: impl IntoIterator<Item = MockReply>) {
        self.state.auth_script.lock().unwrap().extend(replies);
    }

    /// Queues replies for `/states/all`.
    pub fn script_states(&self, replies: impl IntoIterator<Item = MockReply>) {
        self.state.states_script.lock().unwrap().extend(replies);
    }

    /// Replaces the body served on a `200` from `/states/all`.
    pub fn set_states_body(&self, body: Value) {
        *self.state.states_body.lock().unwrap() = body;
    }

    pub fn token_requests(&self) -> usize {
        self.state.token_requests.load(Ordering::SeqCst)
    }

    pub fn states_requests(&self) -> usize {
        self.state.states_requests.load(Ordering::SeqCst)
    }

    /// `client_id` of every token request, in order.
    pub fn client_ids(&self) -> Vec<String> {
        self.state.client_ids.lock().unwrap().clone()
    }

    /// Bearer token of every states request, in order.
    pub fn bearers(&self) -> Vec<String> {
        self.state.bearers.lock().unwrap().clone()
    }

    /// Settings pointing at this mock.
    pub fn settings(&self, unauthorized: UnauthorizedPolicy) -> OpenSkySettings {
        OpenSkySettings {
            base_url: self.base_url.clone(),
            auth_url: self.auth_url.clone(),
            bbox: BoundingBox::default(),
            unauthorized,
            request_timeout: Duration::from_secs(5),
        }
    }

    /// A standalone token manager against this mock's auth endpoint.
    pub fn token_manager(&self, alternate: Option<Credentials>) -> TokenManager {
        let auth_url = url::Url::parse(&self.auth_url).expect("mock auth URL");
        TokenManager::new(reqwest::Client::new(), auth_url, primary_credentials(), alternate)
    }

    /// A fetch client against this mock.
    pub fn client(&self, unauthorized: UnauthorizedPolicy, alternate: Option<Credentials>) -> OpenSkyClient {
        OpenSkyClient::new(&self.settings(unauthorized), primary_credentials(), alternate).expect("build client")
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn token_handler(State(state): State<Arc<MockState>>, Form(form): Form<HashMap<String, String>>) -> Response {
    let n = state.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
    state
        .client_ids
        .lock()
        .unwrap()
        .push(form.get("client_id").cloned().unwrap_or_default());

    if form.get("grant_type").map(String::as_str) != Some("client_credentials") {
        return StatusCode::BAD_REQUEST.into_response();
    }

    match MockState::next(&state.auth_script) {
        MockReply::Ok => Json(json!({
            "access_token": format!("token-{}", n),
            "expires_in": 1800,
            "token_type": "Bearer",
        }))
        .into_response(),
        MockReply::Status(code) => status(code).into_response(),
        MockReply::Garbage => (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], "{\"token\":")
            .into_response(),
    }
}

async fn states_handler(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    state.states_requests.fetch_add(1, Ordering::SeqCst);
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string();
    state.bearers.lock().unwrap().push(bearer);

    match MockState::next(&state.states_script) {
        MockReply::Ok => Json(state.states_body.lock().unwrap().clone()).into_response(),
        MockReply::Status(code) => status(code).into_response(),
        MockReply::Garbage => (StatusCode::OK, "<html>maintenance</html>").into_response(),
    }
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

pub fn primary_credentials() -> Credentials {
    Credentials::new("primary-client", "primary-secret")
}

pub fn alternate_credentials() -> Credentials {
    Credentials::new("alternate-client", "alternate-secret")
}

/// Two valid aircraft (the second without longitude) and one truncated record.
pub fn sample_states_body() -> Value {
    json!({
        "time": 1_700_000_010,
        "states": [
            ["8a02ff", "GIA404  ", "Indonesia", 1_700_000_005, 1_700_000_006, 106.65, -6.12, 1219.2,
             false, 110.5, 272.0, -3.2, null, 1249.7, "2301", false, 0],
            ["76cdb1", null, "Singapore", null, 1_700_000_007, null, 1.35, null,
             true, null, null, null, null, null, null, false, 0, 1],
            ["abc123", "TRUNC", "Nowhere", 1, 2]
        ]
    })
}

/// # Scripted Fetcher
///
/// Fails the first `failures` calls, then returns `records` forever.
pub struct ScriptedFetcher {
    failures: usize,
    calls: AtomicUsize,
    records: Vec<StateRecord>,
}

impl ScriptedFetcher {
    pub fn new(failures: usize, records: Vec<StateRecord>) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
            records,
        }
    }

    /// A fetcher that never succeeds.
    pub fn always_failing() -> Self {
        Self::new(usize::MAX, Vec::new())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FetchStates for ScriptedFetcher {
    async fn fetch_states(&self) -> Result<Vec<StateRecord>, FetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(FetchError::Transport("upstream unreachable".into()))
        } else {
            Ok(self.records.clone())
        }
    }
}
