//! OpenSky fetch client against the mock upstream: decoding, 401 policies,
//! 429 credential fallback.

use lib_telemetry::retrieve::{FetchStates, UnauthorizedPolicy};
use lib_telemetry::{FetchError, TelemetryEvent};
use project_tests::{MockReply, MockUpstream, alternate_credentials};

#[tokio::test]
async fn decodes_valid_records_and_skips_truncated_ones() {
    let upstream = MockUpstream::start().await;
    let client = upstream.client(UnauthorizedPolicy::RetryOnce, None);

    let records = client.fetch_states().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].icao24, "8a02ff");
    assert_eq!(records[0].longitude, Some(106.65));
    assert_eq!(records[1].longitude, None);
    assert_eq!(records[1].category, Some(1));

    let events: Vec<TelemetryEvent> = records.iter().map(TelemetryEvent::from).collect();
    assert_eq!(events[0].callsign, "GIA404");
    assert_eq!(events[1].lon, 0.0);
    assert_eq!(events[1].velocity, 0.0);
    assert_eq!(events[1].time_position, 0);

    assert_eq!(upstream.bearers(), ["token-1"]);
}

#[tokio::test]
async fn null_states_is_an_empty_snapshot() {
    let upstream = MockUpstream::start().await;
    upstream.set_states_body(serde_json::json!({ "time": 1_700_000_000, "states": null }));
    let client = upstream.client(UnauthorizedPolicy::RetryOnce, None);

    assert!(client.fetch_states().await.unwrap().is_empty());
}

#[tokio::test]
async fn retry_once_reauthenticates_and_repeats_the_request() {
    let upstream = MockUpstream::start().await;
    upstream.script_states([MockReply::Status(401)]);
    let client = upstream.client(UnauthorizedPolicy::RetryOnce, None);

    let records = client.fetch_states().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(upstream.token_requests(), 2);
    assert_eq!(upstream.bearers(), ["token-1", "token-2"]);
}

#[tokio::test]
async fn retry_once_gives_up_after_the_second_401() {
    let upstream = MockUpstream::start().await;
    upstream.script_states([MockReply::Status(401), MockReply::Status(401)]);
    let client = upstream.client(UnauthorizedPolicy::RetryOnce, None);

    assert_eq!(client.fetch_states().await.unwrap_err(), FetchError::Unauthorized);
    assert_eq!(upstream.states_requests(), 2);
    assert!(!client.tokens().is_authenticated().await);
}

#[tokio::test]
async fn surface_policy_returns_unauthorized_immediately() {
    let upstream = MockUpstream::start().await;
    upstream.script_states([MockReply::Status(401)]);
    let client = upstream.client(UnauthorizedPolicy::Surface, None);

    assert_eq!(client.fetch_states().await.unwrap_err(), FetchError::Unauthorized);
    assert_eq!(upstream.states_requests(), 1);
    assert!(!client.tokens().is_authenticated().await);

    // The caller's next attempt refreshes and succeeds.
    assert_eq!(client.fetch_states().await.unwrap().len(), 2);
    assert_eq!(upstream.token_requests(), 2);
}

#[tokio::test]
async fn rate_limit_swaps_to_alternate_credentials_once() {
    let upstream = MockUpstream::start().await;
    upstream.script_states([MockReply::Status(429), MockReply::Status(429)]);
    let client = upstream.client(UnauthorizedPolicy::RetryOnce, Some(alternate_credentials()));

    assert_eq!(client.fetch_states().await.unwrap_err(), FetchError::RateLimited);
    assert_eq!(upstream.client_ids(), ["primary-client", "alternate-client"]);
    assert!(client.tokens().is_authenticated().await);

    assert_eq!(client.fetch_states().await.unwrap_err(), FetchError::RateLimited);
    assert_eq!(upstream.token_requests(), 2);

    assert_eq!(client.fetch_states().await.unwrap().len(), 2);
    assert_eq!(upstream.bearers().last().map(String::as_str), Some("token-2"));
}

#[tokio::test]
async fn rate_limit_without_alternate_just_reports() {
    let upstream = MockUpstream::start().await;
    upstream.script_states([MockReply::Status(429)]);
    let client = upstream.client(UnauthorizedPolicy::RetryOnce, None);

    assert_eq!(client.fetch_states().await.unwrap_err(), FetchError::RateLimited);
    assert_eq!(upstream.token_requests(), 1);
}

#[tokio::test]
async fn server_errors_and_bad_bodies_are_cycle_failures() {
    let upstream = MockUpstream::start().await;
    upstream.script_states([MockReply::Status(503), MockReply::Garbage]);
    let client = upstream.client(UnauthorizedPolicy::RetryOnce, None);

    assert!(matches!(client.fetch_states().await, Err(FetchError::Transport(_))));
    assert!(matches!(client.fetch_states().await, Err(FetchError::Decode(_))));
}

#[tokio::test]
async fn auth_failure_is_wrapped() {
    let upstream = MockUpstream::start().await;
    upstream.script_auth([MockReply::Status(500)]);
    let client = upstream.client(UnauthorizedPolicy::RetryOnce, None);

    let err = client.fetch_states().await.unwrap_err();
    assert!(matches!(err, FetchError::Auth(_)));
    assert!(err.is_auth_related());
    assert_eq!(upstream.states_requests(), 0);
}
