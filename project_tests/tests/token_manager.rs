//! Token manager against the mock auth endpoint.

use std::sync::Arc;

use lib_telemetry::AuthError;
use project_tests::{MockReply, MockUpstream, alternate_credentials};

#[tokio::test]
async fn authenticates_once_and_reuses_the_token() {
    let upstream = MockUpstream::start().await;
    let tokens = upstream.token_manager(None);

    assert!(!tokens.is_authenticated().await);
    tokens.ensure_authenticated().await.unwrap();
    tokens.ensure_authenticated().await.unwrap();

    assert!(tokens.is_authenticated().await);
    assert_eq!(tokens.bearer().await.unwrap(), "token-1");
    assert_eq!(upstream.token_requests(), 1);
    assert_eq!(upstream.client_ids(), ["primary-client"]);
}

#[tokio::test]
async fn concurrent_callers_share_one_refresh() {
    let upstream = MockUpstream::start().await;
    let tokens = Arc::new(upstream.token_manager(None));

    let callers: Vec<_> = (0..16)
        .map(|_| {
            let tokens = tokens.clone();
            tokio::spawn(async move { tokens.bearer().await })
        })
        .collect();
    for caller in callers {
        assert_eq!(caller.await.unwrap().unwrap(), "token-1");
    }

    assert_eq!(upstream.token_requests(), 1);
}

#[tokio::test]
async fn rejection_leaves_the_token_invalid() {
    let upstream = MockUpstream::start().await;
    upstream.script_auth([MockReply::Status(401)]);
    let tokens = upstream.token_manager(None);

    let err = tokens.ensure_authenticated().await.unwrap_err();
    assert!(matches!(err, AuthError::Rejected { status: 401, .. }));
    assert!(!tokens.is_authenticated().await);

    // No internal retry: the next call is a fresh exchange.
    tokens.ensure_authenticated().await.unwrap();
    assert_eq!(upstream.token_requests(), 2);
}

#[tokio::test]
async fn malformed_token_body_is_reported() {
    let upstream = MockUpstream::start().await;
    upstream.script_auth([MockReply::Garbage]);
    let tokens = upstream.token_manager(None);

    let err = tokens.ensure_authenticated().await.unwrap_err();
    assert!(matches!(err, AuthError::MalformedResponse(_)));
    assert!(!tokens.is_authenticated().await);
}

#[tokio::test]
async fn stale_invalidation_keeps_a_fresher_token() {
    let upstream = MockUpstream::start().await;
    let tokens = upstream.token_manager(None);

    let first = tokens.bearer().await.unwrap();
    tokens.invalidate(&first).await;
    let second = tokens.bearer().await.unwrap();
    assert_eq!(second, "token-2");

    // A late 401 for the first token must not drop the second one.
    tokens.invalidate(&first).await;
    assert!(tokens.is_authenticated().await);
    assert_eq!(upstream.token_requests(), 2);
}

#[tokio::test]
async fn alternate_credentials_are_used_once() {
    let upstream = MockUpstream::start().await;
    let tokens = upstream.token_manager(Some(alternate_credentials()));

    tokens.ensure_authenticated().await.unwrap();
    assert!(tokens.swap_to_alternate());
    assert!(!tokens.swap_to_alternate());
    assert_eq!(tokens.active_client_id(), "alternate-client");

    tokens.invalidate_all().await;
    tokens.ensure_authenticated().await.unwrap();
    assert_eq!(upstream.client_ids(), ["primary-client", "alternate-client"]);
}
