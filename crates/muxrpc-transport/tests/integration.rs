//! End-to-end tests over real TCP sockets.
//!
//! Each test binds its servers on ephemeral localhost ports and talks to them through
//! a client channel, so calls cross the full frame codec, connection and retry stack.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    client, server, server_with, test_config, EchoHandler, FailingHandler, NotOkHandler,
    SlowHandler, TaggedHandler,
};
use muxrpc_transport::handler::NoHandler;
use muxrpc_transport::request::AttemptOutcome;
use muxrpc_transport::{
    classify, ErrorCode, RateLimiterConfig, RelayHandler, RetryFlags, TransportError,
};

#[tokio::test]
async fn test_echo_over_tcp() {
    let echo = Arc::new(EchoHandler::default());
    let srv = server(echo.clone()).await;
    let cli = client(&[&srv]);

    let res = cli
        .request(cli.request_options("echo").with_header("cn", "test"))
        .send("ping", "foo", "bar")
        .await
        .unwrap();
    assert!(res.ok);
    assert_eq!(res.arg2().as_ref(), b"foo");
    assert_eq!(res.arg3().as_ref(), b"bar");
    assert_eq!(res.headers.get("cn").map(String::as_str), Some("test"));
    assert_eq!(res.remote_addr, srv.host_port());
    assert_eq!(echo.calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    let metrics = cli.metrics();
    assert_eq!(metrics.calls_sent, 1);
    assert_eq!(metrics.attempts, 1);
    assert_eq!(metrics.retries, 0);
}

#[tokio::test]
async fn test_large_arguments_are_fragmented() {
    let srv = server(Arc::new(EchoHandler::default())).await;
    let cli = client(&[&srv]);
    let body = vec![7u8; 300 * 1024];

    let res = cli
        .request(cli.request_options("echo"))
        .send("big", "", body.clone())
        .await
        .unwrap();
    assert_eq!(res.arg3().len(), body.len());
    assert_eq!(res.arg3().as_ref(), body.as_slice());
}

#[tokio::test]
async fn test_connection_is_reused() {
    let srv = server(Arc::new(EchoHandler::default())).await;
    let cli = client(&[&srv]);
    for _ in 0..5 {
        cli.request(cli.request_options("echo"))
            .send("ep", "a", "b")
            .await
            .unwrap();
    }
    let peer = cli.peers().get(srv.host_port()).unwrap();
    assert_eq!(peer.count_connections(None), 1);
    assert_eq!(cli.metrics().connections_opened, 1);
}

#[tokio::test]
async fn test_busy_is_retried_on_another_peer() {
    let a = Arc::new(FailingHandler::new(ErrorCode::Busy));
    let b = Arc::new(FailingHandler::new(ErrorCode::Busy));
    let srv_a = server(a.clone()).await;
    let srv_b = server(b.clone()).await;
    let cli = client(&[&srv_a, &srv_b]);

    let (result, summary) = cli
        .request(cli.request_options("svc"))
        .send_with_summary("ep", "", "")
        .await;
    let err = result.unwrap_err();
    assert_eq!(classify(&err), Some(ErrorCode::Busy));
    assert_eq!(summary.attempts.len(), 2);
    assert_eq!(summary.tried.len(), 2);
    assert!(summary.tried.values().all(|&count| count == 1));
    assert_eq!(a.calls() + b.calls(), 2);
    assert!(summary
        .attempts
        .iter()
        .all(|attempt| attempt.outcome == AttemptOutcome::Error(Some(ErrorCode::Busy))));
    assert_eq!(cli.metrics().retries, 1);
}

#[tokio::test]
async fn test_busy_then_success() {
    let busy = Arc::new(FailingHandler::new(ErrorCode::Busy));
    let srv_busy = server(busy.clone()).await;
    let srv_ok = server(Arc::new(EchoHandler::default())).await;
    let cli = client(&[&srv_busy, &srv_ok]);

    let (result, summary) = cli
        .request(cli.request_options("svc"))
        .send_with_summary("ep", "x", "y")
        .await;
    let res = result.unwrap();
    assert_eq!(res.remote_addr, srv_ok.host_port());
    assert_eq!(summary.attempts.len(), busy.calls() + 1);
}

#[tokio::test]
async fn test_bad_request_is_never_retried() {
    let a = Arc::new(FailingHandler::new(ErrorCode::BadRequest));
    let b = Arc::new(FailingHandler::new(ErrorCode::BadRequest));
    let srv_a = server(a.clone()).await;
    let srv_b = server(b.clone()).await;
    let cli = client(&[&srv_a, &srv_b]);

    let (result, summary) = cli
        .request(cli.request_options("svc"))
        .send_with_summary("ep", "", "")
        .await;
    match result.unwrap_err() {
        TransportError::ErrorFrame { code, message, .. } => {
            assert_eq!(code, ErrorCode::BadRequest);
            assert_eq!(message, "always BadRequest");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(summary.attempts.len(), 1);
    assert_eq!(a.calls() + b.calls(), 1);
}

#[tokio::test]
async fn test_retry_never_flag() {
    let a = Arc::new(FailingHandler::new(ErrorCode::Busy));
    let b = Arc::new(FailingHandler::new(ErrorCode::Busy));
    let srv_a = server(a.clone()).await;
    let srv_b = server(b.clone()).await;
    let cli = client(&[&srv_a, &srv_b]);

    let (result, summary) = cli
        .request(cli.request_options("svc").with_retry_flags(RetryFlags::NEVER))
        .send_with_summary("ep", "", "")
        .await;
    assert!(result.is_err());
    assert_eq!(summary.attempts.len(), 1);
}

#[tokio::test]
async fn test_retry_limit_caps_attempts() {
    let mut servers = Vec::new();
    for _ in 0..4 {
        servers.push(server(Arc::new(FailingHandler::new(ErrorCode::Declined))).await);
    }
    let refs: Vec<&_> = servers.iter().collect();
    let cli = client(&refs);

    let (result, summary) = cli
        .request(cli.request_options("svc").with_retry_limit(2))
        .send_with_summary("ep", "", "")
        .await;
    assert_eq!(classify(&result.unwrap_err()), Some(ErrorCode::Declined));
    assert_eq!(summary.attempts.len(), 2);
}

#[tokio::test]
async fn test_tried_peers_are_excluded() {
    let mut servers = Vec::new();
    for _ in 0..3 {
        servers.push(server(Arc::new(FailingHandler::new(ErrorCode::Busy))).await);
    }
    let refs: Vec<&_> = servers.iter().collect();
    let cli = client(&refs);

    let (_, summary) = cli
        .request(cli.request_options("svc"))
        .send_with_summary("ep", "", "")
        .await;
    let mut addrs: Vec<&str> = summary
        .attempts
        .iter()
        .map(|attempt| attempt.remote_addr.as_str())
        .collect();
    assert_eq!(addrs.len(), 3);
    addrs.sort();
    addrs.dedup();
    assert_eq!(addrs.len(), 3);
}

#[tokio::test]
async fn test_no_peer_available() {
    let cli = client(&[]);
    let err = cli
        .request(cli.request_options("svc"))
        .send("ep", "", "")
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NoPeerAvailable));
    assert_eq!(classify(&err), Some(ErrorCode::Declined));
}

#[tokio::test]
async fn test_timeout_budget_is_respected() {
    let srv = server(Arc::new(SlowHandler {
        delay: Duration::from_secs(2),
    }))
    .await;
    let cli = client(&[&srv]);

    let (result, summary) = cli
        .request(cli.request_options("slow").with_timeout(Duration::from_millis(200)))
        .send_with_summary("ep", "", "")
        .await;
    let err = result.unwrap_err();
    assert_eq!(classify(&err), Some(ErrorCode::Timeout));
    assert_eq!(summary.attempts.len(), 1);
    assert!(summary.elapsed >= Duration::from_millis(190));
    assert!(summary.elapsed < Duration::from_millis(1500));
    assert_eq!(cli.metrics().timeouts, 1);
}

#[tokio::test]
async fn test_per_attempt_timeout_retries_elsewhere() {
    let slow = server(Arc::new(SlowHandler {
        delay: Duration::from_secs(2),
    }))
    .await;
    let fast = server(Arc::new(SlowHandler {
        delay: Duration::from_millis(10),
    }))
    .await;
    let cli = client(&[&slow, &fast]);

    let (result, summary) = cli
        .request(
            cli.request_options("svc")
                .with_timeout(Duration::from_millis(1500))
                .with_timeout_per_attempt(Duration::from_millis(200)),
        )
        .send_with_summary("ep", "a", "b")
        .await;
    let res = result.unwrap();
    assert_eq!(res.remote_addr, fast.host_port());
    assert!(summary.attempts.len() <= 2);
    assert!(summary.elapsed < Duration::from_millis(1500));
}

#[tokio::test]
async fn test_not_ok_is_a_response() {
    let srv = server(Arc::new(NotOkHandler)).await;
    let cli = client(&[&srv]);
    let res = cli
        .request(cli.request_options("svc"))
        .send("ep", "", "")
        .await
        .unwrap();
    assert!(!res.ok);
    assert_eq!(res.arg3().as_ref(), b"nope");
}

#[tokio::test]
async fn test_application_retry_predicate() {
    let a = server(Arc::new(NotOkHandler)).await;
    let b = server(Arc::new(NotOkHandler)).await;
    let cli = client(&[&a, &b]);

    let (result, summary) = cli
        .request(
            cli.request_options("svc")
                .with_application_retry(|res| res.arg3().as_ref() == b"nope"),
        )
        .send_with_summary("ep", "", "")
        .await;
    assert!(!result.unwrap().ok);
    assert_eq!(summary.attempts.len(), 2);
    assert!(summary
        .attempts
        .iter()
        .all(|attempt| attempt.outcome == AttemptOutcome::NotOk));
}

#[tokio::test]
async fn test_unhandled_service_is_declined() {
    let srv = server(Arc::new(NoHandler)).await;
    let cli = client(&[&srv]);
    let err = cli
        .request(cli.request_options("missing").with_retry_flags(RetryFlags::NEVER))
        .send("ep", "", "")
        .await
        .unwrap_err();
    assert_eq!(classify(&err), Some(ErrorCode::Declined));
}

#[tokio::test]
async fn test_relay_passes_arguments_through() {
    let backend = server(Arc::new(EchoHandler::default())).await;
    let relay = server(Arc::new(NoHandler)).await;
    relay.set_handler(Arc::new(RelayHandler::new(
        relay.peers(),
        relay.config().request.clone(),
    )));
    relay.peers().add(backend.host_port());
    let cli = client(&[&relay]);

    let res = cli
        .request(cli.request_options("echo").with_header("as", "raw"))
        .send("ep", "foo", "bar")
        .await
        .unwrap();
    assert!(res.ok);
    assert_eq!(res.arg2().as_ref(), b"foo");
    assert_eq!(res.arg3().as_ref(), b"bar");
    assert_eq!(res.headers.get("as").map(String::as_str), Some("raw"));
    assert_eq!(res.remote_addr, relay.host_port());
    assert_eq!(relay.metrics().relayed, 1);
}

#[tokio::test]
async fn test_relay_never_sends_call_back_to_caller() {
    let backend = server(Arc::new(TaggedHandler { tag: "backend" })).await;
    let relay = server(Arc::new(NoHandler)).await;
    relay.set_handler(Arc::new(RelayHandler::new(
        relay.peers(),
        relay.config().request.clone(),
    )));
    relay.peers().add(backend.host_port());
    let caller = server(Arc::new(TaggedHandler { tag: "caller" })).await;
    caller.peers().add(relay.host_port());

    for _ in 0..10 {
        let res = caller
            .request(caller.request_options("svc"))
            .send("ep", "", "")
            .await
            .unwrap();
        assert_eq!(res.arg3().as_ref(), b"backend");
    }
    assert!(relay.peers().get(caller.host_port()).is_some());
    assert_eq!(relay.metrics().relayed, 10);
}

#[tokio::test]
async fn test_relay_targets_restrict_backends() {
    let first = server(Arc::new(TaggedHandler { tag: "first" })).await;
    let second = server(Arc::new(TaggedHandler { tag: "second" })).await;
    let relay = server(Arc::new(NoHandler)).await;
    relay.set_handler(Arc::new(
        RelayHandler::new(relay.peers(), relay.config().request.clone())
            .with_targets("svc", [second.host_port()]),
    ));
    relay.peers().add(first.host_port());
    relay.peers().add(second.host_port());
    let cli = client(&[&relay]);

    for _ in 0..5 {
        let res = cli
            .request(cli.request_options("svc"))
            .send("ep", "", "")
            .await
            .unwrap();
        assert_eq!(res.arg3().as_ref(), b"second");
    }
}

#[tokio::test]
async fn test_oversized_call_fails_alone() {
    let srv = server(Arc::new(SlowHandler {
        delay: Duration::from_millis(200),
    }))
    .await;
    let cli = client(&[&srv]);
    cli.request(cli.request_options("svc"))
        .send("ep", "", "warm")
        .await
        .unwrap();
    let before: Vec<_> = cli.connections().iter().map(|conn| conn.id()).collect();

    let (sibling, oversized) = tokio::join!(
        cli.request(cli.request_options("svc")).send("ep", "", "sibling"),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cli.request(cli.request_options("svc").with_header("blob", "x".repeat(2 << 20)))
                .send("ep", "", "")
                .await
        }
    );

    let err = oversized.unwrap_err();
    assert!(matches!(err, TransportError::RequestTooLarge { .. }));
    assert_eq!(classify(&err), Some(ErrorCode::BadRequest));
    assert_eq!(sibling.unwrap().arg3().as_ref(), b"sibling");
    let after: Vec<_> = cli.connections().iter().map(|conn| conn.id()).collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_relay_forwards_error_codes() {
    let backend = server(Arc::new(FailingHandler::new(ErrorCode::BadRequest))).await;
    let relay = server(Arc::new(NoHandler)).await;
    relay.set_handler(Arc::new(RelayHandler::new(
        relay.peers(),
        relay.config().request.clone(),
    )));
    relay.peers().add(backend.host_port());
    let cli = client(&[&relay]);

    match cli.request(cli.request_options("svc")).send("ep", "", "").await {
        Err(TransportError::ErrorFrame { code, message, .. }) => {
            assert_eq!(code, ErrorCode::BadRequest);
            assert_eq!(message, "always BadRequest");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_relay_without_backend_declines() {
    let relay = server(Arc::new(NoHandler)).await;
    relay.set_handler(Arc::new(RelayHandler::new(
        relay.peers(),
        relay.config().request.clone(),
    )));
    let cli = client(&[&relay]);

    let err = cli
        .request(cli.request_options("svc").with_retry_flags(RetryFlags::NEVER))
        .send("ep", "", "")
        .await
        .unwrap_err();
    assert_eq!(classify(&err), Some(ErrorCode::Declined));
}

#[tokio::test]
async fn test_front_door_rate_limit() {
    let mut config = test_config();
    config.rate_limiter = Some(RateLimiterConfig {
        num_of_buckets: 10,
        total_rps_limit: 1,
        ..RateLimiterConfig::default()
    });
    let srv = server_with(config, Arc::new(EchoHandler::default())).await;
    let cli = client(&[&srv]);

    cli.request(cli.request_options("svc"))
        .send("ep", "", "")
        .await
        .unwrap();
    let err = cli
        .request(cli.request_options("svc"))
        .send("ep", "", "")
        .await
        .unwrap_err();
    assert_eq!(classify(&err), Some(ErrorCode::Busy));
    assert_eq!(srv.metrics().rate_limited, 1);
    assert!(srv.rate_limiter().unwrap().total_rps() >= 2);
}

#[tokio::test]
async fn test_closed_server_fails_calls() {
    let srv = server(Arc::new(EchoHandler::default())).await;
    let cli = client(&[&srv]);
    cli.request(cli.request_options("echo"))
        .send("ep", "", "")
        .await
        .unwrap();

    srv.close();
    let err = cli
        .request(cli.request_options("echo").with_timeout(Duration::from_millis(500)))
        .send("ep", "", "")
        .await
        .unwrap_err();
    assert!(matches!(
        classify(&err),
        Some(ErrorCode::NetworkError | ErrorCode::Timeout | ErrorCode::Declined)
    ));
}

#[tokio::test]
async fn test_client_close_resets_connections() {
    let srv = server(Arc::new(EchoHandler::default())).await;
    let cli = client(&[&srv]);
    cli.request(cli.request_options("echo"))
        .send("ep", "", "")
        .await
        .unwrap();
    assert!(!cli.connections().is_empty());

    cli.close();
    assert!(cli.connections().is_empty());
    assert!(cli.peers().is_empty());
    let metrics = cli.metrics();
    assert_eq!(metrics.connections_opened, metrics.connections_closed);
}
