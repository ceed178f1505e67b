//! Shared handlers and channel fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use muxrpc_transport::{
    Channel, ChannelConfig, ErrorCode, InboundCall, RequestHandler, ResponseBuilder,
    ResponseOptions,
};

static TRACING: Once = Once::new();

/// Routes test logs through `RUST_LOG` when set.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Answers with the caller's arg2 and arg3, counting calls.
#[derive(Default)]
pub struct EchoHandler {
    pub calls: AtomicUsize,
}

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle_request(&self, call: InboundCall, response: ResponseBuilder) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        response
            .build(ResponseOptions {
                streamed: false,
                headers: call.headers.clone(),
            })
            .send_ok(call.args.arg2, call.args.arg3);
    }
}

/// Fails every call with a fixed error code.
pub struct FailingHandler {
    pub code: ErrorCode,
    pub calls: AtomicUsize,
}

impl FailingHandler {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestHandler for FailingHandler {
    async fn handle_request(&self, _call: InboundCall, response: ResponseBuilder) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        response.send_error(self.code, format!("always {}", self.code));
    }
}

/// Replies not-ok with "nope" in arg3.
pub struct NotOkHandler;

#[async_trait]
impl RequestHandler for NotOkHandler {
    async fn handle_request(&self, _call: InboundCall, response: ResponseBuilder) {
        response
            .build(ResponseOptions::default())
            .send_not_ok("", "nope");
    }
}

/// Sleeps before echoing.
pub struct SlowHandler {
    pub delay: Duration,
}

#[async_trait]
impl RequestHandler for SlowHandler {
    async fn handle_request(&self, call: InboundCall, response: ResponseBuilder) {
        tokio::time::sleep(self.delay).await;
        response
            .build(ResponseOptions::default())
            .send_ok(call.args.arg2, call.args.arg3);
    }
}

/// Answers ok with its tag in arg3.
pub struct TaggedHandler {
    pub tag: &'static str,
}

#[async_trait]
impl RequestHandler for TaggedHandler {
    async fn handle_request(&self, _call: InboundCall, response: ResponseBuilder) {
        response
            .build(ResponseOptions::default())
            .send_ok("", self.tag);
    }
}

/// Config with short timeouts for fast tests.
pub fn test_config() -> ChannelConfig {
    let mut config = ChannelConfig::default();
    config.process_name = "muxrpc-test".to_string();
    config.connect_timeout_ms = 1000;
    config.request.timeout_ms = Some(2000);
    config
}

pub async fn server(handler: Arc<dyn RequestHandler>) -> Channel {
    server_with(test_config(), handler).await
}

pub async fn server_with(config: ChannelConfig, handler: Arc<dyn RequestHandler>) -> Channel {
    init_tracing();
    Channel::bind(config, "127.0.0.1:0", handler)
        .await
        .expect("bind test server")
}

/// A client channel that knows `servers`.
pub fn client(servers: &[&Channel]) -> Channel {
    init_tracing();
    let channel = Channel::client(test_config(), Arc::new(muxrpc_transport::handler::NoHandler))
        .expect("client channel");
    for server in servers {
        channel.peers().add(server.host_port());
    }
    channel
}
