//! Inbound call handling.
//!
//! A [`RequestHandler`] receives every complete inbound call together with a
//! [`ResponseBuilder`]. The builder is consumed by building a response and the
//! response is consumed by sending it, so a call is answered at most once. Dropping
//! either without answering sends an `UnexpectedError` back to the caller.

use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::debug;

use crate::connection::{Connection, ConnectionId};
use crate::error::ErrorCode;
use crate::protocol::{CallArgs, CallResponseHead, Headers, OperationId, RetryFlags};

/// A complete inbound call.
#[derive(Debug, Clone)]
pub struct InboundCall {
    /// Operation id on the carrying connection.
    pub id: OperationId,
    /// Connection the call arrived on.
    pub connection: ConnectionId,
    /// Identified name of the caller.
    pub remote_name: String,
    /// Service name.
    pub service: String,
    /// Transport headers.
    pub headers: Headers,
    /// Time the caller allowed when it sent the call.
    pub ttl: Duration,
    /// Retry flags the caller sent.
    pub retry_flags: RetryFlags,
    /// Whether the payload is marked streamed.
    pub streamed: bool,
    /// The three arguments.
    pub args: CallArgs,
    /// When the head frame was received.
    pub received_at: Instant,
}

impl InboundCall {
    /// Endpoint name carried in `arg1`.
    pub fn endpoint(&self) -> &Bytes {
        &self.args.arg1
    }

    /// TTL left at `now`.
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.ttl
            .saturating_sub(now.saturating_duration_since(self.received_at))
    }
}

/// Serves inbound calls.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handles one call; answer it through `response`.
    async fn handle_request(&self, call: InboundCall, response: ResponseBuilder);
}

/// Handler installed until the application sets its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHandler;

#[async_trait]
impl RequestHandler for NoHandler {
    async fn handle_request(&self, call: InboundCall, response: ResponseBuilder) {
        response.send_error(
            ErrorCode::Declined,
            format!("no handler for service {}", call.service),
        );
    }
}

/// Swappable handler shared by every connection of a channel.
pub struct HandlerCell {
    inner: RwLock<Arc<dyn RequestHandler>>,
}

impl HandlerCell {
    /// A cell holding `handler`.
    pub fn new(handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            inner: RwLock::new(handler),
        }
    }

    /// Handler in place now.
    pub fn current(&self) -> Arc<dyn RequestHandler> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replaces the handler for calls dispatched from now on.
    pub fn set(&self, handler: Arc<dyn RequestHandler>) {
        match self.inner.write() {
            Ok(mut guard) => *guard = handler,
            Err(poisoned) => *poisoned.into_inner() = handler,
        }
    }
}

impl Default for HandlerCell {
    fn default() -> Self {
        Self::new(Arc::new(NoHandler))
    }
}

/// Options applied when building a response.
#[derive(Debug, Clone, Default)]
pub struct ResponseOptions {
    /// Whether the payload is marked streamed.
    pub streamed: bool,
    /// Headers sent with the response.
    pub headers: Headers,
}

struct ResponseSlot {
    conn: Weak<Connection>,
    id: OperationId,
    answered: bool,
}

impl ResponseSlot {
    fn respond(&mut self, head: CallResponseHead, args: CallArgs) {
        self.answered = true;
        match self.conn.upgrade() {
            Some(conn) => conn.send_call_response(self.id, head, args),
            None => debug!(id = self.id, "connection gone before response"),
        }
    }

    fn fail(&mut self, code: ErrorCode, message: String) {
        self.answered = true;
        match self.conn.upgrade() {
            Some(conn) => conn.send_error_response(self.id, code, message),
            None => debug!(id = self.id, "connection gone before error response"),
        }
    }
}

impl Drop for ResponseSlot {
    fn drop(&mut self) {
        if !self.answered {
            self.fail(
                ErrorCode::UnexpectedError,
                "handler dropped the call without responding".to_string(),
            );
        }
    }
}

/// Right to answer one inbound call.
pub struct ResponseBuilder {
    slot: ResponseSlot,
}

impl ResponseBuilder {
    pub(crate) fn new(conn: Weak<Connection>, id: OperationId) -> Self {
        Self {
            slot: ResponseSlot {
                conn,
                id,
                answered: false,
            },
        }
    }

    /// Operation being answered.
    pub fn id(&self) -> OperationId {
        self.slot.id
    }

    /// Fixes the response options; the returned response can be sent once.
    pub fn build(self, options: ResponseOptions) -> OutboundResponse {
        OutboundResponse {
            slot: self.slot,
            options,
        }
    }

    /// Answers with an error frame without building a response.
    pub fn send_error(self, code: ErrorCode, message: impl Into<String>) {
        self.build(ResponseOptions::default())
            .send_error(code, message);
    }
}

/// A built response waiting to be sent.
pub struct OutboundResponse {
    slot: ResponseSlot,
    options: ResponseOptions,
}

impl OutboundResponse {
    /// Whether the response is marked streamed.
    pub fn is_streamed(&self) -> bool {
        self.options.streamed
    }

    /// Sends the response with an explicit application status.
    pub fn send(mut self, ok: bool, arg2: impl Into<Bytes>, arg3: impl Into<Bytes>) {
        let head = CallResponseHead {
            ok,
            streamed: self.options.streamed,
            headers: std::mem::take(&mut self.options.headers),
        };
        let args = CallArgs::new(Bytes::new(), arg2, arg3);
        self.slot.respond(head, args);
    }

    /// Answers ok.
    pub fn send_ok(self, arg2: impl Into<Bytes>, arg3: impl Into<Bytes>) {
        self.send(true, arg2, arg3);
    }

    /// Sends an application-level failure; the caller sees a response, not an error.
    pub fn send_not_ok(self, arg2: impl Into<Bytes>, arg3: impl Into<Bytes>) {
        self.send(false, arg2, arg3);
    }

    /// Answers with an error frame instead.
    pub fn send_error(mut self, code: ErrorCode, message: impl Into<String>) {
        self.slot.fail(code, message.into());
    }
}
