//! Multiplexed connections.
//!
//! A [`Connection`] carries many concurrent operations over one socket. It owns the
//! operation table, a timeout sweeper task and the reader/writer tasks of its socket.
//! Frames to send go through an unbounded queue drained by the writer task, so the
//! queue can be filled before the socket exists (outbound dials) and the loopback
//! connection of the self peer can pump the same queue back into itself.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::ConnectionConfig;
use crate::error::{ErrorCode, ResetOrigin, Result, TransportError};
use crate::handler::{HandlerCell, InboundCall, ResponseBuilder};
use crate::lock;
use crate::metrics::ChannelMetrics;
use crate::operations::{OperationTable, OutboundOp, Pending};
use crate::protocol::{
    CallArgs, CallRequestHead, CallResponse, CallResponseHead, Frame, FrameBody, Headers,
    OperationId, Reassembly, RetryFlags, EPHEMERAL_HOST_PORT,
};
use crate::transport::BoxSocket;

/// Process-unique connection id.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    /// Accepted from a listener.
    In,
    /// Dialed by this channel.
    Out,
}

/// Identification progress of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Init handshake not finished.
    Pending,
    /// Remote end identified under this host:port.
    Identified(String),
    /// Connection reset before or after identification.
    Closed(String),
}

pub(crate) enum WriteCommand {
    Frame(Frame),
    Shutdown,
}

/// What the sweeper should do after a tick.
#[derive(Debug)]
pub(crate) enum SweepVerdict {
    Continue,
    Stop,
    Dead(TransportError),
}

/// Everything a connection needs from its channel.
#[derive(Clone)]
pub struct ConnectionContext {
    /// Address this channel announces.
    pub host_port: String,
    /// Name announced in the handshake.
    pub process_name: String,
    /// Connection settings.
    pub config: ConnectionConfig,
    /// Serves inbound calls.
    pub handler: Arc<HandlerCell>,
    /// Live connections of the channel.
    pub registry: Arc<ConnectionRegistry>,
    /// Channel counters.
    pub metrics: Arc<ChannelMetrics>,
}

/// An outbound call as handed to a connection.
#[derive(Debug, Clone)]
pub struct OutboundCall {
    /// Target service.
    pub service: String,
    /// Transport headers.
    pub headers: Headers,
    /// Time the attempt may take.
    pub ttl: Duration,
    /// Retry flags.
    pub retry_flags: RetryFlags,
    /// Whether the payload is marked streamed.
    pub streamed: bool,
    /// The three arguments.
    pub args: CallArgs,
}

impl OutboundCall {
    /// An unstreamed call with default retry flags and no headers.
    pub fn new(service: impl Into<String>, ttl: Duration, args: CallArgs) -> Self {
        Self {
            service: service.into(),
            headers: Headers::new(),
            ttl,
            retry_flags: RetryFlags::default(),
            streamed: false,
            args,
        }
    }
}

/// Delay until the next sweep: `base` shifted by a uniform offset in `[-fuzz/2, fuzz/2)`.
pub(crate) fn timeout_check_delay<R: Rng>(base: Duration, fuzz: Duration, rng: &mut R) -> Duration {
    let fuzz_ms = fuzz.as_millis() as i64;
    let base_ms = base.as_millis() as i64;
    if fuzz_ms == 0 {
        return base;
    }
    let offset = rng.gen_range(0..fuzz_ms) - fuzz_ms / 2;
    Duration::from_millis((base_ms + offset).max(1) as u64)
}

/// A multiplexed connection to one remote endpoint.
pub struct Connection {
    id: ConnectionId,
    direction: Direction,
    remote_addr: String,
    local_host_port: String,
    process_name: String,
    config: ConnectionConfig,
    handler: Arc<HandlerCell>,
    registry: Weak<ConnectionRegistry>,
    metrics: Arc<ChannelMetrics>,
    started_at: Instant,
    ops: Mutex<OperationTable>,
    requests: Mutex<Reassembly<CallRequestHead>>,
    responses: Mutex<Reassembly<CallResponseHead>>,
    next_op_id: AtomicU32,
    closing: AtomicBool,
    identity: watch::Sender<Identity>,
    writes: mpsc::UnboundedSender<WriteCommand>,
    write_queue: Mutex<Option<mpsc::UnboundedReceiver<WriteCommand>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("remote_addr", &self.remote_addr)
            .field("closing", &self.is_closing())
            .finish()
    }
}

impl Connection {
    fn create(ctx: &ConnectionContext, direction: Direction, remote_addr: String) -> Arc<Self> {
        let (writes, write_queue) = mpsc::unbounded_channel();
        let (identity, _) = watch::channel(Identity::Pending);
        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            direction,
            remote_addr,
            local_host_port: ctx.host_port.clone(),
            process_name: ctx.process_name.clone(),
            config: ctx.config.clone(),
            handler: Arc::clone(&ctx.handler),
            registry: Arc::downgrade(&ctx.registry),
            metrics: Arc::clone(&ctx.metrics),
            started_at: Instant::now(),
            ops: Mutex::new(OperationTable::new()),
            requests: Mutex::new(Reassembly::new()),
            responses: Mutex::new(Reassembly::new()),
            next_op_id: AtomicU32::new(1),
            closing: AtomicBool::new(false),
            identity,
            writes,
            write_queue: Mutex::new(Some(write_queue)),
            sweeper: Mutex::new(None),
            reader: Mutex::new(None),
        });
        ctx.registry.insert(Arc::clone(&conn));
        ctx.metrics.inc_connections_opened();
        conn.start_sweeper();
        debug!(conn = conn.id, direction = ?direction, remote = %conn.remote_addr, "connection created");
        conn
    }

    /// Creates an outbound connection to `host_port` and queues its init request.
    ///
    /// The socket is attached later with [`Connection::attach`].
    pub fn outbound(ctx: &ConnectionContext, host_port: &str) -> Arc<Self> {
        let conn = Self::create(ctx, Direction::Out, host_port.to_string());
        conn.send_frame(Frame::new(
            0,
            FrameBody::InitRequest {
                host_port: ctx.host_port.clone(),
                process_name: ctx.process_name.clone(),
            },
        ));
        conn
    }

    /// Creates an inbound connection for an accepted socket from `socket_addr`.
    pub fn inbound(ctx: &ConnectionContext, socket_addr: &str) -> Arc<Self> {
        Self::create(ctx, Direction::In, socket_addr.to_string())
    }

    /// Creates the in-process connection of the self peer: every frame it writes is
    /// handled by itself.
    pub fn loopback(ctx: &ConnectionContext) -> Arc<Self> {
        let conn = Self::create(ctx, Direction::Out, ctx.host_port.clone());
        conn.identity
            .send_replace(Identity::Identified(ctx.host_port.clone()));
        conn.attach_loopback();
        conn
    }

    /// Process-unique id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Which side opened it.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Socket-level address of the remote end.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Identified host:port of the remote end, once the handshake finished.
    pub fn remote_name(&self) -> Option<String> {
        match &*self.identity.borrow() {
            Identity::Identified(name) => Some(name.clone()),
            _ => None,
        }
    }

    /// Handshake state.
    pub fn identity(&self) -> Identity {
        self.identity.borrow().clone()
    }

    /// Whether the handshake finished.
    pub fn is_identified(&self) -> bool {
        matches!(&*self.identity.borrow(), Identity::Identified(_))
    }

    /// Whether the connection refuses new work.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// In-flight operation counts.
    pub fn pending(&self) -> Pending {
        lock(&self.ops).pending()
    }

    /// Creation time.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Waits until the init handshake finished, returning the remote name.
    pub async fn wait_identified(&self) -> Result<String> {
        let mut rx = self.identity.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                Identity::Identified(name) => return Ok(name),
                Identity::Closed(cause) => {
                    return Err(TransportError::ConnectionReset {
                        addr: self.remote_addr.clone(),
                        origin: ResetOrigin::Remote,
                        cause,
                    })
                }
                Identity::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(TransportError::ConnectionClosing {
                    addr: self.remote_addr.clone(),
                });
            }
        }
    }

    /// Registers an outbound operation and queues its frames.
    ///
    /// A call whose frames would exceed the frame size cap fails with
    /// [`TransportError::RequestTooLarge`] before it is registered; the connection
    /// and its other operations are unaffected.
    pub fn request(self: &Arc<Self>, call: OutboundCall) -> Result<PendingResponse> {
        let head = CallRequestHead {
            ttl_ms: call.ttl.as_millis() as u64,
            service: call.service,
            headers: call.headers,
            retry_flags: call.retry_flags,
            streamed: call.streamed,
        };
        let frames = Frame::call_request(0, head, call.args);
        codec::check_fits(&frames)?;

        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let id = {
            let mut ops = lock(&self.ops);
            if self.is_closing() {
                return Err(TransportError::ConnectionClosing {
                    addr: self.remote_addr.clone(),
                });
            }
            let id = self.allocate_op_id(&ops);
            ops.insert_outbound(id, OutboundOp::new(now, call.ttl, tx));
            id
        };

        for mut frame in frames {
            frame.id = id;
            self.send_frame(frame);
        }
        Ok(PendingResponse {
            id,
            ttl: call.ttl,
            started: now,
            remote_addr: self.remote_name().unwrap_or_else(|| self.remote_addr.clone()),
            conn: Arc::downgrade(self),
            rx,
        })
    }

    fn allocate_op_id(&self, ops: &OperationTable) -> OperationId {
        loop {
            let id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !ops.contains_outbound(id) {
                return id;
            }
        }
    }

    /// Removes an outbound op whose caller stopped waiting, counting it as a timeout.
    pub(crate) fn abandon(&self, id: OperationId) -> bool {
        let removed = lock(&self.ops).expire_outbound(id, Instant::now()).is_some();
        if removed {
            lock(&self.responses).discard(id);
            self.metrics.inc_timeouts();
        }
        removed
    }

    pub(crate) fn send_frame(&self, frame: Frame) -> bool {
        self.writes.send(WriteCommand::Frame(frame)).is_ok()
    }

    /// Answers inbound op `id` with a call response.
    pub(crate) fn send_call_response(&self, id: OperationId, head: CallResponseHead, args: CallArgs) {
        let frames = Frame::call_response(id, head, args);
        if let Err(err) = codec::check_fits(&frames) {
            warn!(conn = self.id, id, error = %err, "response does not fit in a frame");
            self.send_error_response(id, ErrorCode::UnexpectedError, err.to_string());
            return;
        }
        if !self.finish_inbound(id) {
            return;
        }
        for frame in frames {
            self.send_frame(frame);
        }
        self.metrics.inc_responses_sent();
    }

    /// Answers inbound op `id` with an error frame.
    pub(crate) fn send_error_response(&self, id: OperationId, code: ErrorCode, message: String) {
        if !self.finish_inbound(id) {
            return;
        }
        self.send_frame(Frame::error(id, code, message));
        self.metrics.inc_responses_sent();
    }

    fn finish_inbound(&self, id: OperationId) -> bool {
        if self.is_closing() {
            debug!(conn = self.id, id, "dropping response on closed connection");
            return false;
        }
        if lock(&self.ops).pop_inbound(id).is_none() {
            debug!(conn = self.id, id, "response for inbound operation that already expired");
            return false;
        }
        true
    }

    /// Handles one frame read from the socket.
    pub(crate) fn handle_frame(self: &Arc<Self>, frame: Frame) {
        if self.is_closing() {
            return;
        }
        lock(&self.ops).note_frame_received();
        if let Err(err) = self.dispatch(frame) {
            warn!(conn = self.id, remote = %self.remote_addr, error = %err, "protocol violation");
            self.reset_all(err);
        }
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) -> Result<()> {
        let Frame { id, body } = frame;
        match body {
            FrameBody::InitRequest { host_port, process_name } => {
                self.on_init_request(host_port, process_name)
            }
            FrameBody::InitResponse { host_port, process_name } => {
                if self.direction != Direction::Out {
                    return Err(TransportError::Protocol {
                        reason: "init response on inbound connection".to_string(),
                    });
                }
                debug!(conn = self.id, remote = %host_port, process = %process_name, "identified");
                self.identity.send_replace(Identity::Identified(host_port));
                Ok(())
            }
            FrameBody::CallRequest { head, args, more } => {
                self.require_identified()?;
                let done = lock(&self.requests).start(id, head, args, more)?;
                if let Some((head, args)) = done {
                    self.on_call_request(id, head, args);
                }
                Ok(())
            }
            FrameBody::CallRequestCont { args, more } => {
                let done = lock(&self.requests).resume(id, args, more)?;
                if let Some((head, args)) = done {
                    self.on_call_request(id, head, args);
                }
                Ok(())
            }
            FrameBody::CallResponse { head, args, more } => {
                let done = lock(&self.responses).start(id, head, args, more)?;
                if let Some((head, args)) = done {
                    self.on_call_response(id, head, args);
                }
                Ok(())
            }
            FrameBody::CallResponseCont { args, more } => {
                let done = lock(&self.responses).resume(id, args, more)?;
                if let Some((head, args)) = done {
                    self.on_call_response(id, head, args);
                }
                Ok(())
            }
            FrameBody::Error { code, message } => {
                lock(&self.responses).discard(id);
                self.on_call_error(id, code, message);
                Ok(())
            }
            FrameBody::PingRequest => {
                self.send_frame(Frame::new(id, FrameBody::PingResponse));
                Ok(())
            }
            FrameBody::PingResponse => {
                debug!(conn = self.id, id, "ping response");
                Ok(())
            }
        }
    }

    fn require_identified(&self) -> Result<()> {
        if self.is_identified() {
            Ok(())
        } else {
            Err(TransportError::Protocol {
                reason: "call request before init handshake".to_string(),
            })
        }
    }

    fn on_init_request(&self, host_port: String, process_name: String) -> Result<()> {
        if self.direction != Direction::In {
            return Err(TransportError::Protocol {
                reason: "init request on outbound connection".to_string(),
            });
        }
        if self.is_identified() {
            return Err(TransportError::Protocol {
                reason: "duplicate init request".to_string(),
            });
        }
        let name = if host_port == EPHEMERAL_HOST_PORT {
            self.remote_addr.clone()
        } else {
            host_port
        };
        self.send_frame(Frame::new(
            0,
            FrameBody::InitResponse {
                host_port: self.local_host_port.clone(),
                process_name: self.process_name.clone(),
            },
        ));
        debug!(conn = self.id, remote = %name, process = %process_name, "identified");
        self.identity.send_replace(Identity::Identified(name));
        Ok(())
    }

    fn on_call_request(self: &Arc<Self>, id: OperationId, head: CallRequestHead, args: CallArgs) {
        let now = Instant::now();
        {
            let mut ops = lock(&self.ops);
            if self.is_closing() {
                return;
            }
            if !ops.insert_inbound(id, now) {
                drop(ops);
                warn!(conn = self.id, id, "duplicate inbound operation id");
                self.send_frame(Frame::error(
                    id,
                    ErrorCode::UnexpectedError,
                    "duplicate operation id",
                ));
                return;
            }
        }
        self.metrics.inc_requests_received();

        let call = InboundCall {
            id,
            connection: self.id,
            remote_name: self.remote_name().unwrap_or_else(|| self.remote_addr.clone()),
            service: head.service,
            headers: head.headers,
            ttl: Duration::from_millis(head.ttl_ms),
            retry_flags: head.retry_flags,
            streamed: head.streamed,
            args,
            received_at: now,
        };
        let response = ResponseBuilder::new(Arc::downgrade(self), id);
        let handler = self.handler.current();
        tokio::spawn(async move {
            handler.handle_request(call, response).await;
        });
    }

    fn on_call_response(&self, id: OperationId, head: CallResponseHead, args: CallArgs) {
        let Some(mut op) = lock(&self.ops).pop_outbound(id) else {
            info!(conn = self.id, id, "response received for unknown or lost operation");
            return;
        };
        let response = CallResponse {
            id,
            ok: head.ok,
            streamed: head.streamed,
            headers: head.headers,
            args,
            remote_addr: self.remote_name().unwrap_or_else(|| self.remote_addr.clone()),
        };
        if let Some(completion) = op.take_completion() {
            let _ = completion.send(Ok(response));
        }
    }

    fn on_call_error(&self, id: OperationId, code: ErrorCode, message: String) {
        let Some(mut op) = lock(&self.ops).pop_outbound(id) else {
            info!(conn = self.id, id, code = %code, "error received for unknown or lost operation");
            return;
        };
        let err = TransportError::ErrorFrame {
            code,
            id,
            remote: self.remote_name().unwrap_or_else(|| self.remote_addr.clone()),
            message,
        };
        if let Some(completion) = op.take_completion() {
            let _ = completion.send(Err(err));
        }
    }

    fn start_sweeper(self: &Arc<Self>) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(conn = self.id, "no runtime; timeout sweeper not started");
            return;
        }
        let weak = Arc::downgrade(self);
        let base = self.config.timeout_check_interval();
        let fuzz = self.config.timeout_fuzz();
        let handle = tokio::spawn(async move {
            loop {
                let delay = timeout_check_delay(base, fuzz, &mut rand::thread_rng());
                tokio::time::sleep(delay).await;
                let Some(conn) = weak.upgrade() else {
                    break;
                };
                match conn.on_timeout_check(Instant::now()) {
                    SweepVerdict::Continue => {}
                    SweepVerdict::Stop => break,
                    SweepVerdict::Dead(err) => {
                        warn!(conn = conn.id, remote = %conn.remote_addr, error = %err, "connection timed out");
                        conn.reset_all(err);
                        break;
                    }
                }
            }
        });
        *lock(&self.sweeper) = Some(handle);
    }

    /// One sweeper tick.
    pub(crate) fn on_timeout_check(&self, now: Instant) -> SweepVerdict {
        if self.is_closing() {
            return SweepVerdict::Stop;
        }
        let report = {
            let mut ops = lock(&self.ops);
            if ops.last_timeout_at().is_some() {
                return SweepVerdict::Dead(TransportError::ConnectionTimeout {
                    addr: self.remote_addr.clone(),
                    reason: "no frame received since the last operation timeout".to_string(),
                });
            }
            if !self.is_identified()
                && now.saturating_duration_since(self.started_at) >= self.config.init_timeout()
            {
                return SweepVerdict::Dead(TransportError::ConnectionTimeout {
                    addr: self.remote_addr.clone(),
                    reason: format!(
                        "not identified within {}ms",
                        self.config.init_timeout_ms
                    ),
                });
            }
            ops.sweep(now, self.config.server_timeout_default())
        };

        for id in report.purged {
            warn!(conn = self.id, id, "purged lingering timed-out operation");
        }
        if report.dropped_inbound > 0 {
            debug!(conn = self.id, dropped = report.dropped_inbound, "dropped expired inbound operations");
        }
        for expired in report.expired {
            lock(&self.responses).discard(expired.id);
            self.metrics.inc_timeouts();
            let _ = expired.completion.send(Err(TransportError::RequestTimeout {
                id: expired.id,
                elapsed_ms: expired.elapsed.as_millis() as u64,
                timeout_ms: expired.ttl.as_millis() as u64,
            }));
        }
        SweepVerdict::Continue
    }

    /// Tears the connection down, failing every outstanding outbound operation.
    ///
    /// Returns false if the connection was already closing.
    pub fn reset_all(&self, err: TransportError) -> bool {
        if let Some(sweeper) = lock(&self.sweeper).take() {
            sweeper.abort();
        }
        if self.closing.swap(true, Ordering::SeqCst) {
            return false;
        }

        let origin = err.reset_origin();
        let cause = err.to_string();
        let (outbound, inbound) = lock(&self.ops).drain();
        lock(&self.requests).clear();
        lock(&self.responses).clear();

        match (&err, origin) {
            (_, ResetOrigin::Local) => {
                debug!(conn = self.id, remote = %self.remote_addr, out = outbound.len(), inbound, "connection closed")
            }
            (TransportError::SocketClosed { .. }, ResetOrigin::Remote) => {
                info!(conn = self.id, remote = %self.remote_addr, out = outbound.len(), inbound, "remote closed connection")
            }
            _ => {
                warn!(conn = self.id, remote = %self.remote_addr, out = outbound.len(), inbound, error = %err, "resetting connection")
            }
        }

        self.identity.send_replace(Identity::Closed(cause.clone()));
        for mut op in outbound {
            if let Some(completion) = op.take_completion() {
                let _ = completion.send(Err(TransportError::ConnectionReset {
                    addr: self.remote_addr.clone(),
                    origin,
                    cause: cause.clone(),
                }));
            }
        }

        let _ = self.writes.send(WriteCommand::Shutdown);
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        self.metrics
            .connection_closed(origin == ResetOrigin::Remote);
        true
    }

    /// Starts the reader and writer tasks on `socket`.
    pub(crate) fn attach(self: &Arc<Self>, socket: BoxSocket) {
        if self.is_closing() {
            debug!(conn = self.id, "socket arrived after close");
            return;
        }
        let Some(mut queue) = lock(&self.write_queue).take() else {
            warn!(conn = self.id, "connection already has a socket");
            return;
        };
        let (mut read_half, write_half) = tokio::io::split(socket);

        let weak = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            loop {
                let result = codec::read_frame(&mut read_half).await;
                let Some(conn) = weak.upgrade() else {
                    break;
                };
                match result {
                    Ok(frame) => conn.handle_frame(frame),
                    Err(err) => {
                        conn.reset_all(read_failure(err));
                        break;
                    }
                }
            }
        });
        *lock(&self.reader) = Some(reader);

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut writer = BufWriter::new(write_half);
            while let Some(command) = queue.recv().await {
                let frame = match command {
                    WriteCommand::Frame(frame) => frame,
                    WriteCommand::Shutdown => break,
                };
                if let Err(err) = codec::write_frame(&mut writer, &frame).await {
                    if let Some(conn) = weak.upgrade() {
                        conn.reset_all(TransportError::Protocol {
                            reason: format!("write failed: {}", err),
                        });
                    }
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });
    }

    fn attach_loopback(self: &Arc<Self>) {
        let Some(mut queue) = lock(&self.write_queue).take() else {
            return;
        };
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(WriteCommand::Frame(frame)) = queue.recv().await {
                let Some(conn) = weak.upgrade() else {
                    break;
                };
                conn.handle_frame(frame);
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn take_write_queue(&self) -> Option<mpsc::UnboundedReceiver<WriteCommand>> {
        lock(&self.write_queue).take()
    }
}

fn read_failure(err: TransportError) -> TransportError {
    match err {
        TransportError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            TransportError::SocketClosed {
                origin: ResetOrigin::Remote,
                reason: "remote closed the socket".to_string(),
            }
        }
        TransportError::Codec(reason) => TransportError::Protocol {
            reason: format!("read failed: {}", reason),
        },
        other => other,
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }
}

/// Handle on an outbound operation's eventual result.
#[derive(Debug)]
pub struct PendingResponse {
    id: OperationId,
    ttl: Duration,
    started: Instant,
    remote_addr: String,
    conn: Weak<Connection>,
    rx: oneshot::Receiver<Result<CallResponse>>,
}

impl PendingResponse {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Waits for the response; the connection's sweeper enforces the TTL.
    pub async fn wait(self) -> Result<CallResponse> {
        let addr = self.remote_addr;
        self.rx.await.unwrap_or_else(|_| {
            Err(TransportError::ConnectionReset {
                addr,
                origin: ResetOrigin::Remote,
                cause: "operation dropped".to_string(),
            })
        })
    }

    /// Waits until `deadline`, abandoning the operation if it passes first.
    pub async fn wait_until(self, deadline: Instant) -> Result<CallResponse> {
        let PendingResponse {
            id,
            ttl,
            started,
            remote_addr,
            conn,
            mut rx,
        } = self;
        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::ConnectionReset {
                addr: remote_addr,
                origin: ResetOrigin::Remote,
                cause: "operation dropped".to_string(),
            }),
            Err(_) => {
                if let Some(conn) = conn.upgrade() {
                    conn.abandon(id);
                }
                Err(TransportError::RequestTimeout {
                    id,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    timeout_ms: ttl.as_millis() as u64,
                })
            }
        }
    }
}

/// Every live connection of a channel, by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.connections.insert(conn.id(), conn);
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, conn)| conn)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Resets every registered connection with a local close.
    pub fn close_all(&self) {
        for conn in self.snapshot() {
            conn.reset_all(TransportError::local_close());
        }
    }
}
