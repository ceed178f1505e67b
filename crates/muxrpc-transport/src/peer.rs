//! A remote endpoint and its connections.
//!
//! A [`Peer`] keeps the ids of its connections in a deque: inbound connections are
//! pushed to the front, outbound ones to the back, so the newest outbound connection
//! is found by scanning from the tail. Connections themselves live in the channel's
//! [`ConnectionRegistry`]; ids whose connection is gone or closing are pruned lazily.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tracing::debug;

use crate::config::HealthConfig;
use crate::connection::{
    Connection, ConnectionContext, ConnectionId, Direction, OutboundCall, PendingResponse,
};
use crate::error::{classify, Result, TransportError};
use crate::health::{Connectivity, HealthStatus, PeerHealth};
use crate::lock;
use crate::protocol::{CallResponse, OperationId};
use crate::transport::{validate_host_port, Dialer};

/// Whether a peer is reached over the network or in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// Dialed over TCP.
    Remote,
    /// The channel's own address; served by a loopback connection.
    Local,
}

/// One remote endpoint, identified by `host:port`.
pub struct Peer {
    host_port: String,
    kind: PeerKind,
    ctx: ConnectionContext,
    dialer: Arc<dyn Dialer>,
    connections: Mutex<VecDeque<ConnectionId>>,
    health: Arc<PeerHealth>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("host_port", &self.host_port)
            .field("kind", &self.kind)
            .field("status", &self.health.status())
            .finish()
    }
}

impl Peer {
    pub(crate) fn new(
        ctx: ConnectionContext,
        dialer: Arc<dyn Dialer>,
        host_port: &str,
        kind: PeerKind,
        health: HealthConfig,
    ) -> Self {
        Self {
            host_port: host_port.to_string(),
            kind,
            ctx,
            dialer,
            connections: Mutex::new(VecDeque::new()),
            health: Arc::new(PeerHealth::new(health, Instant::now())),
            closed: AtomicBool::new(false),
        }
    }

    /// Address of the peer.
    pub fn host_port(&self) -> &str {
        &self.host_port
    }

    /// Discriminant of the body.
    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    /// Health machine of the peer.
    pub fn health(&self) -> &PeerHealth {
        &self.health
    }

    /// Current health status.
    pub fn status(&self) -> HealthStatus {
        self.health.status()
    }

    fn live(&self, ids: &mut VecDeque<ConnectionId>) -> Vec<Arc<Connection>> {
        let mut live = Vec::with_capacity(ids.len());
        ids.retain(|&id| match self.ctx.registry.get(id) {
            Some(conn) if !conn.is_closing() => {
                live.push(conn);
                true
            }
            _ => false,
        });
        live
    }

    /// Usable connections, inbound first.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut ids = lock(&self.connections);
        self.live(&mut ids)
    }

    /// First usable connection of either direction.
    pub fn get_in_connection(&self) -> Option<Arc<Connection>> {
        self.connections().into_iter().next()
    }

    /// Newest usable connection, preferring identified ones when asked.
    pub fn get_out_connection(&self, prefer_identified: bool) -> Option<Arc<Connection>> {
        pick_out(&self.connections(), prefer_identified)
    }

    /// Best connection tier available right now.
    pub fn connectivity(&self) -> Connectivity {
        connectivity_of(&self.connections())
    }

    /// Pending outbound operations over all connections.
    pub fn count_out_pending(&self) -> usize {
        self.connections()
            .iter()
            .map(|conn| conn.pending().outbound)
            .sum()
    }

    /// Usable connections, optionally only of one direction.
    pub fn count_connections(&self, direction: Option<Direction>) -> usize {
        self.connections()
            .iter()
            .filter(|conn| direction.map_or(true, |d| conn.direction() == d))
            .count()
    }

    /// Whether a usable connection exists, optionally of one direction and identified.
    pub fn is_connected(&self, direction: Option<Direction>, identified: bool) -> bool {
        self.connections().iter().any(|conn| {
            direction.map_or(true, |d| conn.direction() == d)
                && (!identified || conn.is_identified())
        })
    }

    /// Adds a connection: inbound ones to the front, outbound ones to the back.
    pub fn add_connection(&self, conn: &Arc<Connection>) {
        let mut ids = lock(&self.connections);
        if ids.contains(&conn.id()) {
            return;
        }
        match conn.direction() {
            Direction::In => ids.push_front(conn.id()),
            Direction::Out => ids.push_back(conn.id()),
        }
    }

    /// Forgets connection `id`. Returns whether it was known.
    pub fn remove_connection(&self, id: ConnectionId) -> bool {
        let mut ids = lock(&self.connections);
        let before = ids.len();
        ids.retain(|&other| other != id);
        ids.len() != before
    }

    /// Returns a connection for new work, opening an outbound one if none is usable.
    pub fn connect(&self) -> Result<Arc<Connection>> {
        self.connect_with(false)
    }

    /// Like [`Peer::connect`] but only accepts outbound connections.
    pub fn connect_outbound(&self) -> Result<Arc<Connection>> {
        self.connect_with(true)
    }

    fn connect_with(&self, out_only: bool) -> Result<Arc<Connection>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        let conn = {
            let mut ids = lock(&self.connections);
            let live = self.live(&mut ids);
            if let Some(conn) = pick_out(&live, true) {
                if !out_only || conn.direction() == Direction::Out {
                    return Ok(conn);
                }
            }
            if out_only {
                if let Some(conn) = live.iter().rev().find(|c| c.direction() == Direction::Out) {
                    return Ok(Arc::clone(conn));
                }
            }
            let conn = match self.kind {
                PeerKind::Local => Connection::loopback(&self.ctx),
                PeerKind::Remote => {
                    validate_host_port(&self.host_port)?;
                    if self.host_port == self.ctx.host_port {
                        return Err(TransportError::InvalidPeerAddress {
                            addr: self.host_port.clone(),
                            reason: "refusing to dial our own address",
                        });
                    }
                    Connection::outbound(&self.ctx, &self.host_port)
                }
            };
            ids.push_back(conn.id());
            conn
        };
        if self.kind == PeerKind::Remote {
            self.spawn_dial(Arc::clone(&conn));
        }
        Ok(conn)
    }

    fn spawn_dial(&self, conn: Arc<Connection>) {
        let dialer = Arc::clone(&self.dialer);
        let host_port = self.host_port.clone();
        tokio::spawn(async move {
            match dialer.dial(&host_port).await {
                Ok(socket) => conn.attach(socket),
                Err(err) => {
                    debug!(peer = %host_port, error = %err, "dial failed");
                    conn.reset_all(err);
                }
            }
        });
    }

    /// Waits until a connection to this peer is identified, connecting if needed.
    pub async fn wait_for_identified(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.wait_identified().await.map(|_| ())
    }

    /// Scores the peer for selection, opening a connection in the background when the
    /// health machine asks for one.
    pub fn score(&self, now: Instant) -> f64 {
        let live = self.connections();
        let connectivity = connectivity_of(&live);
        let pending = live.iter().map(|conn| conn.pending().outbound).sum();
        let verdict = self
            .health
            .should_request(now, connectivity, pending, rand::random::<f64>());
        if verdict.wants_connection {
            if let Err(err) = self.connect_outbound() {
                debug!(peer = %self.host_port, error = %err, "background connect failed");
            }
        }
        verdict.score
    }

    /// Sends one attempt over a connection to this peer.
    ///
    /// A failure to even send the attempt is recorded against the peer's health.
    pub fn request(&self, call: OutboundCall) -> Result<PeerCall> {
        self.health.on_request();
        let pending = self
            .connect()
            .and_then(|conn| conn.request(call))
            .map_err(|err| {
                self.health.on_error(classify(&err));
                err
            })?;
        Ok(PeerCall {
            pending,
            health: Arc::clone(&self.health),
        })
    }

    /// Closes every connection with a local close and refuses new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let conns = {
            let mut ids = lock(&self.connections);
            let live = self.live(&mut ids);
            ids.clear();
            live
        };
        for conn in conns {
            conn.reset_all(TransportError::local_close());
        }
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn pick_out(conns: &[Arc<Connection>], prefer_identified: bool) -> Option<Arc<Connection>> {
    let mut candidate = None;
    for conn in conns.iter().rev() {
        if !prefer_identified || conn.is_identified() {
            return Some(Arc::clone(conn));
        }
        if candidate.is_none() {
            candidate = Some(conn);
        }
    }
    candidate.map(Arc::clone)
}

fn connectivity_of(conns: &[Arc<Connection>]) -> Connectivity {
    match pick_out(conns, false) {
        None => Connectivity::Unconnected,
        Some(conn) if conn.direction() != Direction::Out => Connectivity::InboundOnly,
        Some(conn) if !conn.is_identified() => Connectivity::FreshOutbound,
        Some(_) => Connectivity::IdentifiedOutbound,
    }
}

/// An attempt in flight to a peer; its outcome feeds the peer's health.
#[derive(Debug)]
pub struct PeerCall {
    pending: PendingResponse,
    health: Arc<PeerHealth>,
}

impl PeerCall {
    /// Operation id on the carrying connection.
    pub fn id(&self) -> OperationId {
        self.pending.id()
    }

    /// Peer that carries the attempt.
    pub fn remote_addr(&self) -> &str {
        self.pending.remote_addr()
    }

    /// Waits for the outcome; the connection's sweeper enforces the TTL.
    pub async fn wait(self) -> Result<CallResponse> {
        let result = self.pending.wait().await;
        record(&self.health, &result);
        result
    }

    /// Waits until `deadline`, abandoning the attempt if it passes first.
    pub async fn wait_until(self, deadline: Instant) -> Result<CallResponse> {
        let result = self.pending.wait_until(deadline).await;
        record(&self.health, &result);
        result
    }
}

fn record(health: &PeerHealth, result: &Result<CallResponse>) {
    match result {
        Ok(_) => health.on_response(Instant::now()),
        Err(err) => health.on_error(classify(err)),
    }
}
