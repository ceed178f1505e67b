//! Peer registry and peer selection.
//!
//! The pool owns every [`Peer`] of a channel keyed by `host:port`, in insertion
//! order. The channel's own address maps to a single self peer served in-process,
//! kept outside the map.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, RwLock};

use tokio::time::Instant;
use tracing::debug;

use crate::config::{ConnectionConfig, HealthConfig};
use crate::connection::ConnectionContext;
use crate::metrics::ChannelMetrics;
use crate::peer::{Peer, PeerKind};
use crate::protocol::EPHEMERAL_HOST_PORT;
use crate::transport::Dialer;

/// Per-call selection options.
#[derive(Debug, Clone, Default)]
pub struct ChooseOptions {
    /// Bypass scoring and use this peer.
    pub host: Option<String>,
    /// Overrides the pool's score threshold.
    pub peer_score_threshold: Option<f64>,
    /// Peers never chosen, whatever their score.
    pub excluded: HashSet<String>,
    /// When set, only these peers are candidates.
    pub allowed: Option<HashSet<String>>,
}

impl ChooseOptions {
    fn admits(&self, host_port: &str) -> bool {
        !self.excluded.contains(host_port)
            && self
                .allowed
                .as_ref()
                .map_or(true, |allowed| allowed.contains(host_port))
    }
}

#[derive(Default)]
struct PeerTable {
    order: Vec<String>,
    peers: HashMap<String, Arc<Peer>>,
}

/// All peers of a channel.
pub struct PeerPool {
    ctx: ConnectionContext,
    dialer: Arc<dyn Dialer>,
    health: HealthConfig,
    peer_score_threshold: f64,
    table: RwLock<PeerTable>,
    self_peer: OnceLock<Arc<Peer>>,
}

impl std::fmt::Debug for PeerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerPool")
            .field("host_port", &self.ctx.host_port)
            .field("peers", &self.keys())
            .finish()
    }
}

impl PeerPool {
    /// An empty pool whose peers share `ctx` and dial through `dialer`.
    pub fn new(
        ctx: ConnectionContext,
        dialer: Arc<dyn Dialer>,
        health: HealthConfig,
        peer_score_threshold: f64,
    ) -> Self {
        Self {
            ctx,
            dialer,
            health,
            peer_score_threshold,
            table: RwLock::new(PeerTable::default()),
            self_peer: OnceLock::new(),
        }
    }

    /// Address of the owning channel.
    pub fn host_port(&self) -> &str {
        &self.ctx.host_port
    }

    pub(crate) fn metrics(&self) -> &Arc<ChannelMetrics> {
        &self.ctx.metrics
    }

    pub(crate) fn connection_config(&self) -> &ConnectionConfig {
        &self.ctx.config
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PeerTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PeerTable> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }

    fn is_self(&self, host_port: &str) -> bool {
        host_port == self.ctx.host_port && host_port != EPHEMERAL_HOST_PORT
    }

    /// The self peer, creating it on first use.
    pub fn self_peer(&self) -> Arc<Peer> {
        Arc::clone(self.self_peer.get_or_init(|| {
            Arc::new(Peer::new(
                self.ctx.clone(),
                Arc::clone(&self.dialer),
                &self.ctx.host_port,
                PeerKind::Local,
                self.health.clone(),
            ))
        }))
    }

    /// The peer for `host_port`, if known.
    pub fn get(&self, host_port: &str) -> Option<Arc<Peer>> {
        if self.is_self(host_port) {
            return self.self_peer.get().cloned();
        }
        self.read().peers.get(host_port).cloned()
    }

    /// Returns the peer for `host_port`, creating it if needed.
    pub fn add(&self, host_port: &str) -> Arc<Peer> {
        if self.is_self(host_port) {
            return self.self_peer();
        }
        if let Some(peer) = self.read().peers.get(host_port) {
            return Arc::clone(peer);
        }
        let mut table = self.write();
        if let Some(peer) = table.peers.get(host_port) {
            return Arc::clone(peer);
        }
        let peer = Arc::new(Peer::new(
            self.ctx.clone(),
            Arc::clone(&self.dialer),
            host_port,
            PeerKind::Remote,
            self.health.clone(),
        ));
        table.order.push(host_port.to_string());
        table.peers.insert(host_port.to_string(), Arc::clone(&peer));
        debug!(peer = %host_port, "peer added");
        peer
    }

    /// Removes a peer and closes its connections.
    pub fn delete(&self, host_port: &str) -> Option<Arc<Peer>> {
        let peer = {
            let mut table = self.write();
            let peer = table.peers.remove(host_port)?;
            table.order.retain(|key| key != host_port);
            peer
        };
        peer.close();
        debug!(peer = %host_port, "peer deleted");
        Some(peer)
    }

    /// Peer addresses in insertion order, without the self peer.
    pub fn keys(&self) -> Vec<String> {
        self.read().order.clone()
    }

    /// Peers in insertion order, without the self peer.
    pub fn values(&self) -> Vec<Arc<Peer>> {
        let table = self.read();
        table
            .order
            .iter()
            .filter_map(|key| table.peers.get(key).cloned())
            .collect()
    }

    /// Number of peers, without the self peer.
    pub fn len(&self) -> usize {
        self.read().peers.len()
    }

    /// Whether the pool has no peers besides the self peer.
    pub fn is_empty(&self) -> bool {
        self.read().peers.is_empty()
    }

    /// Picks the best scoring peer whose address is neither in `excluded` nor
    /// rejected by `options`.
    ///
    /// Only scores strictly above the threshold qualify; on equal scores the first
    /// candidate seen wins.
    pub fn choose_peer(
        &self,
        excluded: &HashMap<String, u32>,
        options: &ChooseOptions,
    ) -> Option<Arc<Peer>> {
        if let Some(host) = &options.host {
            return Some(self.add(host));
        }
        let threshold = options
            .peer_score_threshold
            .unwrap_or(self.peer_score_threshold);
        let mut candidates = self.values();
        if let Some(local) = self.self_peer.get() {
            candidates.push(Arc::clone(local));
        }

        let now = Instant::now();
        let mut selected: Option<(Arc<Peer>, f64)> = None;
        for peer in candidates {
            if peer.is_closed()
                || excluded.contains_key(peer.host_port())
                || !options.admits(peer.host_port())
            {
                continue;
            }
            let score = peer.score(now);
            let better = selected.as_ref().map_or(true, |(_, best)| score > *best);
            if score > threshold && better {
                selected = Some((peer, score));
            }
        }
        selected.map(|(peer, _)| peer)
    }

    /// Closes and forgets every peer, including the self peer.
    pub fn close(&self) {
        let peers = {
            let mut table = self.write();
            table.order.clear();
            std::mem::take(&mut table.peers)
        };
        for peer in peers.into_values() {
            peer.close();
        }
        if let Some(local) = self.self_peer.get() {
            local.close();
        }
    }
}
