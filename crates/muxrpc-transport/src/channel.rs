//! The channel: a listener, its peer pool and the handler serving inbound calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::connection::{Connection, ConnectionContext, ConnectionRegistry};
use crate::error::{Result, TransportError};
use crate::handler::{HandlerCell, RequestHandler};
use crate::lock;
use crate::metrics::{ChannelMetrics, MetricsSnapshot};
use crate::pool::PeerPool;
use crate::protocol::EPHEMERAL_HOST_PORT;
use crate::ratelimit::{RateLimitedHandler, RateLimiter};
use crate::request::{RequestOptions, RetryingRequest};
use crate::transport::{Dialer, TcpDialer};

/// A local endpoint: accepts connections, dials peers and issues requests.
pub struct Channel {
    config: ChannelConfig,
    ctx: ConnectionContext,
    pool: Arc<PeerPool>,
    rate_limiter: Option<Arc<RateLimiter>>,
    accept: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Channel {
    /// Listens on `addr` and serves inbound calls with `handler`.
    ///
    /// Binding port 0 picks a free port; [`Channel::host_port`] reports the result.
    pub async fn bind(
        config: ChannelConfig,
        addr: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Network {
                addr: addr.to_string(),
                source,
            })?;
        let host_port = listener.local_addr()?.to_string();
        let dialer = Arc::new(TcpDialer::new(config.connect_timeout(), config.nodelay));
        let channel = Self::build(config, host_port, handler, dialer)?;

        let handle = tokio::spawn(accept_loop(
            listener,
            channel.ctx.clone(),
            Arc::downgrade(&channel.pool),
            channel.config.nodelay,
        ));
        *lock(&channel.accept) = Some(handle);
        info!(host_port = %channel.host_port(), "channel listening");
        Ok(channel)
    }

    /// A channel that only makes outbound calls.
    ///
    /// It announces itself as `0.0.0.0:0`, so servers name it by its socket address
    /// and never dial it back.
    pub fn client(config: ChannelConfig, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        let dialer = Arc::new(TcpDialer::new(config.connect_timeout(), config.nodelay));
        Self::with_dialer(config, handler, dialer)
    }

    /// A client channel dialing through `dialer`.
    pub fn with_dialer(
        config: ChannelConfig,
        handler: Arc<dyn RequestHandler>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self> {
        Self::build(config, EPHEMERAL_HOST_PORT.to_string(), handler, dialer)
    }

    fn build(
        config: ChannelConfig,
        host_port: String,
        handler: Arc<dyn RequestHandler>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(ChannelMetrics::new());
        let rate_limiter = match &config.rate_limiter {
            Some(limiter) => Some(Arc::new(RateLimiter::new(limiter.clone())?)),
            None => None,
        };
        let ctx = ConnectionContext {
            host_port,
            process_name: config.process_name.clone(),
            config: config.connection.clone(),
            handler: Arc::new(HandlerCell::new(front_door(
                rate_limiter.as_ref(),
                handler,
                &metrics,
            ))),
            registry: Arc::new(ConnectionRegistry::new()),
            metrics,
        };
        let pool = Arc::new(PeerPool::new(
            ctx.clone(),
            dialer,
            config.health.clone(),
            config.peer_score_threshold,
        ));
        if let Some(limiter) = &rate_limiter {
            limiter.start();
        }
        Ok(Self {
            config,
            ctx,
            pool,
            rate_limiter,
            accept: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Address this channel announces to peers.
    pub fn host_port(&self) -> &str {
        &self.ctx.host_port
    }

    /// Settings the channel was built with.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Peer pool shared with relays and requests.
    pub fn peers(&self) -> &Arc<PeerPool> {
        &self.pool
    }

    /// Replaces the handler for calls arriving from now on.
    pub fn set_handler(&self, handler: Arc<dyn RequestHandler>) {
        self.ctx.handler.set(front_door(
            self.rate_limiter.as_ref(),
            handler,
            &self.ctx.metrics,
        ));
    }

    /// Front-door limiter, when configured.
    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// Request options carrying this channel's request defaults.
    pub fn request_options(&self, service: impl Into<String>) -> RequestOptions {
        RequestOptions::from_config(&self.config.request, &self.config.connection, service)
    }

    /// Starts a retrying request on this channel's pool.
    pub fn request(&self, options: RequestOptions) -> RetryingRequest {
        RetryingRequest::new(Arc::clone(&self.pool), options)
    }

    /// Every live connection, inbound and outbound.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.ctx.registry.snapshot()
    }

    /// Stops listening, resets every connection and forgets every peer.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(accept) = lock(&self.accept).take() {
            accept.abort();
        }
        if let Some(limiter) = &self.rate_limiter {
            limiter.destroy();
        }
        self.pool.close();
        self.ctx.registry.close_all();
        info!(host_port = %self.host_port(), "channel closed");
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("host_port", &self.ctx.host_port)
            .field("peers", &self.pool.len())
            .field("connections", &self.ctx.registry.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn front_door(
    limiter: Option<&Arc<RateLimiter>>,
    handler: Arc<dyn RequestHandler>,
    metrics: &Arc<ChannelMetrics>,
) -> Arc<dyn RequestHandler> {
    match limiter {
        Some(limiter) => Arc::new(RateLimitedHandler::new(
            Arc::clone(limiter),
            handler,
            Arc::clone(metrics),
        )),
        None => handler,
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: ConnectionContext,
    pool: Weak<PeerPool>,
    nodelay: bool,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };
        if pool.strong_count() == 0 {
            break;
        }
        if let Err(e) = stream.set_nodelay(nodelay) {
            debug!(peer = %addr, error = %e, "failed to set TCP_NODELAY");
        }
        let socket_addr = addr.to_string();
        debug!(peer = %socket_addr, "accepted connection");
        let conn = Connection::inbound(&ctx, &socket_addr);
        conn.attach(Box::new(stream));

        let pool = pool.clone();
        let local = ctx.host_port.clone();
        tokio::spawn(async move {
            match conn.wait_identified().await {
                Ok(name) if name == socket_addr || name == local => {
                    debug!(peer = %name, "inbound caller is not dialable; not pooling");
                }
                Ok(name) => {
                    if let Some(pool) = pool.upgrade() {
                        pool.add(&name).add_connection(&conn);
                        debug!(peer = %name, conn = conn.id(), "inbound connection pooled");
                    }
                }
                Err(e) => debug!(peer = %socket_addr, error = %e, "inbound connection never identified"),
            }
        });
    }
}
