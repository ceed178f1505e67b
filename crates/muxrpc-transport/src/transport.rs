//! Socket abstraction and outbound dialing.
//!
//! Connections only need a byte stream. [`Dialer`] is the seam that produces one for a
//! `host:port`; [`TcpDialer`] is the production implementation.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, TransportError};

/// A bidirectional byte stream a connection can run on.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Socket for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed socket handed to a connection.
pub type BoxSocket = Box<dyn Socket>;

/// Opens outbound sockets.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connects to `host_port`.
    async fn dial(&self, host_port: &str) -> Result<BoxSocket>;
}

/// Dials plain TCP sockets.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
    nodelay: bool,
}

impl TcpDialer {
    /// A dialer with the given connect timeout and TCP_NODELAY setting.
    pub fn new(connect_timeout: Duration, nodelay: bool) -> Self {
        Self {
            connect_timeout,
            nodelay,
        }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(Duration::from_millis(5000), true)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host_port: &str) -> Result<BoxSocket> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            tokio::net::TcpStream::connect(host_port),
        )
        .await
        .map_err(|_| TransportError::ConnectionTimeout {
            addr: host_port.to_string(),
            reason: format!("connect did not finish within {:?}", self.connect_timeout),
        })?
        .map_err(|source| TransportError::Network {
            addr: host_port.to_string(),
            source,
        })?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(addr = host_port, "TCP connected");
        Ok(Box::new(stream))
    }
}

/// Checks that `host_port` names an endpoint that can be dialed.
pub fn validate_host_port(host_port: &str) -> Result<()> {
    let invalid = |reason| TransportError::InvalidPeerAddress {
        addr: host_port.to_string(),
        reason,
    };
    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;
    if host.is_empty() {
        return Err(invalid("empty host"));
    }
    if host == "0.0.0.0" {
        return Err(invalid("cannot dial the unspecified address"));
    }
    let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;
    if port == 0 {
        return Err(invalid("cannot dial port 0"));
    }
    Ok(())
}
