#![warn(missing_docs)]

//! muxrpc transport core: multiplexed connections, peer health, retrying requests,
//! transparent relaying and sliding-window admission control.

pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod health;
pub mod metrics;
pub mod operations;
pub mod peer;
pub mod pool;
pub mod protocol;
pub mod ratelimit;
pub mod relay;
pub mod request;
pub mod transport;

pub use channel::Channel;
pub use config::{ChannelConfig, ConnectionConfig, HealthConfig, RateLimiterConfig, RequestConfig};
pub use connection::{Connection, ConnectionId, Direction};
pub use error::{classify, ErrorCode, Result, TransportError};
pub use handler::{InboundCall, OutboundResponse, RequestHandler, ResponseBuilder, ResponseOptions};
pub use health::{Connectivity, HealthStatus, PeerHealth};
pub use peer::Peer;
pub use pool::{ChooseOptions, PeerPool};
pub use protocol::{CallArgs, CallResponse, Headers, RetryFlags};
pub use ratelimit::{RateLimitedHandler, RateLimiter};
pub use relay::RelayHandler;
pub use request::{RequestOptions, RetryingRequest};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a std mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
