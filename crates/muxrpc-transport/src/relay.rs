//! Transparent forwarding of inbound calls to another peer.
//!
//! A relay never forwards a call back to the peer it came from, nor to itself.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::RequestConfig;
use crate::connection::ConnectionId;
use crate::error::{classify, ErrorCode, TransportError};
use crate::handler::{InboundCall, RequestHandler, ResponseBuilder, ResponseOptions};
use crate::pool::PeerPool;
use crate::protocol::OperationId;
use crate::request::{RequestOptions, RetryingRequest};

type RelayKey = (ConnectionId, OperationId);

/// Forwards every inbound call through a retrying request on a peer pool and
/// replays the outcome to the caller unchanged.
pub struct RelayHandler {
    pool: Weak<PeerPool>,
    request: RequestConfig,
    routes: HashMap<String, String>,
    targets: HashMap<String, HashSet<String>>,
    inflight: Arc<DashMap<RelayKey, ()>>,
}

impl RelayHandler {
    /// Relays through `pool`; the handler does not keep the pool alive.
    pub fn new(pool: &Arc<PeerPool>, request: RequestConfig) -> Self {
        Self {
            pool: Arc::downgrade(pool),
            request,
            routes: HashMap::new(),
            targets: HashMap::new(),
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Sends calls for `service` to `host_port` instead of choosing a peer.
    pub fn with_route(mut self, service: impl Into<String>, host_port: impl Into<String>) -> Self {
        self.routes.insert(service.into(), host_port.into());
        self
    }

    /// Only forwards calls for `service` to one of `hosts`.
    pub fn with_targets<I, S>(mut self, service: impl Into<String>, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets
            .insert(service.into(), hosts.into_iter().map(Into::into).collect());
        self
    }

    /// Calls currently being relayed.
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    fn options_for(&self, pool: &PeerPool, call: &InboundCall, now: Instant) -> RequestOptions {
        let mut options = RequestOptions::from_config(
            &self.request,
            pool.connection_config(),
            call.service.clone(),
        );
        options.timeout = call.remaining_ttl(now);
        options.timeout_per_attempt = None;
        options.headers = call.headers.clone();
        options.retry_flags = call.retry_flags;
        options.streamed = call.streamed;
        options.host = self.routes.get(&call.service).cloned();
        options.excluded_hosts.insert(call.remote_name.clone());
        options.excluded_hosts.insert(pool.host_port().to_string());
        options.allowed_hosts = self.targets.get(&call.service).cloned();
        options
    }
}

/// Removes the relay entry when the forwarded call finishes.
struct InflightGuard {
    map: Arc<DashMap<RelayKey, ()>>,
    key: RelayKey,
}

impl InflightGuard {
    fn acquire(map: &Arc<DashMap<RelayKey, ()>>, key: RelayKey) -> Option<Self> {
        match map.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Some(Self {
                    map: Arc::clone(map),
                    key,
                })
            }
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Error code and message relayed back for a failed forward.
fn relay_error(err: &TransportError) -> (ErrorCode, String) {
    let message = match err {
        TransportError::ErrorFrame { message, .. } => message.clone(),
        other => other.to_string(),
    };
    match classify(err) {
        Some(code) => (code, message),
        None => {
            error!(error = %err, "unexpected error while forwarding");
            (ErrorCode::UnexpectedError, message)
        }
    }
}

#[async_trait]
impl RequestHandler for RelayHandler {
    async fn handle_request(&self, call: InboundCall, response: ResponseBuilder) {
        let Some(_guard) = InflightGuard::acquire(&self.inflight, (call.connection, call.id)) else {
            error!(
                id = call.id,
                connection = call.connection,
                caller = %call.remote_name,
                "relay request already exists for incoming request"
            );
            response.send_error(ErrorCode::UnexpectedError, "request id exists in relay handler");
            return;
        };
        let Some(pool) = self.pool.upgrade() else {
            warn!(service = %call.service, "relay target pool is gone");
            response.send_error(ErrorCode::Declined, "relay channel closed");
            return;
        };

        let options = self.options_for(&pool, &call, Instant::now());
        pool.metrics().inc_relayed();
        debug!(
            id = call.id,
            service = %call.service,
            ttl_ms = options.timeout.as_millis() as u64,
            "relaying call"
        );
        let args = call.args;
        let result = RetryingRequest::new(pool, options)
            .send(args.arg1, args.arg2, args.arg3)
            .await;

        match result {
            Ok(res) => {
                let ok = res.ok;
                let (arg2, arg3) = (res.arg2().clone(), res.arg3().clone());
                response
                    .build(ResponseOptions {
                        streamed: res.streamed,
                        headers: res.headers,
                    })
                    .send(ok, arg2, arg3);
            }
            Err(err) => {
                let (code, message) = relay_error(&err);
                debug!(id = call.id, code = %code, "relayed call failed");
                response.send_error(code, message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inflight_guard_rejects_duplicates() {
        let map = Arc::new(DashMap::new());
        let first = InflightGuard::acquire(&map, (1, 7));
        assert!(first.is_some());
        assert!(InflightGuard::acquire(&map, (1, 7)).is_none());
        assert!(InflightGuard::acquire(&map, (2, 7)).is_some());
        drop(first);
        assert!(InflightGuard::acquire(&map, (1, 7)).is_some());
        assert!(map.is_empty());
    }

    #[test]
    fn test_relay_error_keeps_remote_message() {
        let err = TransportError::ErrorFrame {
            code: ErrorCode::Busy,
            id: 4,
            remote: "127.0.0.1:5000".to_string(),
            message: "try later".to_string(),
        };
        assert_eq!(relay_error(&err), (ErrorCode::Busy, "try later".to_string()));
    }

    #[test]
    fn test_relay_error_classifies_local_failures() {
        let (code, _) = relay_error(&TransportError::NoPeerAvailable);
        assert_eq!(code, ErrorCode::Declined);
        let (code, _) = relay_error(&TransportError::DeadlineExceeded {
            elapsed_ms: 10,
            timeout_ms: 10,
            attempts: 1,
        });
        assert_eq!(code, ErrorCode::Timeout);
    }

    #[test]
    fn test_relay_error_unclassified_is_unexpected() {
        let err = TransportError::RetryLimitExceeded {
            limit: 1,
            attempts: 2,
            elapsed_ms: 3,
            tried: vec!["127.0.0.1:1".to_string()],
        };
        let (code, message) = relay_error(&err);
        assert_eq!(code, ErrorCode::UnexpectedError);
        assert!(!message.is_empty());
    }
}
