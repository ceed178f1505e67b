//! Channel configuration
//!
//! Every struct deserializes from a partial document: missing fields take the
//! documented defaults. Durations are expressed in milliseconds.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::protocol::RetryFlags;

/// Largest ring size accepted by the rate limiter.
pub const MAX_RATE_LIMITER_BUCKETS: usize = 1000;

/// Per-connection operation tracking settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Base period of the timeout sweeper (default: 100).
    pub timeout_check_interval_ms: u64,
    /// Width of the uniform jitter applied to each sweep (default: 100).
    pub timeout_fuzz_ms: u64,
    /// TTL of outbound calls that do not specify one (default: 5000).
    pub req_timeout_default_ms: u64,
    /// Age after which an unanswered inbound call is forgotten (default: 5000).
    pub server_timeout_default_ms: u64,
    /// Time a connection may stay unidentified before it is declared dead (default: 2000).
    pub init_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_check_interval_ms: 100,
            timeout_fuzz_ms: 100,
            req_timeout_default_ms: 5000,
            server_timeout_default_ms: 5000,
            init_timeout_ms: 2000,
        }
    }
}

impl ConnectionConfig {
    /// Base sweep period.
    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_check_interval_ms)
    }

    /// Sweep jitter width.
    pub fn timeout_fuzz(&self) -> Duration {
        Duration::from_millis(self.timeout_fuzz_ms)
    }

    /// TTL of requests created without an explicit budget.
    pub fn req_timeout_default(&self) -> Duration {
        Duration::from_millis(self.req_timeout_default_ms)
    }

    /// Age at which unanswered inbound calls are dropped.
    pub fn server_timeout_default(&self) -> Duration {
        Duration::from_millis(self.server_timeout_default_ms)
    }

    /// Handshake deadline.
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    /// Checks that the sweeper can make progress.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_check_interval_ms == 0 {
            return Err(TransportError::InvalidConfig {
                reason: "timeout_check_interval_ms must be positive".to_string(),
            });
        }
        if self.timeout_fuzz_ms / 2 >= self.timeout_check_interval_ms {
            return Err(TransportError::InvalidConfig {
                reason: format!(
                    "timeout_fuzz_ms {} too large for check interval {}",
                    self.timeout_fuzz_ms, self.timeout_check_interval_ms
                ),
            });
        }
        Ok(())
    }
}

/// Peer health state machine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Length of one observation period (default: 1000).
    pub period_ms: u64,
    /// Failure fraction above which a healthy peer turns unhealthy (default: 0.5).
    pub max_error_rate: f64,
    /// Successes an unhealthy peer must exceed to recover (default: 5).
    pub probation: u64,
    /// Calls a period must exceed before its error rate is trusted (default: 0).
    pub min_requests: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            period_ms: 1000,
            max_error_rate: 0.5,
            probation: 5,
            min_requests: 0,
        }
    }
}

impl HealthConfig {
    /// Length of one observation period.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Rejects an empty period or an error rate outside `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        if self.period_ms == 0 {
            return Err(TransportError::InvalidConfig {
                reason: "period_ms must be positive".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.max_error_rate) {
            return Err(TransportError::InvalidConfig {
                reason: format!("max_error_rate {} outside [0, 1]", self.max_error_rate),
            });
        }
        Ok(())
    }
}

/// Sliding-window rate limiter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Buckets in the one second window (default: 20, at most 1000).
    pub num_of_buckets: usize,
    /// Limit for services without an explicit entry (default: 100).
    pub default_service_rps_limit: u64,
    /// Limit across all non-exempt services (default: 1000).
    pub total_rps_limit: u64,
    /// Services that are never counted or limited.
    pub exempt_services: Vec<String>,
    /// Per-service limits.
    pub rps_limit_for_service_name: HashMap<String, u64>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            num_of_buckets: 20,
            default_service_rps_limit: 100,
            total_rps_limit: 1000,
            exempt_services: Vec::new(),
            rps_limit_for_service_name: HashMap::new(),
        }
    }
}

impl RateLimiterConfig {
    /// Rejects a bucket count outside `1..=MAX_RATE_LIMITER_BUCKETS`.
    pub fn validate(&self) -> Result<()> {
        if self.num_of_buckets == 0 || self.num_of_buckets > MAX_RATE_LIMITER_BUCKETS {
            return Err(TransportError::InvalidConfig {
                reason: format!(
                    "num_of_buckets {} outside 1..={}",
                    self.num_of_buckets, MAX_RATE_LIMITER_BUCKETS
                ),
            });
        }
        Ok(())
    }
}

/// Defaults applied to requests created from a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Attempts after which ordinary retries stop (default: 5).
    pub retry_limit: u32,
    /// Budget for the whole logical request; when absent the connection's
    /// `req_timeout_default_ms` applies.
    pub timeout_ms: Option<u64>,
    /// Optional cap on each attempt; setting it enables retry on timeout.
    pub timeout_per_attempt_ms: Option<u64>,
    /// Which failure classes may be retried.
    pub retry_flags: RetryFlags,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            retry_limit: 5,
            timeout_ms: None,
            timeout_per_attempt_ms: None,
            retry_flags: RetryFlags::default(),
        }
    }
}

impl RequestConfig {
    /// Request budget, or `connection`'s default request TTL when none is set.
    pub fn timeout_or(&self, connection: &ConnectionConfig) -> Duration {
        self.timeout_ms
            .map_or_else(|| connection.req_timeout_default(), Duration::from_millis)
    }

    /// Per-attempt cap, if any.
    pub fn timeout_per_attempt(&self) -> Option<Duration> {
        self.timeout_per_attempt_ms.map(Duration::from_millis)
    }
}

/// Top-level channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Name announced in the init handshake.
    pub process_name: String,
    /// Dial timeout for outbound sockets (default: 5000).
    pub connect_timeout_ms: u64,
    /// Whether TCP_NODELAY is set on sockets (default: true).
    pub nodelay: bool,
    /// Minimum score a peer needs to be chosen (default: 0).
    pub peer_score_threshold: f64,
    /// Settings of every connection.
    pub connection: ConnectionConfig,
    /// Settings of every peer's health machine.
    pub health: HealthConfig,
    /// Defaults for requests built with `Channel::request_options`.
    pub request: RequestConfig,
    /// Front-door admission control; disabled when absent.
    pub rate_limiter: Option<RateLimiterConfig>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            process_name: format!("muxrpc[{}]", std::process::id()),
            connect_timeout_ms: 5000,
            nodelay: true,
            peer_score_threshold: 0.0,
            connection: ConnectionConfig::default(),
            health: HealthConfig::default(),
            request: RequestConfig::default(),
            rate_limiter: None,
        }
    }
}

impl ChannelConfig {
    /// Dial timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Validates every nested section.
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;
        self.health.validate()?;
        if let Some(limiter) = &self.rate_limiter {
            limiter.validate()?;
        }
        if !(0.0..1.0).contains(&self.peer_score_threshold) {
            return Err(TransportError::InvalidConfig {
                reason: format!(
                    "peer_score_threshold {} outside [0, 1)",
                    self.peer_score_threshold
                ),
            });
        }
        Ok(())
    }
}
