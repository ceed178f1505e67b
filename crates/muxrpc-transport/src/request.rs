//! Logical requests that retry across peers.
//!
//! A [`RetryingRequest`] owns one caller-visible call. Each attempt goes to the best
//! peer not yet tried; failures are retried according to their classification and the
//! request's [`RetryFlags`], all within a single time budget. Exactly one terminal
//! result is produced: `send` consumes the request.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::config::{ConnectionConfig, RequestConfig};
use crate::connection::OutboundCall;
use crate::error::{classify, ErrorCode, Result, TransportError};
use crate::peer::Peer;
use crate::pool::{ChooseOptions, PeerPool};
use crate::protocol::{CallArgs, CallResponse, Headers, RetryFlags};

/// Decides whether an application-level not-ok response should be retried.
pub type ApplicationRetry = Arc<dyn Fn(&CallResponse) -> bool + Send + Sync>;

/// Options of one logical request.
#[derive(Clone)]
pub struct RequestOptions {
    /// Service name carried in the call head.
    pub service: String,
    /// Transport headers sent with every attempt.
    pub headers: Headers,
    /// Budget for the whole request, retries included.
    pub timeout: Duration,
    /// Cap on each attempt; setting it enables retry on timeout.
    pub timeout_per_attempt: Option<Duration>,
    /// Attempts after which ordinary retries stop.
    pub retry_limit: u32,
    /// Failure classes that may be retried.
    pub retry_flags: RetryFlags,
    /// Marks the call as streamed.
    pub streamed: bool,
    /// Send every attempt to this peer instead of choosing one.
    pub host: Option<String>,
    /// Peers that are never chosen for this request.
    pub excluded_hosts: HashSet<String>,
    /// When set, only these peers may be chosen.
    pub allowed_hosts: Option<HashSet<String>>,
    /// Overrides the pool's minimum peer score.
    pub peer_score_threshold: Option<f64>,
    /// Retries not-ok responses the predicate accepts.
    pub should_application_retry: Option<ApplicationRetry>,
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("service", &self.service)
            .field("timeout", &self.timeout)
            .field("timeout_per_attempt", &self.timeout_per_attempt)
            .field("retry_limit", &self.retry_limit)
            .field("retry_flags", &self.retry_flags)
            .field("host", &self.host)
            .field("excluded_hosts", &self.excluded_hosts)
            .field("allowed_hosts", &self.allowed_hosts)
            .field(
                "should_application_retry",
                &self.should_application_retry.is_some(),
            )
            .finish()
    }
}

impl RequestOptions {
    /// Options with every default applied.
    pub fn new(service: impl Into<String>) -> Self {
        Self::from_config(&RequestConfig::default(), &ConnectionConfig::default(), service)
    }

    /// Options from a channel's request defaults. A request config without a timeout
    /// takes the connection's default request TTL.
    pub fn from_config(
        config: &RequestConfig,
        connection: &ConnectionConfig,
        service: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            headers: Headers::new(),
            timeout: config.timeout_or(connection),
            timeout_per_attempt: config.timeout_per_attempt(),
            retry_limit: config.retry_limit,
            retry_flags: config.retry_flags,
            streamed: false,
            host: None,
            excluded_hosts: HashSet::new(),
            allowed_hosts: None,
            peer_score_threshold: None,
            should_application_retry: None,
        }
    }

    /// Sets the whole-request budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Caps each attempt and turns on timeout retries.
    pub fn with_timeout_per_attempt(mut self, timeout: Duration) -> Self {
        self.timeout_per_attempt = Some(timeout);
        self
    }

    /// Sets the attempt count after which retries stop.
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Replaces the retry flags.
    pub fn with_retry_flags(mut self, flags: RetryFlags) -> Self {
        self.retry_flags = flags;
        self
    }

    /// Adds a transport header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Pins every attempt to `host`.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Never chooses `host`, even on the first attempt.
    pub fn with_excluded_host(mut self, host: impl Into<String>) -> Self {
        self.excluded_hosts.insert(host.into());
        self
    }

    /// Restricts peer choice to `hosts`.
    pub fn with_allowed_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_hosts = Some(hosts.into_iter().map(Into::into).collect());
        self
    }

    /// Retries not-ok responses for which `predicate` returns true.
    pub fn with_application_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CallResponse) -> bool + Send + Sync + 'static,
    {
        self.should_application_retry = Some(Arc::new(predicate));
        self
    }

    /// Retry flags in effect; a per-attempt timeout implies retrying timeouts.
    pub fn effective_retry_flags(&self) -> RetryFlags {
        let mut flags = self.retry_flags;
        if self.timeout_per_attempt.is_some() {
            flags.on_timeout = true;
        }
        flags
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Still in flight.
    Pending,
    /// Answered ok.
    Ok,
    /// Answered with an application not-ok.
    NotOk,
    /// Failed with the given classification.
    Error(Option<ErrorCode>),
}

/// Record of one attempt.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    /// Peer the attempt went to.
    pub remote_addr: String,
    /// Zero for the first attempt.
    pub retry_count: usize,
    /// When the attempt was started.
    pub started: Instant,
    /// How it ended.
    pub outcome: AttemptOutcome,
}

/// What happened over the life of a request.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    /// Every attempt, in order.
    pub attempts: Vec<AttemptRecord>,
    /// Attempts per peer address.
    pub tried: HashMap<String, u32>,
    /// Time from send to the terminal result.
    pub elapsed: Duration,
}

/// Whether a failed attempt may be retried.
///
/// `attempts` is the number of attempts made so far, the failed one included.
pub fn should_retry(
    err: &TransportError,
    attempts: usize,
    retry_limit: u32,
    flags: RetryFlags,
) -> bool {
    if attempts >= retry_limit as usize || flags.never {
        return false;
    }
    match classify(err) {
        Some(ErrorCode::BadRequest | ErrorCode::Cancelled | ErrorCode::Unhealthy) => false,
        Some(ErrorCode::Busy | ErrorCode::Declined) => true,
        Some(ErrorCode::Timeout) => flags.on_timeout,
        Some(ErrorCode::NetworkError | ErrorCode::ProtocolError | ErrorCode::UnexpectedError) => {
            flags.on_connection_error
        }
        None => {
            error!(error = %err, "unclassified error; not retrying");
            false
        }
    }
}

enum Outcome {
    Response(CallResponse),
    Error(TransportError),
}

impl Outcome {
    fn into_result(self) -> Result<CallResponse> {
        match self {
            Outcome::Response(response) => Ok(response),
            Outcome::Error(err) => Err(err),
        }
    }
}

/// A logical request, retried across peers within one budget.
pub struct RetryingRequest {
    pool: Arc<PeerPool>,
    options: RequestOptions,
    tried: HashMap<String, u32>,
    attempts: Vec<AttemptRecord>,
}

impl RetryingRequest {
    /// A request that chooses its peers from `pool`.
    pub fn new(pool: Arc<PeerPool>, options: RequestOptions) -> Self {
        Self {
            pool,
            options,
            tried: HashMap::new(),
            attempts: Vec::new(),
        }
    }

    /// Options the request runs with.
    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Sends the request and waits for its terminal result.
    pub async fn send(
        self,
        arg1: impl Into<Bytes>,
        arg2: impl Into<Bytes>,
        arg3: impl Into<Bytes>,
    ) -> Result<CallResponse> {
        self.send_with_summary(arg1, arg2, arg3).await.0
    }

    /// Like [`RetryingRequest::send`], also returning the attempt history.
    pub async fn send_with_summary(
        mut self,
        arg1: impl Into<Bytes>,
        arg2: impl Into<Bytes>,
        arg3: impl Into<Bytes>,
    ) -> (Result<CallResponse>, RequestSummary) {
        let args = CallArgs::new(arg1, arg2, arg3);
        let start = Instant::now();
        let result = self.run(args, start).await;
        let summary = RequestSummary {
            attempts: self.attempts,
            tried: self.tried,
            elapsed: start.elapsed(),
        };
        (result, summary)
    }

    async fn run(&mut self, args: CallArgs, start: Instant) -> Result<CallResponse> {
        let deadline = start + self.options.timeout;
        let flags = self.options.effective_retry_flags();
        let choose = ChooseOptions {
            host: self.options.host.clone(),
            peer_score_threshold: self.options.peer_score_threshold,
            excluded: self.options.excluded_hosts.clone(),
            allowed: self.options.allowed_hosts.clone(),
        };
        let mut resend_sanity = self.options.retry_limit + 1;
        let mut last: Option<Outcome> = None;
        self.pool.metrics().inc_calls_sent();

        loop {
            if Instant::now() >= deadline {
                return match last {
                    Some(outcome) => outcome.into_result(),
                    None => Err(self.deadline_exceeded(start)),
                };
            }

            let Some(peer) = self.pool.choose_peer(&self.tried, &choose) else {
                debug!(service = %self.options.service, tried = self.tried.len(), "no peer available");
                return match last {
                    Some(outcome) => outcome.into_result(),
                    None => Err(TransportError::NoPeerAvailable),
                };
            };

            let outcome = self.attempt(&peer, &args, start, deadline).await;
            let expired = Instant::now() >= deadline;
            match outcome {
                Outcome::Response(response) if response.ok => return Ok(response),
                Outcome::Response(response) => {
                    let retry = !expired
                        && !flags.never
                        && self
                            .options
                            .should_application_retry
                            .as_ref()
                            .map_or(false, |predicate| predicate(&response));
                    if !retry {
                        return Ok(response);
                    }
                    last = Some(Outcome::Response(response));
                }
                Outcome::Error(err) => {
                    if expired
                        || !should_retry(&err, self.attempts.len(), self.options.retry_limit, flags)
                    {
                        return Err(err);
                    }
                    last = Some(Outcome::Error(err));
                }
            }

            resend_sanity = resend_sanity.saturating_sub(1);
            if resend_sanity == 0 {
                return Err(TransportError::RetryLimitExceeded {
                    limit: self.options.retry_limit,
                    attempts: self.attempts.len(),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    tried: self.tried_addrs(),
                });
            }
            tokio::task::yield_now().await;
        }
    }

    async fn attempt(
        &mut self,
        peer: &Arc<Peer>,
        args: &CallArgs,
        start: Instant,
        deadline: Instant,
    ) -> Outcome {
        let host_port = peer.host_port().to_string();
        if !self.attempts.is_empty() {
            self.pool.metrics().inc_retries();
        }
        *self.tried.entry(host_port.clone()).or_insert(0) += 1;
        self.attempts.push(AttemptRecord {
            remote_addr: host_port.clone(),
            retry_count: self.attempts.len(),
            started: Instant::now(),
            outcome: AttemptOutcome::Pending,
        });
        self.pool.metrics().inc_attempts();

        let result = self.dispatch(peer, args, start, deadline).await;
        let outcome = match &result {
            Ok(response) if response.ok => AttemptOutcome::Ok,
            Ok(_) => AttemptOutcome::NotOk,
            Err(err) => AttemptOutcome::Error(classify(err)),
        };
        debug!(
            peer = %host_port,
            service = %self.options.service,
            attempt = self.attempts.len(),
            outcome = ?outcome,
            "attempt finished"
        );
        if let Some(record) = self.attempts.last_mut() {
            record.outcome = outcome;
        }
        match result {
            Ok(response) => Outcome::Response(response),
            Err(err) => Outcome::Error(err),
        }
    }

    async fn dispatch(
        &self,
        peer: &Arc<Peer>,
        args: &CallArgs,
        start: Instant,
        deadline: Instant,
    ) -> Result<CallResponse> {
        match tokio::time::timeout_at(deadline, peer.wait_for_identified()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                peer.health().on_error(classify(&err));
                return Err(err);
            }
            Err(_) => return Err(self.deadline_exceeded(start)),
        }

        let now = Instant::now();
        let remaining = deadline.saturating_duration_since(now);
        let ttl = match self.options.timeout_per_attempt {
            Some(per_attempt) => remaining.min(per_attempt),
            None => remaining,
        };
        let call = OutboundCall {
            service: self.options.service.clone(),
            headers: self.options.headers.clone(),
            ttl,
            retry_flags: self.options.retry_flags,
            streamed: self.options.streamed,
            args: args.clone(),
        };
        let pending = peer.request(call)?;
        pending.wait_until(now + ttl).await
    }

    fn deadline_exceeded(&self, start: Instant) -> TransportError {
        TransportError::DeadlineExceeded {
            elapsed_ms: start.elapsed().as_millis() as u64,
            timeout_ms: self.options.timeout.as_millis() as u64,
            attempts: self.attempts.len(),
        }
    }

    fn tried_addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.tried.keys().cloned().collect();
        addrs.sort();
        addrs
    }
}
