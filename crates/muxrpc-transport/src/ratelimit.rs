//! Sliding-window admission control.
//!
//! Rates are measured over a one second window split into `num_of_buckets` buckets.
//! A ticker rotates every counter by one bucket each `1s / num_of_buckets`, so the
//! running sum of a counter is the number of increments seen in roughly the last
//! second. One counter tracks all traffic and one is created per service on first use.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RateLimiterConfig;
use crate::error::{ErrorCode, Result};
use crate::handler::{InboundCall, RequestHandler, ResponseBuilder};
use crate::lock;
use crate::metrics::ChannelMetrics;

/// A ring of per-bucket counts with a running sum.
#[derive(Debug, Clone)]
pub struct RateLimiterCounter {
    buckets: Vec<u64>,
    index: usize,
    rps: u64,
    limit: u64,
}

impl RateLimiterCounter {
    /// A zeroed ring of `num_of_buckets` buckets.
    pub fn new(num_of_buckets: usize, limit: u64) -> Self {
        Self {
            buckets: vec![0; num_of_buckets.max(1)],
            index: 0,
            rps: 0,
            limit,
        }
    }

    /// Counts one request in the current bucket.
    pub fn increment(&mut self) {
        self.buckets[self.index] += 1;
        self.rps += 1;
    }

    /// Moves to the next bucket, evicting its old count from the sum.
    pub fn refresh(&mut self) {
        let next = (self.index + 1) % self.buckets.len();
        self.rps = self.rps.saturating_sub(self.buckets[next]);
        self.index = next;
        self.buckets[next] = 0;
    }

    /// Requests over the whole window.
    pub fn rps(&self) -> u64 {
        self.rps
    }

    /// Configured limit.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Changes the limit.
    pub fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }

    /// Whether the window holds more requests than the limit.
    pub fn exceeded(&self) -> bool {
        self.rps > self.limit
    }

    /// Bucket contents, oldest slot first in ring order.
    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }
}

struct LimiterState {
    num_of_buckets: usize,
    default_service_rps_limit: u64,
    total: RateLimiterCounter,
    services: HashMap<String, RateLimiterCounter>,
    service_limits: HashMap<String, u64>,
    exempt: HashSet<String>,
    destroyed: bool,
}

impl LimiterState {
    fn is_exempt(&self, service: &str) -> bool {
        self.exempt.contains(service)
    }

    fn limit_for(&self, service: &str) -> u64 {
        self.service_limits
            .get(service)
            .copied()
            .unwrap_or(self.default_service_rps_limit)
    }
}

/// Global and per-service request rate limiter.
pub struct RateLimiter {
    state: Mutex<LimiterState>,
    refresh_delay: Duration,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Builds a limiter from validated config. The ticker is not started.
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        config.validate()?;
        let num_of_buckets = config.num_of_buckets;
        Ok(Self {
            state: Mutex::new(LimiterState {
                num_of_buckets,
                default_service_rps_limit: config.default_service_rps_limit,
                total: RateLimiterCounter::new(num_of_buckets, config.total_rps_limit),
                services: HashMap::new(),
                service_limits: config.rps_limit_for_service_name,
                exempt: config.exempt_services.into_iter().collect(),
                destroyed: false,
            }),
            refresh_delay: Duration::from_secs(1) / num_of_buckets as u32,
            ticker: Mutex::new(None),
        })
    }

    /// Interval between two refreshes.
    pub fn refresh_delay(&self) -> Duration {
        self.refresh_delay
    }

    /// Starts the refresh ticker. Calling it again has no effect.
    pub fn start(self: &Arc<Self>) {
        let mut ticker = lock(&self.ticker);
        if ticker.is_some() || self.is_destroyed() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("no runtime; rate limiter refresh not started");
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let delay = self.refresh_delay;
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + delay, delay);
            loop {
                interval.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                if limiter.is_destroyed() {
                    break;
                }
                limiter.refresh();
            }
        }));
    }

    /// Rotates every counter by one bucket.
    pub fn refresh(&self) {
        let mut state = lock(&self.state);
        if state.destroyed {
            return;
        }
        state.total.refresh();
        for counter in state.services.values_mut() {
            counter.refresh();
        }
    }

    /// Counts a request against the total, unless `service` is exempt.
    pub fn increment_total_counter(&self, service: Option<&str>) {
        let mut state = lock(&self.state);
        if state.destroyed || service.map_or(false, |s| state.is_exempt(s)) {
            return;
        }
        state.total.increment();
    }

    /// Counts a request against its service, creating the counter on first use.
    pub fn increment_service_counter(&self, service: &str) {
        let mut state = lock(&self.state);
        if state.destroyed || state.is_exempt(service) {
            return;
        }
        let limit = state.limit_for(service);
        let num_of_buckets = state.num_of_buckets;
        state
            .services
            .entry(service.to_string())
            .or_insert_with(|| RateLimiterCounter::new(num_of_buckets, limit))
            .increment();
    }

    /// Whether the total limit rejects a call for `service`. Exempt services never are.
    pub fn should_rate_limit_total_request(&self, service: Option<&str>) -> bool {
        let state = lock(&self.state);
        if service.map_or(false, |s| state.is_exempt(s)) {
            return false;
        }
        state.total.exceeded()
    }

    /// A service without a counter has seen no traffic and is never limited.
    pub fn should_rate_limit_service(&self, service: &str) -> bool {
        let state = lock(&self.state);
        if state.is_exempt(service) {
            return false;
        }
        state
            .services
            .get(service)
            .map_or(false, RateLimiterCounter::exceeded)
    }

    /// Window count over all non-exempt services.
    pub fn total_rps(&self) -> u64 {
        lock(&self.state).total.rps()
    }

    /// Window count of `service`, if it has a counter.
    pub fn service_rps(&self, service: &str) -> Option<u64> {
        lock(&self.state).services.get(service).map(RateLimiterCounter::rps)
    }

    /// Limit currently applied to `service`.
    pub fn service_limit(&self, service: &str) -> u64 {
        lock(&self.state).limit_for(service)
    }

    /// Limit across all services.
    pub fn total_limit(&self) -> u64 {
        lock(&self.state).total.limit()
    }

    /// Sets a service limit; `None` reverts it to the default. Counts are kept.
    pub fn update_service_limit(&self, service: &str, limit: Option<u64>) {
        let mut state = lock(&self.state);
        let limit = match limit {
            Some(limit) => {
                state.service_limits.insert(service.to_string(), limit);
                limit
            }
            None => {
                state.service_limits.remove(service);
                state.default_service_rps_limit
            }
        };
        if let Some(counter) = state.services.get_mut(service) {
            counter.set_limit(limit);
        }
        debug!(service, limit, "service rate limit updated");
    }

    /// Changes the total limit.
    pub fn update_total_limit(&self, limit: u64) {
        lock(&self.state).total.set_limit(limit);
        debug!(limit, "total rate limit updated");
    }

    /// Replaces all per-service limits. Services missing from `limits` revert to the
    /// default.
    pub fn update_rps_limit_for_all_services(&self, limits: &HashMap<String, u64>) {
        let removed: Vec<String> = {
            let state = lock(&self.state);
            state
                .service_limits
                .keys()
                .filter(|name| !limits.contains_key(*name))
                .cloned()
                .collect()
        };
        for name in removed {
            self.update_service_limit(&name, None);
        }
        for (name, limit) in limits {
            self.update_service_limit(name, Some(*limit));
        }
    }

    /// Replaces the set of services that are never counted.
    pub fn update_exempt_services<I, S>(&self, services: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.state).exempt = services.into_iter().map(Into::into).collect();
    }

    /// Drops the counter of `service`. Returns whether it existed.
    pub fn remove_service_counter(&self, service: &str) -> bool {
        lock(&self.state).services.remove(service).is_some()
    }

    /// Stops the ticker; later increments and refreshes are ignored.
    pub fn destroy(&self) {
        lock(&self.state).destroyed = true;
        if let Some(ticker) = lock(&self.ticker).take() {
            ticker.abort();
        }
        info!("rate limiter destroyed");
    }

    /// Whether `destroy` was called.
    pub fn is_destroyed(&self) -> bool {
        lock(&self.state).destroyed
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Some(ticker) = lock(&self.ticker).take() {
            ticker.abort();
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("RateLimiter")
            .field("total_rps", &state.total.rps())
            .field("total_limit", &state.total.limit())
            .field("services", &state.services.len())
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

/// Front door that counts every inbound call and answers `Busy` over the limits.
pub struct RateLimitedHandler {
    limiter: Arc<RateLimiter>,
    inner: Arc<dyn RequestHandler>,
    metrics: Arc<ChannelMetrics>,
}

impl RateLimitedHandler {
    /// Wraps `inner`; without a limiter calls pass straight through.
    pub fn new(
        limiter: Arc<RateLimiter>,
        inner: Arc<dyn RequestHandler>,
        metrics: Arc<ChannelMetrics>,
    ) -> Self {
        Self {
            limiter,
            inner,
            metrics,
        }
    }
}

#[async_trait]
impl RequestHandler for RateLimitedHandler {
    async fn handle_request(&self, call: InboundCall, response: ResponseBuilder) {
        let service = call.service.as_str();
        self.limiter.increment_total_counter(Some(service));
        self.limiter.increment_service_counter(service);

        let scope = if self.limiter.should_rate_limit_total_request(Some(service)) {
            Some("total")
        } else if self.limiter.should_rate_limit_service(service) {
            Some("service")
        } else {
            None
        };
        if let Some(scope) = scope {
            self.metrics.inc_rate_limited();
            debug!(service, scope, caller = %call.remote_name, "rate limited");
            response.send_error(
                ErrorCode::Busy,
                format!("{} is rate limited by the {} rps limit", service, scope),
            );
            return;
        }
        self.inner.handle_request(call, response).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limiter(buckets: usize, total: u64, service: u64) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            num_of_buckets: buckets,
            default_service_rps_limit: service,
            total_rps_limit: total,
            ..RateLimiterConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_counter_refresh_evicts_oldest_bucket() {
        let mut counter = RateLimiterCounter::new(3, 10);
        counter.increment();
        counter.increment();
        counter.refresh();
        counter.increment();
        assert_eq!(counter.rps(), 3);
        counter.refresh();
        counter.refresh();
        assert_eq!(counter.rps(), 1);
        counter.refresh();
        assert_eq!(counter.rps(), 0);
        assert_eq!(counter.buckets(), &[0, 0, 0]);
    }

    #[test]
    fn test_total_limit_exceeded_then_recovers() {
        let limiter = limiter(2, 3, 100);
        for _ in 0..5 {
            limiter.increment_total_counter(Some("svc"));
        }
        assert!(limiter.should_rate_limit_total_request(Some("svc")));
        assert_eq!(limiter.total_rps(), 5);
        limiter.refresh();
        limiter.refresh();
        assert!(!limiter.should_rate_limit_total_request(Some("svc")));
        assert_eq!(limiter.total_rps(), 0);
    }

    #[test]
    fn test_limit_is_strictly_greater() {
        let limiter = limiter(4, 1000, 2);
        limiter.increment_service_counter("svc");
        limiter.increment_service_counter("svc");
        assert!(!limiter.should_rate_limit_service("svc"));
        limiter.increment_service_counter("svc");
        assert!(limiter.should_rate_limit_service("svc"));
    }

    #[test]
    fn test_exempt_services_are_not_counted() {
        let limiter = limiter(2, 0, 0);
        limiter.update_exempt_services(["health"]);
        limiter.increment_total_counter(Some("health"));
        limiter.increment_service_counter("health");
        assert_eq!(limiter.total_rps(), 0);
        assert_eq!(limiter.service_rps("health"), None);
        assert!(!limiter.should_rate_limit_service("health"));
        assert!(!limiter.should_rate_limit_total_request(Some("health")));

        limiter.increment_total_counter(None);
        assert!(limiter.should_rate_limit_total_request(None));
    }

    #[test]
    fn test_unknown_service_is_not_limited() {
        let limiter = limiter(2, 10, 0);
        assert!(!limiter.should_rate_limit_service("never-seen"));
    }

    #[test]
    fn test_limit_updates_keep_counts() {
        let limiter = limiter(4, 10, 10);
        for _ in 0..3 {
            limiter.increment_service_counter("svc");
        }
        limiter.update_service_limit("svc", Some(2));
        assert!(limiter.should_rate_limit_service("svc"));
        assert_eq!(limiter.service_rps("svc"), Some(3));

        limiter.update_service_limit("svc", None);
        assert_eq!(limiter.service_limit("svc"), 10);
        assert!(!limiter.should_rate_limit_service("svc"));

        limiter.update_total_limit(2);
        assert_eq!(limiter.total_limit(), 2);
    }

    #[test]
    fn test_update_all_services_reverts_missing_to_default() {
        let limiter = limiter(4, 10, 7);
        limiter.update_service_limit("a", Some(1));
        limiter.update_service_limit("b", Some(2));
        let mut limits = HashMap::new();
        limits.insert("b".to_string(), 5);
        limits.insert("c".to_string(), 9);
        limiter.update_rps_limit_for_all_services(&limits);
        assert_eq!(limiter.service_limit("a"), 7);
        assert_eq!(limiter.service_limit("b"), 5);
        assert_eq!(limiter.service_limit("c"), 9);
    }

    #[test]
    fn test_remove_service_counter() {
        let limiter = limiter(2, 10, 10);
        limiter.increment_service_counter("svc");
        assert!(limiter.remove_service_counter("svc"));
        assert!(!limiter.remove_service_counter("svc"));
        assert_eq!(limiter.service_rps("svc"), None);
    }

    #[test]
    fn test_destroy_ignores_further_updates() {
        let limiter = limiter(2, 10, 10);
        limiter.increment_total_counter(None);
        limiter.destroy();
        assert!(limiter.is_destroyed());
        limiter.increment_total_counter(None);
        limiter.refresh();
        limiter.refresh();
        assert_eq!(limiter.total_rps(), 1);
    }

    #[test]
    fn test_invalid_bucket_count() {
        let config = RateLimiterConfig {
            num_of_buckets: 0,
            ..RateLimiterConfig::default()
        };
        assert!(RateLimiter::new(config).is_err());
        let config = RateLimiterConfig {
            num_of_buckets: 1001,
            ..RateLimiterConfig::default()
        };
        assert!(RateLimiter::new(config).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_rotates_window() {
        let limiter = Arc::new(limiter(4, 1, 100));
        assert_eq!(limiter.refresh_delay(), Duration::from_millis(250));
        limiter.start();
        limiter.increment_total_counter(None);
        limiter.increment_total_counter(None);
        assert!(limiter.should_rate_limit_total_request(None));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(limiter.total_rps(), 0);
        assert!(!limiter.should_rate_limit_total_request(None));

        limiter.destroy();
        limiter.increment_total_counter(None);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(limiter.total_rps(), 0);
    }

    mod proptest_tests {
        use super::*;

        #[derive(Debug, Clone)]
        enum Op {
            Increment,
            Refresh,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![Just(Op::Increment), Just(Op::Refresh)]
        }

        proptest! {
            #[test]
            fn test_rps_equals_bucket_sum(
                buckets in 1usize..8,
                ops in proptest::collection::vec(op(), 0..200),
            ) {
                let mut counter = RateLimiterCounter::new(buckets, 5);
                for op in ops {
                    match op {
                        Op::Increment => counter.increment(),
                        Op::Refresh => counter.refresh(),
                    }
                    prop_assert_eq!(counter.rps(), counter.buckets().iter().sum::<u64>());
                }
            }

            #[test]
            fn test_full_rotation_clears_window(buckets in 1usize..16, hits in 0u64..50) {
                let mut counter = RateLimiterCounter::new(buckets, 0);
                for _ in 0..hits {
                    counter.increment();
                }
                for _ in 0..buckets {
                    counter.refresh();
                }
                prop_assert_eq!(counter.rps(), 0);
                prop_assert!(!counter.exceeded());
            }
        }
    }
}
