//! Peer health tracking and scoring.
//!
//! Each peer carries a two-state machine. A healthy peer counts outcomes over fixed
//! periods and turns unhealthy when a period closes with too many failures. An
//! unhealthy peer is offered at most one attempt per period and recovers after enough
//! successes. Scoring folds the health state, connection quality and pending load into
//! a single number used to choose between peers.

use std::sync::Mutex;

use tokio::time::Instant;
use tracing::info;

use crate::config::HealthConfig;
use crate::error::ErrorCode;
use crate::lock;

/// Coarse health of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Peer is serving normally.
    Healthy,
    /// Peer failed too often and is on probation.
    Unhealthy,
}

/// Quality of a peer's best usable connection, worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Connectivity {
    /// No connection at all.
    Unconnected,
    /// Only connections the peer opened to us.
    InboundOnly,
    /// An outbound connection still doing its handshake.
    FreshOutbound,
    /// An identified outbound connection.
    IdentifiedOutbound,
}

impl Connectivity {
    /// `(base, width)` of the tier's score range.
    fn band(self) -> (f64, f64) {
        match self {
            Connectivity::Unconnected => (0.1, 0.1),
            Connectivity::InboundOnly => (0.2, 0.1),
            Connectivity::FreshOutbound => (0.3, 0.1),
            Connectivity::IdentifiedOutbound => (0.4, 0.6),
        }
    }

    /// Score within this tier for a peer with `pending` outbound operations.
    ///
    /// `jitter` in `[0, 1)` places the score inside the band
    /// `[1/(2+p), 1/(1+p))` of the tier width, so more pending work always scores
    /// strictly lower while equally loaded peers are shuffled.
    pub fn score(self, pending: usize, jitter: f64) -> f64 {
        let (base, width) = self.band();
        let p = pending as f64;
        let upper = 1.0 / (1.0 + p);
        let lower = 1.0 / (2.0 + p);
        let jitter = jitter.clamp(0.0, 1.0);
        let fraction = (lower + jitter * (upper - lower)).min(upper);
        base + width * fraction
    }

    /// Whether a peer scored at this tier should get an outbound connection opened.
    fn wants_outbound(self) -> bool {
        matches!(self, Connectivity::Unconnected | Connectivity::InboundOnly)
    }
}

/// Internal state of the health machine.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthState {
    /// Counting outcomes over the current period.
    Healthy {
        /// Start of the current period.
        period_start: Instant,
        /// Responses seen this period.
        ok_count: u64,
        /// Symptom errors seen this period.
        not_ok_count: u64,
    },
    /// On probation.
    Unhealthy {
        /// Start of the current period.
        period_start: Instant,
        /// Consecutive responses since the last symptom error.
        success_count: u64,
        /// Whether this period's single attempt has been used.
        tried_this_period: bool,
    },
}

/// Outcome of scoring a peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    /// Score in `[0, 1)`; 0 means do not choose this peer.
    pub score: f64,
    /// The caller should open an outbound connection in the background.
    pub wants_connection: bool,
}

/// Health state machine of one peer.
#[derive(Debug)]
pub struct PeerHealth {
    config: HealthConfig,
    state: Mutex<HealthState>,
}

impl PeerHealth {
    /// Creates a healthy machine whose first period starts at `now`.
    pub fn new(config: HealthConfig, now: Instant) -> Self {
        Self {
            config,
            state: Mutex::new(HealthState::Healthy {
                period_start: now,
                ok_count: 0,
                not_ok_count: 0,
            }),
        }
    }

    /// Current coarse status.
    pub fn status(&self) -> HealthStatus {
        match *lock(&self.state) {
            HealthState::Healthy { .. } => HealthStatus::Healthy,
            HealthState::Unhealthy { .. } => HealthStatus::Unhealthy,
        }
    }

    /// Copy of the full state, counters included.
    pub fn snapshot(&self) -> HealthState {
        lock(&self.state).clone()
    }

    /// Scores the peer, advancing the period if it has ended.
    pub fn should_request(
        &self,
        now: Instant,
        connectivity: Connectivity,
        pending: usize,
        jitter: f64,
    ) -> Verdict {
        let period = self.config.period();
        let mut state = lock(&self.state);
        match &mut *state {
            HealthState::Healthy {
                period_start,
                ok_count,
                not_ok_count,
            } => {
                if now.saturating_duration_since(*period_start) >= period {
                    let total = *ok_count + *not_ok_count;
                    let error_rate = if total == 0 {
                        0.0
                    } else {
                        *not_ok_count as f64 / total as f64
                    };
                    if error_rate > self.config.max_error_rate && total > self.config.min_requests {
                        info!(
                            error_rate,
                            failures = *not_ok_count,
                            total,
                            "peer became unhealthy"
                        );
                        *state = HealthState::Unhealthy {
                            period_start: now,
                            success_count: 0,
                            tried_this_period: true,
                        };
                        return Verdict {
                            score: 0.0,
                            wants_connection: false,
                        };
                    }
                    *period_start = now;
                    *ok_count = 0;
                    *not_ok_count = 0;
                }
                Verdict {
                    score: connectivity.score(pending, jitter),
                    wants_connection: connectivity == Connectivity::InboundOnly,
                }
            }
            HealthState::Unhealthy {
                period_start,
                tried_this_period,
                ..
            } => {
                if now.saturating_duration_since(*period_start) >= period {
                    *period_start = now;
                    *tried_this_period = false;
                }
                if *tried_this_period {
                    return Verdict {
                        score: 0.0,
                        wants_connection: false,
                    };
                }
                Verdict {
                    score: connectivity.score(pending, jitter),
                    wants_connection: connectivity.wants_outbound(),
                }
            }
        }
    }

    /// Records that an attempt was dispatched to the peer.
    pub fn on_request(&self) {
        if let HealthState::Unhealthy {
            tried_this_period, ..
        } = &mut *lock(&self.state)
        {
            *tried_this_period = true;
        }
    }

    /// Records a response, ok or application not-ok.
    pub fn on_response(&self, now: Instant) {
        let mut state = lock(&self.state);
        match &mut *state {
            HealthState::Healthy { ok_count, .. } => *ok_count += 1,
            HealthState::Unhealthy { success_count, .. } => {
                *success_count += 1;
                if *success_count > self.config.probation {
                    info!(successes = *success_count, "peer recovered");
                    *state = HealthState::Healthy {
                        period_start: now,
                        ok_count: 0,
                        not_ok_count: 0,
                    };
                }
            }
        }
    }

    /// Records a failed attempt with its classification.
    ///
    /// Only health symptoms move the counters; client-side errors such as
    /// `BadRequest` or `Cancelled` leave the state untouched.
    pub fn on_error(&self, code: Option<ErrorCode>) {
        let symptom = code.map_or(false, ErrorCode::is_health_symptom);
        match &mut *lock(&self.state) {
            HealthState::Healthy { not_ok_count, .. } => {
                if symptom {
                    *not_ok_count += 1;
                }
            }
            HealthState::Unhealthy { success_count, .. } => {
                if symptom {
                    *success_count = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> HealthConfig {
        HealthConfig::default()
    }

    fn make_unhealthy(health: &PeerHealth, start: Instant) -> Instant {
        for _ in 0..3 {
            health.on_error(Some(ErrorCode::Timeout));
        }
        for _ in 0..2 {
            health.on_response(start);
        }
        let end = start + Duration::from_millis(1000);
        let verdict = health.should_request(end, Connectivity::IdentifiedOutbound, 0, 0.5);
        assert_eq!(verdict.score, 0.0);
        end
    }

    #[test]
    fn test_starts_healthy() {
        let now = Instant::now();
        let health = PeerHealth::new(config(), now);
        assert_eq!(health.status(), HealthStatus::Healthy);
        let verdict = health.should_request(now, Connectivity::IdentifiedOutbound, 0, 0.0);
        assert!(verdict.score >= 0.4 && verdict.score < 1.0);
        assert!(!verdict.wants_connection);
    }

    #[test]
    fn test_failure_rate_turns_unhealthy_at_period_end() {
        let start = Instant::now();
        let health = PeerHealth::new(config(), start);
        for _ in 0..3 {
            health.on_error(Some(ErrorCode::Timeout));
        }
        health.on_response(start);
        health.on_response(start);

        let mid = start + Duration::from_millis(500);
        assert!(health.should_request(mid, Connectivity::IdentifiedOutbound, 0, 0.5).score > 0.0);
        assert_eq!(health.status(), HealthStatus::Healthy);

        let end = start + Duration::from_millis(1000);
        assert_eq!(
            health.should_request(end, Connectivity::IdentifiedOutbound, 0, 0.5).score,
            0.0
        );
        assert_eq!(health.status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_low_failure_rate_resets_counters() {
        let start = Instant::now();
        let health = PeerHealth::new(config(), start);
        health.on_error(Some(ErrorCode::Busy));
        health.on_response(start);
        health.on_response(start);

        let end = start + Duration::from_millis(1000);
        assert!(health.should_request(end, Connectivity::IdentifiedOutbound, 0, 0.5).score > 0.0);
        assert_eq!(
            health.snapshot(),
            HealthState::Healthy {
                period_start: end,
                ok_count: 0,
                not_ok_count: 0
            }
        );
    }

    #[test]
    fn test_non_symptom_errors_do_not_count() {
        let start = Instant::now();
        let health = PeerHealth::new(config(), start);
        for _ in 0..10 {
            health.on_error(Some(ErrorCode::BadRequest));
            health.on_error(Some(ErrorCode::Cancelled));
            health.on_error(None);
        }
        let end = start + Duration::from_millis(1000);
        assert!(health.should_request(end, Connectivity::IdentifiedOutbound, 0, 0.5).score > 0.0);
        assert_eq!(health.status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_client_errors_do_not_dilute_error_rate() {
        let start = Instant::now();
        let health = PeerHealth::new(config(), start);
        for _ in 0..3 {
            health.on_error(Some(ErrorCode::Timeout));
        }
        health.on_response(start);
        health.on_response(start);
        for _ in 0..10 {
            health.on_error(Some(ErrorCode::BadRequest));
        }
        assert_eq!(
            health.snapshot(),
            HealthState::Healthy {
                period_start: start,
                ok_count: 2,
                not_ok_count: 3
            }
        );

        let end = start + Duration::from_millis(1000);
        assert_eq!(
            health.should_request(end, Connectivity::IdentifiedOutbound, 0, 0.5).score,
            0.0
        );
        assert_eq!(health.status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_min_requests_guards_small_samples() {
        let start = Instant::now();
        let health = PeerHealth::new(
            HealthConfig {
                min_requests: 5,
                ..config()
            },
            start,
        );
        health.on_error(Some(ErrorCode::Timeout));
        let end = start + Duration::from_millis(1000);
        assert!(health.should_request(end, Connectivity::IdentifiedOutbound, 0, 0.5).score > 0.0);
        assert_eq!(health.status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_unhealthy_allows_one_attempt_per_period() {
        let start = Instant::now();
        let health = PeerHealth::new(config(), start);
        let entered = make_unhealthy(&health, start);

        // freshly unhealthy: gate closed for the rest of this period
        assert_eq!(
            health.should_request(entered, Connectivity::IdentifiedOutbound, 0, 0.5).score,
            0.0
        );

        let next = entered + Duration::from_millis(1000);
        let verdict = health.should_request(next, Connectivity::IdentifiedOutbound, 0, 0.5);
        assert!(verdict.score > 0.0);
        health.on_request();
        assert_eq!(
            health.should_request(next, Connectivity::IdentifiedOutbound, 0, 0.5).score,
            0.0
        );
    }

    #[test]
    fn test_probation_recovery() {
        let start = Instant::now();
        let health = PeerHealth::new(config(), start);
        let entered = make_unhealthy(&health, start);

        for _ in 0..5 {
            health.on_response(entered);
        }
        assert_eq!(health.status(), HealthStatus::Unhealthy);
        health.on_response(entered);
        assert_eq!(health.status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_symptom_resets_probation() {
        let start = Instant::now();
        let health = PeerHealth::new(config(), start);
        let entered = make_unhealthy(&health, start);

        for _ in 0..5 {
            health.on_response(entered);
        }
        health.on_error(Some(ErrorCode::NetworkError));
        health.on_error(Some(ErrorCode::BadRequest));
        for _ in 0..5 {
            health.on_response(entered);
        }
        assert_eq!(health.status(), HealthStatus::Unhealthy);
        health.on_response(entered);
        assert_eq!(health.status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_unhealthy_low_tier_wants_connection() {
        let start = Instant::now();
        let health = PeerHealth::new(config(), start);
        let entered = make_unhealthy(&health, start);
        let next = entered + Duration::from_millis(1000);
        let verdict = health.should_request(next, Connectivity::Unconnected, 0, 0.5);
        assert!(verdict.wants_connection);
        assert!(verdict.score >= 0.1 && verdict.score < 0.2);
    }

    #[test]
    fn test_tiers_are_ordered() {
        let tiers = [
            Connectivity::Unconnected,
            Connectivity::InboundOnly,
            Connectivity::FreshOutbound,
            Connectivity::IdentifiedOutbound,
        ];
        for pair in tiers.windows(2) {
            let worst_of_better = pair[1].score(1000, 0.0);
            let best_of_worse = pair[0].score(0, 0.999_999);
            assert!(worst_of_better > best_of_worse);
        }
    }
}
