//! Endpoint failover circuit breaker.
//!
//! ```text
//!   PRIMARY (round-robin)  ── N consecutive failures ──▶  BACKUP (round-robin)
//!          ▲                                                     │
//!          └────── cooldown elapsed since last failure ──────────┘
//!                  (reset to primary index 0)
//! ```
//!
//! Every failure advances the rotation index of the active list, so repeated
//! failures walk across hosts instead of hammering one. Healthy traffic
//! stays pinned to the current host: the index never advances on success,
//! so load is not spread across the primary list while it works. A success
//! only clears the consecutive failure counter; leaving the backup list
//! requires the cooldown to pass without failures.

use crate::RegionEndpoints;
use harvest_config_and_utils::SharedClock;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

/// Consecutive failures that switch to the backup list.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Quiet period after which the breaker returns to the primary list.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

/// Snapshot of the breaker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CircuitState {
    pub consecutive_failures: u32,
    pub using_backup_domains: bool,
    pub primary_index: usize,
    pub backup_index: usize,
    /// Milliseconds since the Unix epoch of the most recent failure.
    pub last_failure_at: Option<i64>,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.using_backup_domains {
            write!(
                f,
                "backup[{}] ({} consecutive failures)",
                self.backup_index, self.consecutive_failures
            )
        } else {
            write!(
                f,
                "primary[{}] ({} consecutive failures)",
                self.primary_index, self.consecutive_failures
            )
        }
    }
}

/// Thread-safe breaker shared by all sends of one client.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<CircuitState>,
    failure_threshold: u32,
    cooldown: Duration,
    clock: SharedClock,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(CircuitState::default()),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            clock,
        }
    }

    /// Return to primary index 0 if the cooldown has passed since the last failure.
    ///
    /// Returns true when a reset happened.
    pub fn reset_if_cooled_down(&self) -> bool {
        let mut state = self.state.lock();
        let Some(last_failure) = state.last_failure_at else {
            return false;
        };

        let elapsed = self.clock.now_millis().saturating_sub(last_failure);
        if elapsed <= self.cooldown.as_millis() as i64 {
            return false;
        }

        let was_on_backup = state.using_backup_domains;
        *state = CircuitState::default();
        if was_on_backup {
            info!(elapsed_ms = elapsed, "Circuit cooled down, back to primary endpoints");
        }
        true
    }

    /// Base URL to use for the next attempt.
    ///
    /// Falls back to the primary list when no backup hosts are configured.
    pub fn select<'a>(&self, endpoints: &'a RegionEndpoints) -> Option<&'a str> {
        let state = self.state.lock();
        let (list, index) = if state.using_backup_domains && !endpoints.backup.is_empty() {
            (&endpoints.backup, state.backup_index)
        } else {
            (&endpoints.primary, state.primary_index)
        };

        if list.is_empty() {
            return None;
        }
        Some(list[index % list.len()].as_str())
    }

    /// Record a failed attempt against the endpoint chosen by [`select`](Self::select).
    pub fn record_failure(&self, endpoints: &RegionEndpoints) {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure_at = Some(self.clock.now_millis());

        if state.consecutive_failures >= self.failure_threshold {
            if !state.using_backup_domains {
                state.using_backup_domains = true;
                state.backup_index = 0;
                warn!(
                    failures = state.consecutive_failures,
                    "Switching to backup endpoints"
                );
            } else if !endpoints.backup.is_empty() {
                state.backup_index = (state.backup_index + 1) % endpoints.backup.len();
            }
        } else if !state.using_backup_domains && !endpoints.primary.is_empty() {
            state.primary_index = (state.primary_index + 1) % endpoints.primary.len();
        }
    }

    /// Record a delivered request. Does not move the rotation index.
    pub fn record_success(&self) {
        self.state.lock().consecutive_failures = 0;
    }

    pub fn snapshot(&self) -> CircuitState {
        self.state.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_config_and_utils::ManualClock;
    use std::sync::Arc;

    fn endpoints() -> RegionEndpoints {
        RegionEndpoints::new(
            vec!["p0".into(), "p1".into(), "p2".into()],
            vec!["b0".into(), "b1".into()],
        )
    }

    fn breaker(clock: &ManualClock) -> CircuitBreaker {
        CircuitBreaker::new(
            DEFAULT_FAILURE_THRESHOLD,
            DEFAULT_COOLDOWN,
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn test_failures_rotate_primary_then_switch_to_backup() {
        let clock = ManualClock::default();
        let breaker = breaker(&clock);
        let eps = endpoints();

        assert_eq!(breaker.select(&eps), Some("p0"));
        breaker.record_failure(&eps);
        assert_eq!(breaker.select(&eps), Some("p1"));
        breaker.record_failure(&eps);
        assert_eq!(breaker.select(&eps), Some("p2"));
        breaker.record_failure(&eps);

        let state = breaker.snapshot();
        assert!(state.using_backup_domains);
        assert_eq!(breaker.select(&eps), Some("b0"));

        breaker.record_failure(&eps);
        assert_eq!(breaker.select(&eps), Some("b1"));
        breaker.record_failure(&eps);
        assert_eq!(breaker.select(&eps), Some("b0"));
    }

    #[test]
    fn test_success_keeps_current_primary() {
        let clock = ManualClock::default();
        let breaker = breaker(&clock);
        let eps = endpoints();

        breaker.record_failure(&eps);
        assert_eq!(breaker.select(&eps), Some("p1"));
        for _ in 0..5 {
            breaker.record_success();
            assert_eq!(breaker.select(&eps), Some("p1"));
        }
        assert_eq!(breaker.snapshot().primary_index, 1);
    }

    #[test]
    fn test_success_clears_counter_but_stays_on_backup() {
        let clock = ManualClock::default();
        let breaker = breaker(&clock);
        let eps = endpoints();

        for _ in 0..3 {
            breaker.record_failure(&eps);
        }
        breaker.record_success();

        let state = breaker.snapshot();
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.using_backup_domains);
    }

    #[test]
    fn test_reset_only_after_cooldown() {
        let clock = ManualClock::default();
        let breaker = breaker(&clock);
        let eps = endpoints();

        for _ in 0..3 {
            breaker.record_failure(&eps);
        }

        clock.advance(DEFAULT_COOLDOWN);
        assert!(!breaker.reset_if_cooled_down());
        assert!(breaker.snapshot().using_backup_domains);

        clock.advance(Duration::from_millis(1));
        assert!(breaker.reset_if_cooled_down());

        let state = breaker.snapshot();
        assert!(!state.using_backup_domains);
        assert_eq!(state.primary_index, 0);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(breaker.select(&eps), Some("p0"));
    }

    #[test]
    fn test_no_reset_without_failures() {
        let clock = ManualClock::default();
        let breaker = breaker(&clock);
        clock.advance(Duration::from_secs(3600));
        assert!(!breaker.reset_if_cooled_down());
    }

    #[test]
    fn test_select_without_backup_hosts_uses_primary() {
        let clock = ManualClock::default();
        let breaker = breaker(&clock);
        let eps = RegionEndpoints::new(vec!["only".into()], Vec::new());

        for _ in 0..5 {
            breaker.record_failure(&eps);
        }
        assert_eq!(breaker.select(&eps), Some("only"));
        assert!(breaker.select(&RegionEndpoints::new(Vec::new(), Vec::new())).is_none());
    }

    #[test]
    fn test_state_display() {
        let state = CircuitState {
            consecutive_failures: 2,
            primary_index: 1,
            ..Default::default()
        };
        assert_eq!(state.to_string(), "primary[1] (2 consecutive failures)");
    }
}
