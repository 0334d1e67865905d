//! Adaptive pause between supervisor cycles

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::dispatcher::CycleSummary;

use super::config::SupervisorConfig;

/// Running history the pacing policy works from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorRunRecord {
    pub cycles: u64,
    pub consecutive_failures: u32,
    pub current_pause: Duration,
    pub last_summary: Option<CycleSummary>,
}

/// How long to wait before the next cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    pub initial: Duration,
    pub min: Duration,
    pub max: Duration,
    pub failure_threshold: u32,
}

impl From<&SupervisorConfig> for PacingPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        let min = Duration::from_millis(config.min_pause_ms);
        let max = Duration::from_millis(config.max_pause_ms).max(min);
        Self {
            initial: Duration::from_millis(config.initial_pause_ms).clamp(min, max),
            min,
            max,
            failure_threshold: config.failure_threshold,
        }
    }
}

impl PacingPolicy {
    /// A record for a supervisor that has not run yet
    pub fn start(&self) -> SupervisorRunRecord {
        SupervisorRunRecord {
            current_pause: self.initial,
            ..Default::default()
        }
    }

    /// Fold a finished cycle into `record` and return the next pause
    ///
    /// Progress halves the pause, an idle cycle doubles it, and failing
    /// cycles double it only once more than `failure_threshold` happen in a
    /// row. Anything else leaves it alone.
    pub fn next(&self, record: &mut SupervisorRunRecord, summary: &CycleSummary) -> Duration {
        let pause = record.current_pause;
        let next = if summary.made_progress() {
            record.consecutive_failures = 0;
            (pause / 2).max(self.min)
        } else if summary.is_failure() {
            record.consecutive_failures += 1;
            if record.consecutive_failures > self.failure_threshold {
                self.widen(pause)
            } else {
                pause
            }
        } else if summary.is_idle() {
            self.widen(pause)
        } else {
            pause
        };

        record.cycles += 1;
        record.current_pause = next;
        record.last_summary = Some(*summary);
        debug!(
            ?pause,
            ?next,
            consecutive_failures = record.consecutive_failures,
            "PacingPolicy::next: computed"
        );
        next
    }

    fn widen(&self, pause: Duration) -> Duration {
        pause.saturating_mul(2).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PacingPolicy {
        PacingPolicy {
            initial: Duration::from_secs(40),
            min: Duration::from_secs(10),
            max: Duration::from_secs(100),
            failure_threshold: 2,
        }
    }

    fn progress() -> CycleSummary {
        CycleSummary {
            dispatched: 1,
            succeeded: 1,
            ..Default::default()
        }
    }

    fn failure() -> CycleSummary {
        CycleSummary {
            dispatched: 1,
            failed: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_progress_halves_to_floor() {
        let policy = policy();
        let mut record = policy.start();
        assert_eq!(policy.next(&mut record, &progress()), Duration::from_secs(20));
        assert_eq!(policy.next(&mut record, &progress()), Duration::from_secs(10));
        assert_eq!(policy.next(&mut record, &progress()), Duration::from_secs(10));
        assert_eq!(record.cycles, 3);
    }

    #[test]
    fn test_idle_doubles_to_ceiling() {
        let policy = policy();
        let mut record = policy.start();
        let idle = CycleSummary::default();
        assert_eq!(policy.next(&mut record, &idle), Duration::from_secs(80));
        assert_eq!(policy.next(&mut record, &idle), Duration::from_secs(100));
    }

    #[test]
    fn test_failures_widen_past_threshold() {
        let policy = policy();
        let mut record = policy.start();
        assert_eq!(policy.next(&mut record, &failure()), Duration::from_secs(40));
        assert_eq!(policy.next(&mut record, &failure()), Duration::from_secs(40));
        assert_eq!(policy.next(&mut record, &failure()), Duration::from_secs(80));
        assert_eq!(record.consecutive_failures, 3);

        policy.next(&mut record, &progress());
        assert_eq!(record.consecutive_failures, 0);
    }

    #[test]
    fn test_mixed_cycle_keeps_pause() {
        let policy = policy();
        let mut record = policy.start();
        let retried = CycleSummary {
            dispatched: 2,
            retried: 2,
            ..Default::default()
        };
        assert_eq!(policy.next(&mut record, &retried), Duration::from_secs(40));
        assert_eq!(record.last_summary, Some(retried));
    }

    #[test]
    fn test_from_config_clamps_initial() {
        let config = SupervisorConfig {
            initial_pause_ms: 1,
            min_pause_ms: 500,
            max_pause_ms: 1_000,
            failure_threshold: 1,
        };
        let policy = PacingPolicy::from(&config);
        assert_eq!(policy.initial, Duration::from_millis(500));
    }
}
