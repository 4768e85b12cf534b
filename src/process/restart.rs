use crate::config::ProcessSpec;
use std::time::{Duration, Instant};

/// Upper bound for exponential restart backoff
const MAX_BACKOFF: Duration = Duration::from_secs(15);

/// What to do after an unexpected exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart after the given delay
    Restart { delay: Duration },
    /// Crash loop detected; stop trying
    GiveUp { failures: usize },
    /// Automatic restart is off
    Disabled,
}

/// Restart policy configuration
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Whether automatic restart is enabled
    pub enabled: bool,
    /// Failures tolerated within `window` before giving up
    pub max_restarts: usize,
    /// Sliding window for counting failures
    pub window: Duration,
    /// Initial delay before a restart
    pub initial_delay: Duration,
    /// Backoff strategy to use
    pub backoff_strategy: BackoffStrategy,
}

impl RestartPolicy {
    /// Build the policy declared by an app
    pub fn from_spec(spec: &ProcessSpec) -> Self {
        let (initial_delay, backoff_strategy) = match spec.exp_backoff_restart_delay {
            Some(base) => (
                base,
                BackoffStrategy::Exponential {
                    max_delay: MAX_BACKOFF,
                },
            ),
            None => (spec.restart_delay, BackoffStrategy::Fixed),
        };

        Self {
            enabled: spec.autorestart,
            max_restarts: spec.max_restarts,
            window: spec.restart_window,
            initial_delay,
            backoff_strategy,
        }
    }

    /// Decide how to react to the failure most recently recorded in `tracker`
    pub fn decide(&self, tracker: &RestartTracker, now: Instant) -> RestartDecision {
        if !self.enabled {
            return RestartDecision::Disabled;
        }

        let failures = tracker.count_recent(self.window, now);
        if failures >= self.max_restarts {
            return RestartDecision::GiveUp { failures };
        }

        let attempt = failures.saturating_sub(1);
        RestartDecision::Restart {
            delay: self
                .backoff_strategy
                .calculate_delay(self.initial_delay, attempt),
        }
    }
}

/// Backoff strategy for restart delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between restarts
    Fixed,
    /// Exponential backoff with maximum delay
    Exponential { max_delay: Duration },
}

impl BackoffStrategy {
    /// Calculate the delay for a given restart attempt
    pub fn calculate_delay(&self, initial: Duration, attempt: usize) -> Duration {
        match self {
            BackoffStrategy::Fixed => initial,
            BackoffStrategy::Exponential { max_delay } => {
                // delay = initial * 2^attempt
                let factor = 2_u32.saturating_pow(attempt.min(31) as u32);
                initial.saturating_mul(factor).min(*max_delay)
            }
        }
    }
}

/// Tracks unexpected exits of one instance
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    failures: Vec<Instant>,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure at `now`
    pub fn record_failure(&mut self, now: Instant) {
        self.failures.push(now);
    }

    /// Count failures within `window` before `now`
    pub fn count_recent(&self, window: Duration, now: Instant) -> usize {
        self.failures
            .iter()
            .filter(|&&at| now.saturating_duration_since(at) < window)
            .count()
    }

    /// Drop failures that fell out of `window`
    pub fn prune(&mut self, window: Duration, now: Instant) {
        self.failures
            .retain(|&at| now.saturating_duration_since(at) < window);
    }

    /// Forget all failures (manual restart)
    pub fn clear(&mut self) {
        self.failures.clear();
    }

    pub fn total(&self) -> usize {
        self.failures.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_restarts: usize, window_secs: u64) -> RestartPolicy {
        RestartPolicy {
            enabled: true,
            max_restarts,
            window: Duration::from_secs(window_secs),
            initial_delay: Duration::ZERO,
            backoff_strategy: BackoffStrategy::Fixed,
        }
    }

    #[test]
    fn test_disabled_policy() {
        let mut p = policy(3, 60);
        p.enabled = false;
        let mut tracker = RestartTracker::new();
        tracker.record_failure(Instant::now());
        assert_eq!(p.decide(&tracker, Instant::now()), RestartDecision::Disabled);
    }

    #[test]
    fn test_gives_up_on_nth_failure() {
        let p = policy(3, 60);
        let mut tracker = RestartTracker::new();
        let now = Instant::now();

        tracker.record_failure(now);
        assert!(matches!(p.decide(&tracker, now), RestartDecision::Restart { .. }));

        tracker.record_failure(now);
        assert!(matches!(p.decide(&tracker, now), RestartDecision::Restart { .. }));

        tracker.record_failure(now);
        assert_eq!(
            p.decide(&tracker, now),
            RestartDecision::GiveUp { failures: 3 }
        );
    }

    #[test]
    fn test_old_failures_leave_window() {
        let p = policy(2, 10);
        let mut tracker = RestartTracker::new();
        let start = Instant::now();

        tracker.record_failure(start);
        let later = start + Duration::from_secs(11);
        tracker.record_failure(later);

        assert_eq!(tracker.count_recent(p.window, later), 1);
        assert!(matches!(p.decide(&tracker, later), RestartDecision::Restart { .. }));

        tracker.prune(p.window, later);
        assert_eq!(tracker.total(), 1);
    }

    #[test]
    fn test_backoff_fixed() {
        let strategy = BackoffStrategy::Fixed;
        let d = Duration::from_millis(500);
        assert_eq!(strategy.calculate_delay(d, 0), d);
        assert_eq!(strategy.calculate_delay(d, 10), d);
    }

    #[test]
    fn test_backoff_exponential() {
        let strategy = BackoffStrategy::Exponential {
            max_delay: Duration::from_secs(15),
        };
        let base = Duration::from_millis(100);

        assert_eq!(strategy.calculate_delay(base, 0), Duration::from_millis(100));
        assert_eq!(strategy.calculate_delay(base, 1), Duration::from_millis(200));
        assert_eq!(strategy.calculate_delay(base, 3), Duration::from_millis(800));
        // 100ms * 2^8 = 25.6s, capped
        assert_eq!(strategy.calculate_delay(base, 8), Duration::from_secs(15));
        assert_eq!(strategy.calculate_delay(base, 200), Duration::from_secs(15));
    }

    #[test]
    fn test_decide_uses_backoff() {
        let mut p = policy(10, 60);
        p.initial_delay = Duration::from_millis(100);
        p.backoff_strategy = BackoffStrategy::Exponential {
            max_delay: MAX_BACKOFF,
        };
        let mut tracker = RestartTracker::new();
        let now = Instant::now();

        tracker.record_failure(now);
        assert_eq!(
            p.decide(&tracker, now),
            RestartDecision::Restart {
                delay: Duration::from_millis(100)
            }
        );
        tracker.record_failure(now);
        assert_eq!(
            p.decide(&tracker, now),
            RestartDecision::Restart {
                delay: Duration::from_millis(200)
            }
        );
    }

    #[test]
    fn test_clear() {
        let mut tracker = RestartTracker::new();
        tracker.record_failure(Instant::now());
        tracker.record_failure(Instant::now());
        assert_eq!(tracker.total(), 2);
        tracker.clear();
        assert_eq!(tracker.total(), 0);
    }
}
