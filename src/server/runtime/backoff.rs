//! Retry pacing for failed `accept()` calls.

use std::time::Duration;

const MIN_DELAY: Duration = Duration::from_millis(1);

/// Exponential retry bounds for the accept loop.
///
/// The first retry waits `initial_delay`; each further consecutive failure
/// doubles the wait up to `max_delay`. A successful accept starts over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Wait after the first failure in a run.
    pub initial_delay: Duration,
    /// Ceiling for the doubled wait.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self { Self::new(Duration::from_millis(10), Duration::from_secs(1)) }
}

impl BackoffConfig {
    /// Build bounds from two delays given in either order.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use muxframe::BackoffConfig;
    ///
    /// let cfg = BackoffConfig::new(Duration::from_millis(80), Duration::ZERO);
    /// assert_eq!(cfg.initial_delay, Duration::from_millis(1));
    /// assert_eq!(cfg.max_delay, Duration::from_millis(80));
    /// ```
    #[must_use]
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        let low = initial_delay.min(max_delay).max(MIN_DELAY);
        let high = initial_delay.max(max_delay).max(MIN_DELAY);
        Self {
            initial_delay: low,
            max_delay: high,
        }
    }

    /// Start pacing a run of failures.
    ///
    /// Public fields may have been set out of order, so the bounds are
    /// rebuilt through [`BackoffConfig::new`] first.
    pub(super) fn pacer(self) -> AcceptBackoff {
        let bounds = Self::new(self.initial_delay, self.max_delay);
        AcceptBackoff {
            bounds,
            next: bounds.initial_delay,
        }
    }
}

/// Delay state for one accept loop.
#[derive(Debug)]
pub(super) struct AcceptBackoff {
    bounds: BackoffConfig,
    next: Duration,
}

impl AcceptBackoff {
    /// Delay to wait after the current failure; advances the schedule.
    pub(super) fn failed(&mut self) -> Duration {
        let delay = self.next;
        self.next = delay.saturating_mul(2).min(self.bounds.max_delay);
        delay
    }

    /// Forget earlier failures after a successful accept.
    pub(super) fn succeeded(&mut self) { self.next = self.bounds.initial_delay; }
}
