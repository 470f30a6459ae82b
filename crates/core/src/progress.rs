//! Rate-limited progress reporting for long batch jobs.

use crate::constants::DEFAULT_PROGRESS_INTERVAL_SECS;
use std::time::{Duration, Instant};

/// Decides when a batch loop should emit a progress message.
///
/// The reporter is a plain value owned by the loop that uses it; the first report is due one
/// interval after construction.
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    interval: Duration,
    last_report: Instant,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS))
    }
}

impl ProgressReporter {
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(interval, Instant::now())
    }

    pub fn starting_at(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            last_report: start,
        }
    }

    /// `true` (and the clock resets) if at least one interval has passed since the last report.
    pub fn due(&mut self) -> bool {
        self.due_at(Instant::now())
    }

    pub fn due_at(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_report) >= self.interval {
            self.last_report = now;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_at_most_once_per_interval() {
        let start = Instant::now();
        let mut reporter = ProgressReporter::starting_at(Duration::from_secs(30), start);

        assert!(!reporter.due_at(start + Duration::from_secs(10)));
        assert!(reporter.due_at(start + Duration::from_secs(30)));
        assert!(!reporter.due_at(start + Duration::from_secs(45)));
        assert!(reporter.due_at(start + Duration::from_secs(61)));
    }

    #[test]
    fn zero_interval_is_always_due() {
        let mut reporter = ProgressReporter::new(Duration::ZERO);
        assert!(reporter.due());
        assert!(reporter.due());
    }
}
