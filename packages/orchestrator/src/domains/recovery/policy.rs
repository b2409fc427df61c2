use std::time::Duration;

use super::models::RecoveryReason;
use crate::domains::pagination::DEFAULT_ITEMS_PER_PAGE;
use crate::kernel::RunState;

/// Thresholds below which a completed run is treated as cut short.
///
/// A run is suspicious only when it is under *both* limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspicionPolicy {
    pub max_pages: u64,
    pub max_records: u64,
}

impl Default for SuspicionPolicy {
    fn default() -> Self {
        Self {
            max_pages: 5,
            max_records: 20,
        }
    }
}

impl SuspicionPolicy {
    pub fn is_suspicious(&self, pages: u64, records: u64) -> bool {
        pages < self.max_pages && records < self.max_records
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    /// No progress for longer than this means the run has stalled.
    pub stall_window: Duration,
    pub items_per_page: u32,
    pub suspicion: SuspicionPolicy,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            stall_window: Duration::from_secs(5 * 60),
            items_per_page: DEFAULT_ITEMS_PER_PAGE,
            suspicion: SuspicionPolicy::default(),
        }
    }
}

/// What the detector knows about a run at one point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunObservation {
    pub state: RunState,
    pub record_count: u64,
    pub page_count: u64,
    /// Time since the record or page count last grew.
    pub idle_for: Duration,
}

impl RecoveryPolicy {
    /// Why this run needs recovery, if it does.
    ///
    /// `Running` and `Unknown` runs only count as stalled once they have been
    /// idle for longer than the stall window; `Failed` runs are terminal for
    /// their iteration and never recovered here.
    pub fn classify(&self, observation: &RunObservation) -> Option<RecoveryReason> {
        match observation.state {
            RunState::Stuck => Some(RecoveryReason::Stalled),
            RunState::Cancelled => Some(RecoveryReason::Cancelled),
            RunState::Running | RunState::Unknown if observation.idle_for > self.stall_window => {
                Some(RecoveryReason::Stalled)
            }
            RunState::Succeeded
                if self
                    .suspicion
                    .is_suspicious(observation.page_count, observation.record_count) =>
            {
                Some(RecoveryReason::Suspicious)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observe(state: RunState, records: u64, pages: u64, idle_secs: u64) -> RunObservation {
        RunObservation {
            state,
            record_count: records,
            page_count: pages,
            idle_for: Duration::from_secs(idle_secs),
        }
    }

    #[test]
    fn test_stall_needs_full_window() {
        let policy = RecoveryPolicy::default();
        assert_eq!(policy.classify(&observe(RunState::Running, 10, 1, 299)), None);
        assert_eq!(
            policy.classify(&observe(RunState::Running, 10, 1, 301)),
            Some(RecoveryReason::Stalled)
        );
        assert_eq!(
            policy.classify(&observe(RunState::Stuck, 10, 1, 0)),
            Some(RecoveryReason::Stalled)
        );
    }

    #[test]
    fn test_suspicious_completion_requires_both_limits() {
        let policy = RecoveryPolicy::default();
        assert_eq!(
            policy.classify(&observe(RunState::Succeeded, 19, 4, 0)),
            Some(RecoveryReason::Suspicious)
        );
        assert_eq!(policy.classify(&observe(RunState::Succeeded, 19, 5, 0)), None);
        assert_eq!(policy.classify(&observe(RunState::Succeeded, 20, 4, 0)), None);
    }

    #[test]
    fn test_failed_runs_are_not_recovered() {
        let policy = RecoveryPolicy::default();
        assert_eq!(policy.classify(&observe(RunState::Failed, 0, 0, 10_000)), None);
    }
}
