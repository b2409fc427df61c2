use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Last observed progress of a provider run.
///
/// One row per run token, overwritten on every observation. `last_progress_at`
/// only moves when the record count grows, so stalls can be detected across
/// process restarts.
#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub run_token: String,
    pub record_count: i64,
    pub page_count: i64,
    pub items_per_minute: f64,
    pub last_progress_at: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
}

impl RunCheckpoint {
    pub fn first(run_token: &str, record_count: i64, page_count: i64, now: DateTime<Utc>) -> Self {
        Self {
            run_token: run_token.to_string(),
            record_count,
            page_count,
            items_per_minute: 0.0,
            last_progress_at: now,
            observed_at: now,
        }
    }

    /// Checkpoint following `self` after a new observation.
    pub fn observe(&self, record_count: i64, page_count: i64, now: DateTime<Utc>) -> Self {
        let progressed = record_count > self.record_count || page_count > self.page_count;

        let items_per_minute = if record_count > self.record_count {
            let minutes = (now - self.observed_at).num_milliseconds() as f64 / 60_000.0;
            if minutes > 0.0 {
                (record_count - self.record_count) as f64 / minutes
            } else {
                self.items_per_minute
            }
        } else {
            self.items_per_minute
        };

        Self {
            run_token: self.run_token.clone(),
            record_count: record_count.max(self.record_count),
            page_count: page_count.max(self.page_count),
            items_per_minute,
            last_progress_at: if progressed { now } else { self.last_progress_at },
            observed_at: now,
        }
    }

    /// Time since the record or page count last grew.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_progress_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_moves_timestamp_and_rate() {
        let t0 = Utc::now();
        let first = RunCheckpoint::first("r", 0, 0, t0);
        let next = first.observe(30, 1, t0 + Duration::minutes(2));
        assert_eq!(next.items_per_minute, 15.0);
        assert_eq!(next.last_progress_at, t0 + Duration::minutes(2));
    }

    #[test]
    fn test_no_progress_keeps_timestamp() {
        let t0 = Utc::now();
        let first = RunCheckpoint::first("r", 10, 1, t0);
        let later = t0 + Duration::minutes(6);
        let next = first.observe(10, 1, later);
        assert_eq!(next.last_progress_at, t0);
        assert_eq!(next.idle_for(later), Duration::minutes(6));
    }
}
