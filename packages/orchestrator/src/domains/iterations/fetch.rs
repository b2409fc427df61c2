//! Draining a provider run's result set.
//!
//! The provider pages its data; each poll pulls whatever appeared since the
//! last one, in increasing-offset order, up to a fixed number of requests.

use serde_json::Value;

use crate::kernel::BaseScrapingProvider;

/// Read position within one provider run.
#[derive(Debug, Clone)]
pub struct RunCursor {
    pub run_token: String,
    /// Next offset to request.
    pub offset: u64,
    /// Provider-reported size of the result set at the last request.
    pub total_count: u64,
}

impl RunCursor {
    pub fn new(run_token: impl Into<String>) -> Self {
        Self {
            run_token: run_token.into(),
            offset: 0,
            total_count: 0,
        }
    }

    pub fn is_drained(&self) -> bool {
        self.offset >= self.total_count
    }
}

/// Rows pulled during one drain.
#[derive(Debug, Default)]
pub struct Drained {
    pub rows: Vec<Value>,
    pub requests: u32,
    /// Set when a request failed; the remaining rows are picked up next poll.
    pub interrupted: bool,
}

/// Fetch chunks of `limit` rows starting at the cursor until the provider's
/// total is reached or `max_requests` requests were made.
///
/// Fetch failures never propagate: they end this drain and the cursor stays
/// where it was so the next poll retries.
pub async fn drain_run(
    provider: &dyn BaseScrapingProvider,
    cursor: &mut RunCursor,
    limit: u64,
    max_requests: u32,
) -> Drained {
    let mut drained = Drained::default();
    let limit = limit.max(1);

    while drained.requests < max_requests {
        let (rows, total) = match provider.fetch_page(&cursor.run_token, cursor.offset, limit).await {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(
                    run_token = %cursor.run_token,
                    offset = cursor.offset,
                    error = %e,
                    "Data fetch failed, retrying next poll"
                );
                drained.interrupted = true;
                break;
            }
        };
        drained.requests += 1;
        cursor.total_count = total;

        if rows.is_empty() {
            break;
        }
        cursor.offset += rows.len() as u64;
        drained.rows.extend(rows);

        if cursor.offset >= total {
            break;
        }
    }

    if drained.requests == max_requests && !cursor.is_drained() {
        tracing::debug!(
            run_token = %cursor.run_token,
            offset = cursor.offset,
            total = cursor.total_count,
            "Fetch bound reached, continuing next poll"
        );
    }

    drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{MockScrapingProvider, RunState};
    use serde_json::json;

    fn rows(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({ "n": i })).collect()
    }

    #[tokio::test]
    async fn test_drain_walks_offsets_until_total() {
        let mock = MockScrapingProvider::new().with_completed_run("r1", rows(25));
        mock.get_run_status("r1").await;

        let mut cursor = RunCursor::new("r1");
        let drained = drain_run(&mock, &mut cursor, 10, 50).await;

        assert_eq!(drained.rows.len(), 25);
        assert_eq!(cursor.offset, 25);
        assert!(cursor.is_drained());
        let offsets: Vec<u64> = mock.fetch_calls().iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn test_drain_respects_request_bound() {
        let mock = MockScrapingProvider::new().with_completed_run("r1", rows(25));
        mock.get_run_status("r1").await;

        let mut cursor = RunCursor::new("r1");
        let first = drain_run(&mock, &mut cursor, 10, 2).await;
        assert_eq!(first.rows.len(), 20);
        assert!(!cursor.is_drained());

        let second = drain_run(&mock, &mut cursor, 10, 2).await;
        assert_eq!(second.rows.len(), 5);
        assert!(cursor.is_drained());
    }

    #[tokio::test]
    async fn test_drain_only_sees_reported_records() {
        let mock = MockScrapingProvider::new().with_run(
            "r1",
            vec![
                MockScrapingProvider::status(RunState::Running, 3, 1),
                MockScrapingProvider::status(RunState::Succeeded, 6, 2),
            ],
            rows(6),
        );
        let mut cursor = RunCursor::new("r1");

        mock.get_run_status("r1").await;
        assert_eq!(drain_run(&mock, &mut cursor, 100, 5).await.rows.len(), 3);

        mock.get_run_status("r1").await;
        assert_eq!(drain_run(&mock, &mut cursor, 100, 5).await.rows.len(), 3);
        assert_eq!(cursor.offset, 6);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_cursor() {
        let mock = MockScrapingProvider::new();
        let mut cursor = RunCursor::new("missing");
        let drained = drain_run(&mock, &mut cursor, 10, 5).await;
        assert!(drained.interrupted);
        assert_eq!(cursor.offset, 0);
    }
}
