use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

use super::batch::{value_to_cell, Record, RecordBatch};
use super::fingerprint::DedupStrategy;
use crate::common::{OrchestratorError, Result};

/// Merged, deduplicated dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeResult {
    /// Sorted union of every input header.
    pub headers: Vec<String>,
    pub records: Vec<Record>,
    pub record_count: usize,
    pub duplicates_dropped: usize,
}

impl MergeResult {
    /// Render as CSV. Fields a record lacks are written empty.
    pub fn to_csv(&self) -> Result<String> {
        if self.headers.is_empty() {
            return Ok(String::new());
        }

        let mut writer = csv::Writer::from_writer(Vec::new());

        writer.write_record(&self.headers)?;
        for record in &self.records {
            writer.write_record(
                self.headers
                    .iter()
                    .map(|h| record.get(h).map(value_to_cell).unwrap_or_default()),
            )?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| OrchestratorError::Data(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| OrchestratorError::Data(e.to_string()))
    }
}

/// Incremental consolidation: absorbs batches one at a time, keeping the
/// first occurrence of every dedup key.
#[derive(Debug, Clone, Default)]
pub struct Consolidator {
    strategy: DedupStrategy,
    seen: HashSet<String>,
    headers: BTreeSet<String>,
    records: Vec<Record>,
    duplicates_dropped: usize,
}

impl Consolidator {
    pub fn new(strategy: DedupStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    /// Mark keys as already ingested (e.g. loaded from the store) so matching
    /// records count as duplicates.
    pub fn with_known_keys<I: IntoIterator<Item = String>>(mut self, keys: I) -> Self {
        self.seen.extend(keys);
        self
    }

    pub fn strategy(&self) -> &DedupStrategy {
        &self.strategy
    }

    /// Absorb one batch. Returns the records it contributed, paired with
    /// their dedup keys, in input order.
    pub fn absorb(&mut self, batch: RecordBatch) -> Vec<(String, Record)> {
        self.headers.extend(batch.headers);

        let mut added = Vec::new();
        for record in batch.records {
            self.headers.extend(record.keys().cloned());
            let key = self.strategy.key_for(&record);
            if self.seen.insert(key.clone()) {
                self.records.push(record.clone());
                added.push((key, record));
            } else {
                self.duplicates_dropped += 1;
            }
        }
        added
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn duplicates_dropped(&self) -> usize {
        self.duplicates_dropped
    }

    pub fn finish(self) -> MergeResult {
        MergeResult {
            headers: self.headers.into_iter().collect(),
            record_count: self.records.len(),
            records: self.records,
            duplicates_dropped: self.duplicates_dropped,
        }
    }
}

/// Merge batches, dropping duplicates under `strategy`.
pub fn merge(batches: Vec<RecordBatch>, strategy: &DedupStrategy) -> MergeResult {
    let mut consolidator = Consolidator::new(strategy.clone());
    for batch in batches {
        consolidator.absorb(batch);
    }
    consolidator.finish()
}

/// Parse and merge CSV texts.
pub fn merge_csv(texts: &[&str], strategy: &DedupStrategy) -> MergeResult {
    merge(texts.iter().map(|t| RecordBatch::from_csv(t)).collect(), strategy)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageComparison {
    pub is_complete: bool,
    pub pages_remaining: u64,
    pub pages_completed: u64,
    pub total_target: u64,
    /// `scraped / target * 100`, one decimal; 0 when the target is 0.
    pub percentage: f64,
}

pub fn compare_pages(scraped: u64, target: u64) -> PageComparison {
    let percentage = if target == 0 {
        0.0
    } else {
        ((scraped as f64 / target as f64) * 1000.0).round() / 10.0
    };

    PageComparison {
        is_complete: scraped >= target,
        pages_remaining: target.saturating_sub(scraped),
        pages_completed: scraped,
        total_target: target,
        percentage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_plus_records_equals_inputs() {
        let b1 = RecordBatch::from_csv("name,price\nA,1\nB,2\nC,3\n");
        let b2 = RecordBatch::from_csv("name,price\nC,3\nD,4\n");
        let total = b1.len() + b2.len();

        let result = merge(vec![b1, b2], &DedupStrategy::ContentHash);
        assert_eq!(result.record_count, 4);
        assert_eq!(result.duplicates_dropped, 1);
        assert_eq!(result.record_count + result.duplicates_dropped, total);
    }

    #[test]
    fn test_same_batch_twice_adds_nothing() {
        let batch = RecordBatch::from_csv("name\nA\nB\n");
        let mut consolidator = Consolidator::new(DedupStrategy::ContentHash);
        assert_eq!(consolidator.absorb(batch.clone()).len(), 2);
        assert_eq!(consolidator.absorb(batch).len(), 0);
        assert_eq!(consolidator.record_count(), 2);
        assert_eq!(consolidator.duplicates_dropped(), 2);
    }

    #[test]
    fn test_colliding_single_rows() {
        let result = merge_csv(&["name\nA\n", "name\nA\n"], &DedupStrategy::ContentHash);
        assert_eq!(result.record_count, 1);
        assert_eq!(result.duplicates_dropped, 1);
    }

    #[test]
    fn test_headers_are_sorted_union_and_missing_cells_empty() {
        let result = merge_csv(&["name,price\nA,1\n", "url,name\nhttp://x,B\n"], &DedupStrategy::ContentHash);
        assert_eq!(result.headers, vec!["name", "price", "url"]);

        let csv = result.to_csv().unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines, vec!["name,price,url", "A,1,", "B,,http://x"]);
    }

    #[test]
    fn test_empty_input() {
        let result = merge(Vec::new(), &DedupStrategy::ContentHash);
        assert_eq!(result.record_count, 0);
        assert_eq!(result.duplicates_dropped, 0);
        assert_eq!(result.to_csv().unwrap(), "");
    }

    #[test]
    fn test_known_keys_count_as_duplicates() {
        let batch = RecordBatch::from_csv("name\nA\n");
        let key = DedupStrategy::ContentHash.key_for(&batch.records[0]);
        let mut consolidator = Consolidator::new(DedupStrategy::ContentHash).with_known_keys([key]);
        assert!(consolidator.absorb(batch).is_empty());
    }

    #[test]
    fn test_compare_pages() {
        assert_eq!(compare_pages(0, 0).percentage, 0.0);

        let partial = compare_pages(1, 3);
        assert_eq!(partial.percentage, 33.3);
        assert_eq!(partial.pages_remaining, 2);
        assert!(!partial.is_complete);

        assert!(compare_pages(25, 25).is_complete);
    }
}
