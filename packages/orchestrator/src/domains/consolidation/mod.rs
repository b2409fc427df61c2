//! Consolidation engine: batch parsing, fingerprints and deduplicating merge.

pub mod batch;
pub mod fingerprint;
pub mod merge;

pub use batch::{Record, RecordBatch};
pub use fingerprint::{fingerprint, DedupStrategy};
pub use merge::{compare_pages, merge, merge_csv, Consolidator, MergeResult, PageComparison};
