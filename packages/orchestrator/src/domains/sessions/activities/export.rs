//! Consolidated export of a session's records.

use serde_json::Value;
use std::collections::HashMap;

use crate::common::{OrchestratorError, Result, SessionId};
use crate::domains::consolidation::{merge, MergeResult, RecordBatch};
use crate::kernel::OrchestratorDeps;

/// Merge every stored record of the session into one table, deduplicated
/// under the session's strategy. With `include_source`, each row gains
/// `source_iteration` and `source_page` columns.
pub async fn export_session(
    session_id: SessionId,
    include_source: bool,
    deps: &OrchestratorDeps,
) -> Result<MergeResult> {
    let store = &deps.store;
    let session = store
        .get_session(session_id)
        .await?
        .ok_or_else(|| OrchestratorError::not_found("session", session_id))?;

    let iteration_numbers: HashMap<_, _> = store
        .list_iterations(session_id)
        .await?
        .into_iter()
        .map(|i| (i.id, i.iteration_number))
        .collect();

    let records = store
        .list_records(session_id)
        .await?
        .into_iter()
        .map(|stored| {
            let mut record = stored.to_record();
            if include_source {
                let iteration = iteration_numbers.get(&stored.iteration_id).copied();
                record
                    .entry("source_iteration".to_string())
                    .or_insert_with(|| iteration.map(Value::from).unwrap_or(Value::Null));
                record
                    .entry("source_page".to_string())
                    .or_insert_with(|| stored.page_number.map(Value::from).unwrap_or(Value::Null));
            }
            record
        })
        .collect();

    let merged = merge(
        vec![RecordBatch::new(Vec::new(), records)],
        &session.dedup_strategy,
    );

    tracing::info!(
        session_id = %session_id,
        records = merged.record_count,
        duplicates = merged.duplicates_dropped,
        columns = merged.headers.len(),
        "Session exported"
    );
    Ok(merged)
}
