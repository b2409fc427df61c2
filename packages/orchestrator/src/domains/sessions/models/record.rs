use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use crate::common::{IterationId, RecordId, SessionId};
use crate::domains::consolidation::{batch::value_as_u64, Record};

/// A deduplicated scraped row. `(session_id, fingerprint)` is unique.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: RecordId,
    pub session_id: SessionId,
    pub iteration_id: IterationId,
    pub page_number: Option<i32>,
    /// Dedup key under the session's strategy.
    pub fingerprint: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl ResultRecord {
    /// Wrap a consolidated row. The page number is read from the row's
    /// `page_column`, if any.
    pub fn from_record(
        session_id: SessionId,
        iteration_id: IterationId,
        fingerprint: String,
        record: Record,
        page_column: Option<&str>,
    ) -> Self {
        let page_number = page_column
            .and_then(|c| record.get(c))
            .and_then(value_as_u64)
            .and_then(|p| i32::try_from(p).ok());

        Self {
            id: RecordId::new(),
            session_id,
            iteration_id,
            page_number,
            fingerprint,
            data: Value::Object(record.into_iter().collect()),
            created_at: Utc::now(),
        }
    }

    /// The stored row as a record map. Non-object payloads yield an empty map.
    pub fn to_record(&self) -> Record {
        match &self.data {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => Record::new(),
        }
    }
}
