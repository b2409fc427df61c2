//! Tabular result batches.
//!
//! A batch is what one provider run (or one CSV export) yields: a header row
//! plus records keyed by column name. CSV values are kept as JSON strings,
//! provider JSON records keep their native types.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// One scraped row, keyed by column name.
pub type Record = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBatch {
    pub headers: Vec<String>,
    pub records: Vec<Record>,
}

impl RecordBatch {
    pub fn new(headers: Vec<String>, records: Vec<Record>) -> Self {
        Self { headers, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Parse CSV text with a header row.
    ///
    /// Rows that fail to parse or whose width differs from the header are
    /// skipped with a warning. Blank input yields an empty batch.
    pub fn from_csv(text: &str) -> Self {
        if text.trim().is_empty() {
            return Self::default();
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .trim(csv::Trim::Headers)
            .from_reader(text.trim().as_bytes());

        let headers: Vec<String> = match reader.headers() {
            Ok(h) => h.iter().map(|s| s.to_string()).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Unreadable CSV header, treating batch as empty");
                return Self::default();
            }
        };

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for (line, row) in reader.records().enumerate() {
            match row {
                Ok(row) => {
                    let record: Record = headers
                        .iter()
                        .zip(row.iter())
                        .map(|(h, v)| (h.clone(), Value::String(v.to_string())))
                        .collect();
                    records.push(record);
                }
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(row = line + 1, error = %e, "Skipping malformed CSV row");
                }
            }
        }

        if skipped > 0 {
            tracing::debug!(skipped, kept = records.len(), "Parsed CSV batch with skipped rows");
        }

        Self { headers, records }
    }

    /// Build a batch from provider JSON records. Non-object values are skipped.
    pub fn from_json(values: Vec<Value>) -> Self {
        let mut headers = BTreeSet::new();
        let mut records = Vec::with_capacity(values.len());

        for value in values {
            match value {
                Value::Object(map) => {
                    let record: Record = map.into_iter().collect();
                    headers.extend(record.keys().cloned());
                    records.push(record);
                }
                other => {
                    tracing::warn!(kind = json_kind(&other), "Skipping non-object provider record");
                }
            }
        }

        Self {
            headers: headers.into_iter().collect(),
            records,
        }
    }

    /// Highest page number in the batch.
    ///
    /// Uses the first column whose name contains "page" (case-insensitive).
    /// Returns 0 for an empty batch and 1 when there is no page column or no
    /// row carries a positive integer in it.
    pub fn max_page_number(&self) -> u64 {
        if self.records.is_empty() {
            return 0;
        }

        let Some(column) = self.page_column() else {
            return 1;
        };

        self.records
            .iter()
            .filter_map(|r| r.get(column).and_then(value_as_u64))
            .max()
            .filter(|&p| p > 0)
            .unwrap_or(1)
    }

    /// Name of the first column that looks like a page number.
    pub fn page_column(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.to_ascii_lowercase().contains("page"))
            .map(|h| h.as_str())
    }
}

/// Interpret a cell as a non-negative integer (`3`, `"3"`, `" 3 "`, `3.0`).
pub fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Render a cell for CSV output.
pub fn value_to_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_csv_skips_malformed_rows() {
        let batch = RecordBatch::from_csv("name,price\nA,1\nB,2,extra\nC,3\n");
        assert_eq!(batch.headers, vec!["name", "price"]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[1]["name"], json!("C"));
    }

    #[test]
    fn test_blank_csv_is_empty() {
        assert!(RecordBatch::from_csv("   \n").is_empty());
        assert_eq!(RecordBatch::from_csv("").max_page_number(), 0);
    }

    #[test]
    fn test_max_page_number() {
        let batch = RecordBatch::from_csv("Page_Number,name\n3,a\n11,b\nx,c\n");
        assert_eq!(batch.max_page_number(), 11);

        let no_page_column = RecordBatch::from_csv("name\na\nb\n");
        assert_eq!(no_page_column.max_page_number(), 1);
    }

    #[test]
    fn test_from_json_collects_headers_and_skips_scalars() {
        let batch = RecordBatch::from_json(vec![
            json!({"name": "a", "page": 2}),
            json!("garbage"),
            json!({"url": "https://x.com/1"}),
        ]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.headers, vec!["name", "page", "url"]);
        assert_eq!(batch.max_page_number(), 2);
    }
}
