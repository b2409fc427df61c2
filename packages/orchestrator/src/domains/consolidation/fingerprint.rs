use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use super::batch::{value_to_cell, Record};
use crate::common::OrchestratorError;

/// Generate a content fingerprint for duplicate detection
///
/// SHA-256 (hex) of the record serialized as JSON with keys sorted
/// lexicographically at every nesting level, so field order never changes
/// the result.
pub fn fingerprint(record: &Record) -> String {
    // BTreeMap iterates in key order already.
    let mut canonical = String::from("{");
    for (i, (key, value)) in record.iter().enumerate() {
        if i > 0 {
            canonical.push(',');
        }
        canonical.push_str(&Value::String(key.clone()).to_string());
        canonical.push(':');
        write_canonical(&mut canonical, value);
    }
    canonical.push('}');

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(out, &map[key]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// How records are judged to be duplicates. Fixed per session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "column", rename_all = "snake_case")]
pub enum DedupStrategy {
    /// Whole-record content fingerprint.
    #[default]
    ContentHash,
    /// Value of one caller-chosen column. Records lacking it fall back to
    /// the content fingerprint.
    KeyColumn(String),
}

impl DedupStrategy {
    /// Dedup key for `record` under this strategy.
    pub fn key_for(&self, record: &Record) -> String {
        match self {
            DedupStrategy::ContentHash => fingerprint(record),
            DedupStrategy::KeyColumn(column) => match record.get(column) {
                Some(value) if !value.is_null() => {
                    let mut hasher = Sha256::new();
                    hasher.update(column.as_bytes());
                    hasher.update(b"=");
                    hasher.update(value_to_cell(value).as_bytes());
                    hex::encode(hasher.finalize())
                }
                _ => {
                    tracing::warn!(
                        column = %column,
                        "Record lacks dedup key column, falling back to content fingerprint"
                    );
                    fingerprint(record)
                }
            },
        }
    }
}

impl fmt::Display for DedupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupStrategy::ContentHash => write!(f, "content_hash"),
            DedupStrategy::KeyColumn(column) => write!(f, "key_column:{}", column),
        }
    }
}

impl FromStr for DedupStrategy {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if s == "content_hash" => Ok(DedupStrategy::ContentHash),
            Some(("key_column", column)) if !column.trim().is_empty() => {
                Ok(DedupStrategy::KeyColumn(column.trim().to_string()))
            }
            _ => Err(OrchestratorError::Validation(format!(
                "unknown dedup strategy '{}'",
                s
            ))),
        }
    }
}

impl TryFrom<String> for DedupStrategy {
    type Error = OrchestratorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_field_order_does_not_matter() {
        let a = record(json!({"name": "Widget", "price": "9.99", "meta": {"b": 1, "a": 2}}));
        let b = record(json!({"meta": {"a": 2, "b": 1}, "price": "9.99", "name": "Widget"}));
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_different_values_differ() {
        let a = record(json!({"name": "Widget"}));
        let b = record(json!({"name": "Gadget"}));
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    #[test]
    fn test_key_column_ignores_other_fields() {
        let strategy = DedupStrategy::KeyColumn("sku".to_string());
        let a = record(json!({"sku": "A1", "price": "1"}));
        let b = record(json!({"sku": "A1", "price": "2"}));
        assert_eq!(strategy.key_for(&a), strategy.key_for(&b));
    }

    #[test]
    fn test_key_column_falls_back_to_content() {
        let strategy = DedupStrategy::KeyColumn("sku".to_string());
        let a = record(json!({"name": "no sku"}));
        assert_eq!(strategy.key_for(&a), fingerprint(&a));
    }

    #[test]
    fn test_strategy_string_form() {
        assert_eq!("content_hash".parse::<DedupStrategy>().unwrap(), DedupStrategy::ContentHash);
        let key: DedupStrategy = "key_column:url".parse().unwrap();
        assert_eq!(key, DedupStrategy::KeyColumn("url".to_string()));
        assert_eq!(key.to_string(), "key_column:url");
        assert!("bogus".parse::<DedupStrategy>().is_err());
    }
}
