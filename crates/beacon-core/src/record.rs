use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{BeaconError, Result};

/// Canonical unit of telemetry.
///
/// `id`, `host` and `timestamp` are guaranteed non-empty once a record has
/// passed normalization; everything else the client sent rides along as
/// opaque metadata and is flattened back into the same JSON object on the
/// wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub id: String,
    pub host: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub meta: BTreeMap<String, Value>,
}

/// Shape validation for an inbound payload, applied before canonicalization.
///
/// Violations are reported as `Validation` failures so the request boundary
/// can render them; they never propagate as faults.
pub fn validate_shape(fields: &Map<String, Value>) -> Result<()> {
    if fields.keys().any(|k| k.trim().is_empty()) {
        return Err(BeaconError::Validation(
            "metadata keys must be non-empty".to_string(),
        ));
    }
    if let Some(id) = fields.get("id") {
        match id {
            Value::String(s) if !s.is_empty() => {}
            _ => {
                return Err(BeaconError::Validation(
                    "id must be a non-empty string".to_string(),
                ))
            }
        }
    }
    if let Some(ts) = fields.get("timestamp") {
        if !ts.is_string() {
            return Err(BeaconError::Validation(
                "timestamp must be a string".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(map) => map,
            _ => panic!("Expected object"),
        }
    }

    #[test]
    fn test_validate_shape_accepts_plain_payload() {
        let map = as_map(json!({"id": "abc", "event": "click", "count": 3}));
        assert!(validate_shape(&map).is_ok());
    }

    #[test]
    fn test_validate_shape_rejects_non_string_id() {
        let map = as_map(json!({"id": 42}));
        assert!(matches!(
            validate_shape(&map),
            Err(BeaconError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_shape_rejects_empty_id() {
        let map = as_map(json!({"id": ""}));
        assert!(validate_shape(&map).is_err());
    }

    #[test]
    fn test_validate_shape_rejects_numeric_timestamp() {
        let map = as_map(json!({"timestamp": 1700000000}));
        assert!(validate_shape(&map).is_err());
    }

    #[test]
    fn test_record_serializes_flat() {
        let mut meta = BTreeMap::new();
        meta.insert("event".to_string(), json!("click"));
        let record = TraceRecord {
            id: "abc".to_string(),
            host: "203.0.113.9".to_string(),
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
            meta,
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["id"], "abc");
        assert_eq!(value["event"], "click");
        assert!(value.get("meta").is_none());

        let back: TraceRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
