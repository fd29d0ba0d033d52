//! Payload normalization and the ingestion pipeline.
//!
//! Converts an arbitrary inbound payload into a canonical [`TraceRecord`] or
//! a structured `Validation` failure, then hands the record through the
//! configured transport (relay, then persist).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::record::{validate_shape, TraceRecord};
use crate::transport::Transport;
use crate::{BeaconError, Result};

/// Normalize an arbitrary payload into a canonical record.
///
/// `origin` is the server-observed client address (forwarded-for header or
/// raw connection address). A client-supplied `host` field is always
/// discarded in its favor. A missing `id` is generated; a missing or empty
/// `timestamp` defaults to now. Pure with respect to the store.
pub fn normalize(payload: Value, origin: &str) -> Result<TraceRecord> {
    let Value::Object(mut fields) = payload else {
        return Err(BeaconError::Validation(
            "trace payload must be a JSON object".to_string(),
        ));
    };
    validate_shape(&fields)?;

    // Spoofing prevention: whatever the client claimed as host is dropped.
    fields.remove("host");

    let id = match fields.remove("id") {
        Some(Value::String(s)) => s,
        None => Uuid::new_v4().to_string(),
        Some(_) => {
            return Err(BeaconError::Validation(
                "id must be a non-empty string".to_string(),
            ))
        }
    };

    let timestamp = match fields.remove("timestamp") {
        None => Utc::now().to_rfc3339(),
        Some(Value::String(s)) if s.is_empty() => Utc::now().to_rfc3339(),
        Some(Value::String(s)) => {
            DateTime::parse_from_rfc3339(&s).map_err(|e| {
                BeaconError::Validation(format!("timestamp is not ISO-8601: {}", e))
            })?;
            s
        }
        Some(_) => {
            return Err(BeaconError::Validation(
                "timestamp must be a string".to_string(),
            ))
        }
    };

    let meta: BTreeMap<String, Value> = fields.into_iter().collect();

    Ok(TraceRecord {
        id,
        host: origin.to_string(),
        timestamp,
        meta,
    })
}

/// The ingestion pipeline: normalize, relay to the sink's echo stream, then
/// hand off for persistence. Returns the normalized record so the caller can
/// acknowledge the client; the acknowledgment does not wait for the store
/// write to land.
pub async fn ingest(payload: Value, origin: &str, transport: &dyn Transport) -> Result<TraceRecord> {
    let record = normalize(payload, origin)?;
    transport.relay(&record).await?;
    transport.persist(&record).await?;
    Ok(record)
}
