use serde_json::Value;

use crate::record::TraceRecord;
use crate::store::TraceStore;
use crate::Result;

/// Read-only query facade over the trace store.
#[derive(Clone)]
pub struct LogReader {
    store: TraceStore,
}

impl LogReader {
    pub fn new(store: TraceStore) -> Self {
        Self { store }
    }

    /// Insertion-ordered listing; empty before the first write.
    pub async fn list(&self) -> Result<Vec<TraceRecord>> {
        self.store.load_all().await
    }

    /// The full listing as one JSON document payload.
    pub async fn list_json(&self) -> Result<Value> {
        let records = self.list().await?;
        Ok(serde_json::to_value(records)?)
    }

    /// Single record by identifier. Absence is an expected `NotFound`
    /// condition, kept distinct from `StoreUnavailable` so callers can pick
    /// different status codes.
    pub async fn fetch(&self, id: &str) -> Result<TraceRecord> {
        self.store.load_by_id(id).await
    }
}
