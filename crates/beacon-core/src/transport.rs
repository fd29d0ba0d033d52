//! Pluggable sinks and the startup-time transport registry.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::record::TraceRecord;
use crate::store::TraceStore;
use crate::{BeaconError, Result};

/// Capability set every sink implements.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Echo the record to the sink's operational stream.
    async fn relay(&self, record: &TraceRecord) -> Result<()>;
    /// Hand the record to the sink's durable backend.
    async fn persist(&self, record: &TraceRecord) -> Result<()>;
}

/// Known sink identifiers. An unknown identifier is a bootstrap contract
/// violation and fails process startup, never a per-request error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Console,
    File,
}

impl FromStr for TransportKind {
    type Err = BeaconError;

    fn from_str(s: &str) -> std::result::Result<Self, BeaconError> {
        match s {
            "console" => Ok(Self::Console),
            "file" => Ok(Self::File),
            other => Err(BeaconError::Configuration(format!(
                "unknown sink identifier '{}'",
                other
            ))),
        }
    }
}

/// Default sink: relays each record as one JSON line on the log stream and
/// persists nothing, so read-back stays empty.
pub struct ConsoleTransport;

#[async_trait]
impl Transport for ConsoleTransport {
    async fn relay(&self, record: &TraceRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        info!(target: "beacon::relay", "{}", line);
        Ok(())
    }

    async fn persist(&self, _record: &TraceRecord) -> Result<()> {
        Ok(())
    }
}

/// File-backed sink: persists into the store the read-back API queries.
pub struct FileTransport {
    store: TraceStore,
}

impl FileTransport {
    pub fn new(store: TraceStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn relay(&self, record: &TraceRecord) -> Result<()> {
        debug!(id = %record.id, host = %record.host, "trace relayed to file sink");
        Ok(())
    }

    async fn persist(&self, record: &TraceRecord) -> Result<()> {
        self.store.save(record.clone()).await
    }
}

/// Resolve the configured sink identifier to a concrete transport. Called
/// exactly once at process start.
pub fn resolve_transport(id: &str, store: &TraceStore) -> Result<Arc<dyn Transport>> {
    Ok(match id.parse::<TransportKind>()? {
        TransportKind::Console => Arc::new(ConsoleTransport),
        TransportKind::File => Arc::new(FileTransport::new(store.clone())),
    })
}
