//! Durable trace store with a single logical writer.
//!
//! All writes funnel through one dedicated task draining a bounded queue,
//! and every snapshot lands via temp-file-then-rename, so readers only ever
//! observe complete backing files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::record::TraceRecord;
use crate::{BeaconError, Result};

enum WriteOp {
    Save(TraceRecord),
    /// Barrier: acknowledged once every previously queued write has landed.
    Sync(oneshot::Sender<()>),
}

/// Insertion-ordered mapping from id to the most recent record for that id.
/// An overwrite supersedes the value but keeps the entry's original position.
#[derive(Default)]
struct EntrySet {
    records: Vec<TraceRecord>,
    index: HashMap<String, usize>,
}

impl EntrySet {
    fn from_records(records: Vec<TraceRecord>) -> Self {
        let mut set = Self::default();
        for record in records {
            set.upsert(record);
        }
        set
    }

    fn upsert(&mut self, record: TraceRecord) {
        match self.index.get(&record.id) {
            Some(&pos) => self.records[pos] = record,
            None => {
                self.index.insert(record.id.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }
}

/// Handle to the trace store. Cheap to clone; all clones share the one
/// writer task.
///
/// Consistency contract: `save` returns once the record is accepted into the
/// writer queue, not once it has hit disk. A client can be told "accepted"
/// moments before the write actually lands, or even if it ultimately fails;
/// in exchange, request latency is insensitive to sink speed. Reads go to
/// the backing file and may trail the queue, but never see a torn snapshot.
#[derive(Clone)]
pub struct TraceStore {
    path: PathBuf,
    tx: mpsc::Sender<WriteOp>,
    enqueue_timeout: Duration,
}

impl TraceStore {
    /// Open the store, loading any existing backing file, and spawn the
    /// writer task. The file itself is created lazily on first write.
    pub async fn open(
        path: impl Into<PathBuf>,
        queue_capacity: usize,
        enqueue_timeout: Duration,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let records = match read_entries(&path).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Ignoring unreadable backing file {}: {}", path.display(), e);
                Vec::new()
            }
        };
        debug!(
            "Trace store opened at {} with {} entries",
            path.display(),
            records.len()
        );

        let (tx, rx) = mpsc::channel(queue_capacity);
        tokio::spawn(run_writer(path.clone(), EntrySet::from_records(records), rx));

        Ok(Self {
            path,
            tx,
            enqueue_timeout,
        })
    }

    /// Insert or overwrite the entry for `record.id` ("last write observed
    /// wins"). Bounded blocking: when the writer queue is full the caller
    /// waits up to the enqueue timeout, then fails.
    pub async fn save(&self, record: TraceRecord) -> Result<()> {
        self.tx
            .send_timeout(WriteOp::Save(record), self.enqueue_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => {
                    BeaconError::StoreUnavailable("writer queue is full".to_string())
                }
                SendTimeoutError::Closed(_) => {
                    BeaconError::StoreUnavailable("writer task has stopped".to_string())
                }
            })
    }

    /// Wait until every write queued before this call has landed on disk.
    pub async fn sync(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriteOp::Sync(ack_tx))
            .await
            .map_err(|_| BeaconError::StoreUnavailable("writer task has stopped".to_string()))?;
        ack_rx
            .await
            .map_err(|_| BeaconError::StoreUnavailable("writer task has stopped".to_string()))
    }

    /// Insertion-ordered listing of all current entries. An absent backing
    /// file degrades to an empty listing; a present-but-unreadable file is a
    /// genuine read failure.
    pub async fn load_all(&self) -> Result<Vec<TraceRecord>> {
        read_entries(&self.path).await
    }

    /// Single-key lookup. Unlike `load_all`, a required read never silently
    /// succeeds on store failure: an unreadable (or still absent) backing
    /// file is `StoreUnavailable`, a missing id is `NotFound`.
    pub async fn load_by_id(&self, id: &str) -> Result<TraceRecord> {
        let bytes = fs::read(&self.path).await.map_err(|e| {
            BeaconError::StoreUnavailable(format!("cannot read backing file: {}", e))
        })?;
        let records: Vec<TraceRecord> = serde_json::from_slice(&bytes).map_err(|e| {
            BeaconError::StoreUnavailable(format!("backing file is corrupt: {}", e))
        })?;
        records
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| BeaconError::NotFound(id.to_string()))
    }
}

async fn run_writer(path: PathBuf, mut entries: EntrySet, mut rx: mpsc::Receiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Save(record) => {
                debug!(id = %record.id, "persisting trace");
                entries.upsert(record);
                if let Err(e) = write_snapshot(&path, &entries).await {
                    error!("Failed to persist trace snapshot: {}", e);
                }
            }
            WriteOp::Sync(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("Trace store writer stopped");
}

/// Atomic replace-on-write: serialize the whole entry set next to the
/// backing file, then rename over it.
async fn write_snapshot(path: &Path, entries: &EntrySet) -> Result<()> {
    let json = serde_json::to_vec_pretty(&entries.records)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &json).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_entries(path: &Path) -> Result<Vec<TraceRecord>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(BeaconError::StoreUnavailable(format!(
                "cannot read backing file: {}",
                e
            )))
        }
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| BeaconError::StoreUnavailable(format!("backing file is corrupt: {}", e)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(id: &str, event: &str) -> TraceRecord {
        let mut meta = std::collections::BTreeMap::new();
        meta.insert("event".to_string(), json!(event));
        TraceRecord {
            id: id.to_string(),
            host: "203.0.113.9".to_string(),
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
            meta,
        }
    }

    #[tokio::test]
    async fn test_save_and_load_by_id() {
        let dir = tempdir().unwrap();
        let store = TraceStore::open(
            dir.path().join("traces.json"),
            16,
            Duration::from_millis(500),
        )
        .await
        .unwrap();

        store.save(record("a1", "click")).await.unwrap();
        store.sync().await.unwrap();

        let loaded = store.load_by_id("a1").await.unwrap();
        assert_eq!(loaded.meta.get("event"), Some(&json!("click")));
    }

    #[tokio::test]
    async fn test_overwrite_keeps_one_entry_in_place() {
        let dir = tempdir().unwrap();
        let store = TraceStore::open(
            dir.path().join("traces.json"),
            16,
            Duration::from_millis(500),
        )
        .await
        .unwrap();

        store.save(record("a1", "first")).await.unwrap();
        store.save(record("a2", "other")).await.unwrap();
        store.save(record("a1", "second")).await.unwrap();
        store.sync().await.unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "a1");
        assert_eq!(all[0].meta.get("event"), Some(&json!("second")));
        assert_eq!(all[1].id, "a2");
    }

    #[tokio::test]
    async fn test_load_all_before_first_write_is_empty() {
        let dir = tempdir().unwrap();
        let store = TraceStore::open(
            dir.path().join("traces.json"),
            16,
            Duration::from_millis(500),
        )
        .await
        .unwrap();

        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_by_id_distinguishes_absent_store_from_absent_id() {
        let dir = tempdir().unwrap();
        let store = TraceStore::open(
            dir.path().join("traces.json"),
            16,
            Duration::from_millis(500),
        )
        .await
        .unwrap();

        // No backing file yet: unavailable, not "not found".
        assert!(matches!(
            store.load_by_id("a1").await,
            Err(BeaconError::StoreUnavailable(_))
        ));

        store.save(record("a1", "click")).await.unwrap();
        store.sync().await.unwrap();

        assert!(matches!(
            store.load_by_id("missing").await,
            Err(BeaconError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_backing_file_is_a_read_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("traces.json");
        let store = TraceStore::open(path.clone(), 16, Duration::from_millis(500))
            .await
            .unwrap();

        tokio::fs::write(&path, b"not json").await.unwrap();

        assert!(matches!(
            store.load_all().await,
            Err(BeaconError::StoreUnavailable(_))
        ));
        assert!(matches!(
            store.load_by_id("a1").await,
            Err(BeaconError::StoreUnavailable(_))
        ));
    }
}
