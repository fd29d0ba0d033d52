//! Store semantics across restarts and under concurrent writers.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;
use tempfile::tempdir;

use beacon_core::{BeaconError, LogReader, TraceRecord, TraceStore};

fn record(id: &str, event: &str) -> TraceRecord {
    let mut meta = BTreeMap::new();
    meta.insert("event".to_string(), json!(event));
    TraceRecord {
        id: id.to_string(),
        host: "203.0.113.9".to_string(),
        timestamp: "2026-01-01T00:00:00+00:00".to_string(),
        meta,
    }
}

async fn open_store(path: std::path::PathBuf) -> TraceStore {
    TraceStore::open(path, 64, Duration::from_millis(500))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_entries_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("traces.json");

    {
        let store = open_store(path.clone()).await;
        store.save(record("a1", "click")).await.unwrap();
        store.save(record("a2", "view")).await.unwrap();
        store.sync().await.unwrap();
    }

    let store = open_store(path).await;
    let all = store.load_all().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, "a1");
    assert_eq!(all[1].id, "a2");
}

#[tokio::test]
async fn test_concurrent_distinct_ids_are_all_kept() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path().join("traces.json")).await;

    let mut handles = Vec::new();
    for i in 0..32 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.save(record(&format!("id-{}", i), "burst")).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    store.sync().await.unwrap();

    let all = store.load_all().await.unwrap();
    assert_eq!(all.len(), 32);
    for i in 0..32 {
        let id = format!("id-{}", i);
        assert!(all.iter().any(|r| r.id == id), "missing {}", id);
    }
}

#[tokio::test]
async fn test_same_id_race_leaves_last_write() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path().join("traces.json")).await;

    for round in 0..10 {
        store
            .save(record("contended", &format!("round-{}", round)))
            .await
            .unwrap();
    }
    store.sync().await.unwrap();

    let all = store.load_all().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].meta.get("event"), Some(&json!("round-9")));
}

#[tokio::test]
async fn test_reader_facade_matches_store() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path().join("traces.json")).await;
    let reader = LogReader::new(store.clone());

    assert!(reader.list().await.unwrap().is_empty());
    assert!(matches!(
        reader.fetch("nobody").await,
        Err(BeaconError::StoreUnavailable(_))
    ));

    store.save(record("a1", "click")).await.unwrap();
    store.sync().await.unwrap();

    let listing = reader.list_json().await.unwrap();
    assert_eq!(listing.as_array().unwrap().len(), 1);
    assert_eq!(reader.fetch("a1").await.unwrap().id, "a1");
    assert!(matches!(
        reader.fetch("nobody").await,
        Err(BeaconError::NotFound(_))
    ));
}
