//! Tests for Shard
//!
//! These tests verify:
//! - Pending queues and the cache answer before the disk
//! - Flush applies puts, then removes, atomically
//! - Integrity check: clean, healed and dirty files
//! - A failed rename keeps the pending writes
//! - Encrypted files and retirement
//! - Concurrent writers lose nothing across a flush

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use shardkv::config::Config;
use shardkv::crypto::Cipher;
use shardkv::record::DataRecord;
use shardkv::storage::{Integrity, Lookup, Shard};
use shardkv::ShardKvError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(temp: &TempDir, cache_capacity: usize) -> Arc<Config> {
    Arc::new(
        Config::builder()
            .data_dir(temp.path())
            .cache_capacity(cache_capacity)
            .rename_retry(2, 1)
            .build(),
    )
}

async fn setup_temp_shard(cache_capacity: usize) -> (TempDir, Shard) {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir, cache_capacity);
    let shard = Shard::new(temp_dir.path(), "main_0001_0000.json", config, None);
    assert_eq!(shard.init(true).await.unwrap(), Integrity::Clean { records: 0 });
    (temp_dir, shard)
}

fn disk_json(shard: &Shard) -> serde_json::Map<String, serde_json::Value> {
    serde_json::from_str(&fs::read_to_string(shard.path()).unwrap()).unwrap()
}

fn record(key: &str, value: &str) -> DataRecord {
    DataRecord::new(key, value)
}

// =============================================================================
// Init Tests
// =============================================================================

#[tokio::test]
async fn test_init_creates_empty_object() {
    let (_temp, shard) = setup_temp_shard(10).await;

    assert_eq!(fs::read_to_string(shard.path()).unwrap(), "{}");
    assert_eq!(shard.logical_size(), 0);
    assert!(!shard.is_dirty());
}

#[tokio::test]
async fn test_missing_file_without_create_is_dirty() {
    let temp = TempDir::new().unwrap();
    let shard = Shard::new(temp.path(), "lost.json", test_config(&temp, 10), None);

    let status = shard.init(false).await.unwrap();

    assert!(matches!(status, Integrity::Dirty { .. }));
    assert!(shard.is_dirty());
}

#[tokio::test]
async fn test_garbage_file_is_dirty() {
    let (_temp, shard) = setup_temp_shard(10).await;
    fs::write(shard.path(), "{\"a\": {\"key\": \"a\", \"val").unwrap();

    let status = shard.init(false).await.unwrap();

    assert!(matches!(status, Integrity::Dirty { .. }));
    assert_eq!(shard.get("a").await.unwrap(), Lookup::Unknown);
}

#[tokio::test]
async fn test_partially_readable_file_is_healed() {
    let (_temp, shard) = setup_temp_shard(10).await;
    fs::write(
        shard.path(),
        r#"{"good":{"key":"good","value":"v","type":"string","ttl":null},
            "bad":{"key":"bad","value":12,"type":"string","ttl":null}}"#,
    )
    .unwrap();

    let status = shard.init(false).await.unwrap();

    assert_eq!(status, Integrity::Healed { kept: 1, dropped: 1 });
    let json = disk_json(&shard);
    assert!(json.contains_key("good"));
    assert!(!json.contains_key("bad"));
    assert!(!shard.is_dirty());
}

// =============================================================================
// Point Operation Tests
// =============================================================================

#[tokio::test]
async fn test_put_is_visible_before_flush() {
    let (_temp, shard) = setup_temp_shard(10).await;

    shard.put(record("a", "1"));

    match shard.get("a").await.unwrap() {
        Lookup::Hit(found) => {
            assert_eq!(found, record("a", "1"));
            assert_eq!(found.shard.as_deref(), Some("main_0001_0000.json"));
        }
        other => panic!("expected hit, got {other:?}"),
    }
    assert_eq!(fs::read_to_string(shard.path()).unwrap(), "{}");
    assert_eq!(shard.pending_len(), 1);
}

#[tokio::test]
async fn test_get_missing_key() {
    let (_temp, shard) = setup_temp_shard(10).await;

    assert_eq!(shard.get("nope").await.unwrap(), Lookup::Miss);
}

#[tokio::test]
async fn test_remove_hides_key_before_flush() {
    let (_temp, shard) = setup_temp_shard(10).await;
    shard.put(record("a", "1"));
    shard.flush().await.unwrap();

    shard.remove("a");

    assert_eq!(shard.get("a").await.unwrap(), Lookup::Miss);
    assert!(disk_json(&shard).contains_key("a"));
}

#[tokio::test]
async fn test_get_reads_disk_after_eviction() {
    let (_temp, shard) = setup_temp_shard(1).await;
    shard.put(record("a", "1"));
    shard.put(record("b", "2"));
    shard.flush().await.unwrap();
    assert_eq!(shard.cached_len(), 1);

    assert_eq!(shard.get("a").await.unwrap(), Lookup::Hit(record("a", "1")));
}

// =============================================================================
// Flush Tests
// =============================================================================

#[tokio::test]
async fn test_flush_writes_pending_records() {
    let (_temp, shard) = setup_temp_shard(10).await;
    shard.put(record("a", "1"));
    shard.put(record("b", "2"));

    assert!(shard.flush().await.unwrap());

    let json = disk_json(&shard);
    assert_eq!(json.len(), 2);
    assert_eq!(json["a"]["value"], "1");
    assert_eq!(json["a"]["type"], "string");
    assert!(!shard.has_pending());
    assert_eq!(shard.flush_count(), 1);
}

#[tokio::test]
async fn test_flush_with_nothing_pending_is_noop() {
    let (_temp, shard) = setup_temp_shard(10).await;

    assert!(!shard.flush().await.unwrap());
    assert_eq!(shard.flush_count(), 0);
}

#[tokio::test]
async fn test_put_then_remove_in_one_window_ends_deleted() {
    let (_temp, shard) = setup_temp_shard(10).await;
    shard.put(record("a", "1"));
    shard.flush().await.unwrap();

    shard.put(record("a", "2"));
    shard.remove("a");
    shard.flush().await.unwrap();

    assert!(!disk_json(&shard).contains_key("a"));
}

#[tokio::test]
async fn test_remove_then_put_in_one_window_ends_present() {
    let (_temp, shard) = setup_temp_shard(10).await;
    shard.put(record("a", "1"));
    shard.flush().await.unwrap();

    shard.remove("a");
    shard.put(record("a", "2"));
    shard.flush().await.unwrap();

    assert_eq!(disk_json(&shard)["a"]["value"], "2");
}

#[tokio::test]
async fn test_no_temp_file_left_after_flush() {
    let (temp, shard) = setup_temp_shard(10).await;
    shard.put(record("a", "1"));
    shard.flush().await.unwrap();

    let names: Vec<String> = fs::read_dir(temp.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, ["main_0001_0000.json"]);
}

#[tokio::test]
async fn test_rename_exhaustion_keeps_pending() {
    let (_temp, shard) = setup_temp_shard(10).await;
    shard.put(record("a", "1"));

    // A non-empty directory in place of the file makes every rename fail
    fs::remove_file(shard.path()).unwrap();
    fs::create_dir(shard.path()).unwrap();
    fs::write(shard.path().join("blocker"), "x").unwrap();

    let err = shard.flush().await.unwrap_err();

    assert!(matches!(err, ShardKvError::RenameExhausted { attempts: 2, .. }));
    assert_eq!(shard.pending_len(), 1);
    assert_eq!(shard.get("a").await.unwrap(), Lookup::Hit(record("a", "1")));
}

#[tokio::test]
async fn test_dirty_shard_keeps_queueing() {
    let (_temp, shard) = setup_temp_shard(10).await;
    fs::write(shard.path(), "garbage").unwrap();
    shard.init(false).await.unwrap();

    shard.put(record("a", "1"));

    assert!(!shard.flush().await.unwrap());
    assert_eq!(shard.pending_len(), 1);
    assert_eq!(fs::read_to_string(shard.path()).unwrap(), "garbage");
}

// =============================================================================
// Scan Tests
// =============================================================================

#[tokio::test]
async fn test_snapshot_merges_disk_and_queues() {
    let (_temp, shard) = setup_temp_shard(10).await;
    shard.put(record("a", "1"));
    shard.put(record("b", "2"));
    shard.flush().await.unwrap();

    shard.put(record("c", "3"));
    shard.remove("a");

    let snapshot = shard.snapshot().await.unwrap();
    let keys: Vec<&String> = snapshot.keys().collect();
    assert_eq!(keys, ["b", "c"]);
    assert_eq!(shard.logical_size(), 2);
}

#[tokio::test]
async fn test_get_all_with_predicate() {
    let (_temp, shard) = setup_temp_shard(10).await;
    for i in 0..6 {
        shard.put(record(&format!("k{i}"), &i.to_string()));
    }
    shard.flush().await.unwrap();

    let even = shard
        .get_all(|r| r.value.stringify().parse::<u32>().unwrap() % 2 == 0)
        .await
        .unwrap();

    assert_eq!(even.len(), 3);
}

#[tokio::test]
async fn test_find_one_checks_disk() {
    let (_temp, shard) = setup_temp_shard(1).await;
    shard.put(record("a", "needle"));
    shard.put(record("b", "hay"));
    shard.flush().await.unwrap();

    let found = shard.find_one(|r| r.value.stringify() == "needle").await.unwrap();

    assert_eq!(found.map(|r| r.key), Some("a".to_string()));
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_write_all_replaces_contents() {
    let (_temp, shard) = setup_temp_shard(10).await;
    shard.put(record("old", "x"));
    shard.flush().await.unwrap();

    let mut records = BTreeMap::new();
    records.insert("new".to_string(), record("new", "y"));
    shard.write_all(&records).await.unwrap();

    let json = disk_json(&shard);
    assert_eq!(json.len(), 1);
    assert!(json.contains_key("new"));
}

#[tokio::test]
async fn test_clear_empties_file_and_queues() {
    let (_temp, shard) = setup_temp_shard(10).await;
    shard.put(record("a", "1"));
    shard.flush().await.unwrap();
    shard.put(record("b", "2"));

    shard.clear().await.unwrap();

    assert_eq!(fs::read_to_string(shard.path()).unwrap(), "{}");
    assert_eq!(shard.pending_len(), 0);
    assert_eq!(shard.get("a").await.unwrap(), Lookup::Miss);
}

#[tokio::test]
async fn test_unlink_retires_shard() {
    let (_temp, shard) = setup_temp_shard(10).await;
    shard.put(record("a", "1"));
    shard.flush().await.unwrap();

    shard.unlink().await.unwrap();

    assert!(shard.is_retired());
    assert!(!shard.path().exists());
    assert_eq!(shard.get("a").await.unwrap(), Lookup::Retired);
    assert!(!shard.flush().await.unwrap());
}

#[tokio::test]
async fn test_ping_reads_file() {
    let (_temp, shard) = setup_temp_shard(10).await;

    assert!(shard.ping().await.is_ok());
}

// =============================================================================
// Encryption Tests
// =============================================================================

#[tokio::test]
async fn test_encrypted_file_hides_plaintext() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp, 10);
    let cipher = Cipher::new("secret").unwrap();
    let shard = Shard::new(temp.path(), "enc.json", Arc::clone(&config), Some(cipher.clone()));
    shard.init(true).await.unwrap();

    shard.put(record("a", "top secret value"));
    shard.flush().await.unwrap();

    let text = fs::read_to_string(shard.path()).unwrap();
    assert!(!text.contains("top secret value"));
    let envelope: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert!(envelope.get("iv").is_some());
    assert!(envelope.get("data").is_some());

    let reopened = Shard::new(temp.path(), "enc.json", Arc::clone(&config), Some(cipher));
    assert_eq!(reopened.init(false).await.unwrap(), Integrity::Clean { records: 1 });
    assert_eq!(reopened.get("a").await.unwrap(), Lookup::Hit(record("a", "top secret value")));

    let wrong = Shard::new(temp.path(), "enc.json", config, Some(Cipher::new("nope").unwrap()));
    assert!(matches!(wrong.init(false).await.unwrap(), Integrity::Dirty { .. }));
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_puts_survive_interleaved_flushes() {
    let (_temp, shard) = setup_temp_shard(8).await;
    let shard = Arc::new(shard);

    let mut handles = Vec::new();
    for task in 0..4 {
        let shard = Arc::clone(&shard);
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                shard.put(record(&format!("t{task}-k{i}"), "v"));
                if i % 5 == 0 {
                    shard.flush().await.unwrap();
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    shard.flush().await.unwrap();

    assert_eq!(disk_json(&shard).len(), 100);
    assert_eq!(shard.logical_size(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reads_never_recache_removed_keys() {
    let temp = TempDir::new().unwrap();
    let config = test_config(&temp, 1_000);
    {
        let writer = Shard::new(temp.path(), "main_0001_0000.json", config.clone(), None);
        writer.init(true).await.unwrap();
        for i in 0..200 {
            writer.put(record(&format!("k{i}"), "v"));
        }
        writer.flush().await.unwrap();
    }

    // Fresh handle with a cold cache, so reads fill it from disk
    let shard = Arc::new(Shard::new(temp.path(), "main_0001_0000.json", config, None));
    shard.init(false).await.unwrap();

    let mut readers = Vec::new();
    for t in 0..3 {
        let shard = Arc::clone(&shard);
        readers.push(tokio::spawn(async move {
            for round in 0..20 {
                if (round + t) % 2 == 0 {
                    shard.get_all(|_| true).await.unwrap();
                } else {
                    for i in 0..200 {
                        shard.get(&format!("k{i}")).await.unwrap();
                    }
                }
            }
        }));
    }
    let remover = {
        let shard = Arc::clone(&shard);
        tokio::spawn(async move {
            for i in 0..200 {
                shard.remove(&format!("k{i}"));
                tokio::task::yield_now().await;
            }
        })
    };
    for reader in readers {
        reader.await.unwrap();
    }
    remover.await.unwrap();

    assert_eq!(shard.cached_len(), 0);
    shard.flush().await.unwrap();
    for i in 0..200 {
        assert_eq!(shard.get(&format!("k{i}")).await.unwrap(), Lookup::Miss);
    }
    assert!(disk_json(&shard).is_empty());
}
