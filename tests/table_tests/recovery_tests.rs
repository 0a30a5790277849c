//! Tests for crash recovery, the locked state and full repair
//!
//! These tests verify:
//! - Writes that were never flushed are replayed on open
//! - Damaged shard files or manifests lock the table
//! - A locked table only accepts full_repair
//! - full_repair rebuilds every record from the full-writer log

use std::path::Path;

use shardkv::record::now_millis;
use shardkv::{Config, DataRecord, Order, ShardKvError, Table, Value};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp dir")
}

fn test_config(dir: &Path) -> shardkv::config::ConfigBuilder {
    Config::builder()
        .data_dir(dir)
        .flush_interval_ms(0)
        .rename_retry(3, 1)
}

async fn open_table(dir: &Path) -> Table {
    Table::open("main", test_config(dir).build()).await.unwrap()
}

fn first_shard(dir: &Path) -> std::path::PathBuf {
    dir.join("main").join("main_0001_0000.json")
}

async fn assert_locked(table: &Table) {
    assert!(table.is_locked());
    assert!(table.get("k0").await.unwrap_err().is_locked());
    assert!(table.set("x", "y").await.unwrap_err().is_locked());
    assert!(table.flush().await.unwrap_err().is_locked());
    assert!(table.ping().await.unwrap_err().is_locked());
    assert!(table.stats().locked);
}

// =============================================================================
// Replay Tests
// =============================================================================

#[tokio::test]
async fn test_unflushed_write_survives_drop() {
    let dir = setup_temp_dir();
    {
        let table = open_table(dir.path()).await;
        table.set("a", "v").await.unwrap();
        // Dropped without close: nothing reached the shard file
    }
    assert_eq!(std::fs::read_to_string(first_shard(dir.path())).unwrap(), "{}");

    let table = open_table(dir.path()).await;

    assert_eq!(table.get("a").await.unwrap().unwrap().value, Value::from("v"));
    assert!(!table.is_locked());
    // Recovery checkpoints the replayed writes
    assert!(std::fs::read_to_string(first_shard(dir.path()))
        .unwrap()
        .contains("\"a\""));
}

#[tokio::test]
async fn test_replay_applies_deletes_and_clear() {
    let dir = setup_temp_dir();
    {
        let table = open_table(dir.path()).await;
        table.set("a", "v").await.unwrap();
        table.set("b", "v").await.unwrap();
        table.flush().await.unwrap();
        table.delete("a").await.unwrap();
        table.clear().await.unwrap();
        table.set("c", "v").await.unwrap();
        table.set("d", "v").await.unwrap();
        table.delete("d").await.unwrap();
    }

    let table = open_table(dir.path()).await;

    let keys: Vec<_> = table
        .all(None, None)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.key)
        .collect();
    assert_eq!(keys, ["c"]);
}

#[tokio::test]
async fn test_close_and_reopen() {
    let dir = setup_temp_dir();
    {
        let table = open_table(dir.path()).await;
        for i in 0..20 {
            table.set(format!("k{i}"), i as f64).await.unwrap();
        }
        table.close().await.unwrap();
    }

    let table = open_table(dir.path()).await;

    assert_eq!(table.all(None, None).await.unwrap().len(), 20);
    assert_eq!(table.stats().pending, 0);
}

#[tokio::test]
async fn test_rehash_on_boot() {
    let dir = setup_temp_dir();
    {
        let table = open_table(dir.path()).await;
        table.set("a", "v").await.unwrap();
        table.close().await.unwrap();
    }

    let table = Table::open("main", test_config(dir.path()).rehash_on_boot(true).build())
        .await
        .unwrap();

    assert_eq!(table.stats().generation, 2);
    assert!(!first_shard(dir.path()).exists());
    assert!(table.get("a").await.unwrap().is_some());
}

#[tokio::test]
async fn test_tail_replay_matches_full_replay() {
    let dir = setup_temp_dir();
    {
        let table = open_table(dir.path()).await;
        for i in 0..8 {
            table.set(format!("k{i}"), i as f64).await.unwrap();
        }
        table.flush().await.unwrap();
        table.delete("k0").await.unwrap();
        table.set("k1", "rewritten").await.unwrap();
        table
            .delete_many(|r| r.key == "k2" || r.key == "k3")
            .await
            .unwrap();
        table.set("k9", Value::BigInt(9)).await.unwrap();
        table.add("k4", 10.0).await.unwrap();
        table.delete("k9").await.unwrap();
        table.set("k9", true).await.unwrap();
        // Dropped without close: everything after the flush is tail-only
    }

    let table = open_table(dir.path()).await;
    let replayed = table.all(None, Some(Order::Ascending)).await.unwrap();

    table.full_repair().await.unwrap();
    let rebuilt = table.all(None, Some(Order::Ascending)).await.unwrap();

    assert_eq!(replayed, rebuilt);
    let keys: Vec<_> = rebuilt.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, ["k1", "k4", "k5", "k6", "k7", "k9"]);
}

// =============================================================================
// Locked Table Tests
// =============================================================================

#[tokio::test]
async fn test_truncated_shard_locks_and_repairs() {
    let dir = setup_temp_dir();
    let table = open_table(dir.path()).await;
    for i in 0..10 {
        table.set(format!("k{i}"), i as f64).await.unwrap();
    }
    table.flush().await.unwrap();

    let path = first_shard(dir.path());
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, &text[..text.len() / 2]).unwrap();

    table.initialize().await.unwrap();
    assert_locked(&table).await;

    let report = table.full_repair().await.unwrap();

    assert_eq!(report.records, 10);
    assert!(!table.is_locked());
    for i in 0..10 {
        let record = table.get(&format!("k{i}")).await.unwrap().unwrap();
        assert_eq!(record.value, Value::Number(i as f64));
    }
    assert!(!path.exists());
}

#[tokio::test]
async fn test_missing_shard_locks_on_open() {
    let dir = setup_temp_dir();
    {
        let table = open_table(dir.path()).await;
        table.set("k0", "v").await.unwrap();
        table.close().await.unwrap();
    }
    std::fs::remove_file(first_shard(dir.path())).unwrap();

    let table = open_table(dir.path()).await;
    assert_locked(&table).await;

    table.full_repair().await.unwrap();
    assert_eq!(table.get("k0").await.unwrap().unwrap().value, Value::from("v"));

    // The repaired table reopens cleanly
    table.close().await.unwrap();
    drop(table);
    let table = open_table(dir.path()).await;
    assert!(!table.is_locked());
    assert!(table.has("k0").await.unwrap());
}

#[tokio::test]
async fn test_unreadable_manifest_locks_on_open() {
    let dir = setup_temp_dir();
    {
        let table = open_table(dir.path()).await;
        table.set("k0", "v").await.unwrap();
        table.close().await.unwrap();
    }
    std::fs::write(dir.path().join("main").join("layout.json"), "not json").unwrap();

    let table = open_table(dir.path()).await;
    assert_locked(&table).await;

    table.full_repair().await.unwrap();
    assert!(table.has("k0").await.unwrap());
}

#[tokio::test]
async fn test_repair_replays_later_history() {
    let dir = setup_temp_dir();
    let table = open_table(dir.path()).await;
    table.set("a", 1.0).await.unwrap();
    table.set("b", 2.0).await.unwrap();
    table.flush().await.unwrap();
    table.clear().await.unwrap();
    table.set("c", 3.0).await.unwrap();
    table.set("a", 4.0).await.unwrap();
    table.delete("c").await.unwrap();
    table
        .insert(DataRecord::new("gone", 5.0).with_ttl(now_millis() - 1))
        .await
        .unwrap();
    table.flush().await.unwrap();

    let report = table.full_repair().await.unwrap();

    assert_eq!(report.records, 1);
    assert!(report.entries_applied > 0);
    assert_eq!(report.entries_corrupted, 0);
    let records = table.all(None, None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, "a");
    assert_eq!(records[0].value, Value::Number(4.0));
}

#[tokio::test]
async fn test_new_key_locks_and_repair_reencrypts() {
    let dir = setup_temp_dir();
    {
        let table = open_table(dir.path()).await;
        table.set("k0", "v").await.unwrap();
        table.close().await.unwrap();
    }

    let config = || test_config(dir.path()).encryption_key("fresh-key").build();
    let table = Table::open("main", config()).await.unwrap();
    assert_locked(&table).await;

    table.full_repair().await.unwrap();
    assert!(table.has("k0").await.unwrap());
    table.close().await.unwrap();
    drop(table);

    let table = Table::open("main", config()).await.unwrap();
    assert!(!table.is_locked());
    assert!(table.has("k0").await.unwrap());
}

#[tokio::test]
async fn test_locked_table_rejects_rehash_and_clear() {
    let dir = setup_temp_dir();
    let table = open_table(dir.path()).await;
    table.set("k0", "v").await.unwrap();
    table.flush().await.unwrap();
    std::fs::write(first_shard(dir.path()), "{").unwrap();
    table.initialize().await.unwrap();

    assert!(matches!(table.rehash().await, Err(ShardKvError::LockedTable { .. })));
    assert!(matches!(table.clear().await, Err(ShardKvError::LockedTable { .. })));
    assert!(matches!(table.purge_expired().await, Err(ShardKvError::LockedTable { .. })));
}
