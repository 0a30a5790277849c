//! Tests for Referencer
//!
//! These tests verify:
//! - Lookups after appends and after a reopen (lazy load)
//! - The latest line for a key wins
//! - Deletes rewrite the files on disk
//! - File rollover at the size bound
//! - Restart, clear and the timed cache window

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use shardkv::reference::Referencer;
use shardkv::{Config, ReferenceCachePolicy};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp dir")
}

fn test_config() -> Arc<Config> {
    Arc::new(Config::builder().rename_retry(3, 1).build())
}

async fn read_all_files(dir: &Path) -> String {
    let mut names: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    names.sort();

    let mut text = String::new();
    for name in names {
        text.push_str(&tokio::fs::read_to_string(name).await.unwrap());
    }
    text
}

// =============================================================================
// Lookup Tests
// =============================================================================

#[tokio::test]
async fn test_set_and_get() {
    let dir = setup_temp_dir();
    let refs = Referencer::open(dir.path(), test_config()).await.unwrap();

    refs.set_reference("a", "main_0001_0000.json").await.unwrap();
    refs.set_reference("b", "main_0001_0001.json").await.unwrap();

    assert_eq!(
        refs.get_reference("a").await.unwrap().as_deref(),
        Some("main_0001_0000.json")
    );
    assert_eq!(refs.get_reference("missing").await.unwrap(), None);
    assert_eq!(refs.len(), Some(2));
}

#[tokio::test]
async fn test_index_loads_lazily_after_reopen() {
    let dir = setup_temp_dir();
    {
        let refs = Referencer::open(dir.path(), test_config()).await.unwrap();
        refs.set_reference("a", "s0").await.unwrap();
    }

    let refs = Referencer::open(dir.path(), test_config()).await.unwrap();
    assert!(!refs.is_warm());

    assert_eq!(refs.get_reference("a").await.unwrap().as_deref(), Some("s0"));
    assert!(refs.is_warm());
}

#[tokio::test]
async fn test_latest_line_wins() {
    let dir = setup_temp_dir();
    {
        let refs = Referencer::open(dir.path(), test_config()).await.unwrap();
        refs.set_reference("a", "s0").await.unwrap();
        refs.set_reference("a", "s1").await.unwrap();
    }

    let refs = Referencer::open(dir.path(), test_config()).await.unwrap();
    assert_eq!(refs.get_reference("a").await.unwrap().as_deref(), Some("s1"));
}

#[tokio::test]
async fn test_keys_with_separators_survive() {
    let dir = setup_temp_dir();
    let key = "line\nbreak \"quoted\"";
    {
        let refs = Referencer::open(dir.path(), test_config()).await.unwrap();
        refs.set_reference(key, "s0").await.unwrap();
    }

    let refs = Referencer::open(dir.path(), test_config()).await.unwrap();
    assert_eq!(refs.get_reference(key).await.unwrap().as_deref(), Some("s0"));
}

#[tokio::test]
async fn test_unchanged_reference_is_not_appended() {
    let dir = setup_temp_dir();
    let refs = Referencer::open(dir.path(), test_config()).await.unwrap();
    refs.set_reference("a", "s0").await.unwrap();

    refs.set_reference("a", "s0").await.unwrap();

    assert_eq!(read_all_files(dir.path()).await.lines().count(), 1);
}

#[tokio::test]
async fn test_repeated_reference_after_reopen_is_not_appended() {
    let dir = setup_temp_dir();
    {
        let refs = Referencer::open(dir.path(), test_config()).await.unwrap();
        refs.set_reference("same", "s0").await.unwrap();
    }

    // Cold index: the first set must still see the existing line
    let refs = Referencer::open(dir.path(), test_config()).await.unwrap();
    for _ in 0..500 {
        refs.set_reference("same", "s0").await.unwrap();
    }

    assert_eq!(read_all_files(dir.path()).await.lines().count(), 1);
    assert!(refs.is_warm());
}

// =============================================================================
// Delete Tests
// =============================================================================

#[tokio::test]
async fn test_delete_rewrites_files() {
    let dir = setup_temp_dir();
    let refs = Referencer::open(dir.path(), test_config()).await.unwrap();
    refs.set_reference("a", "s0").await.unwrap();
    refs.set_reference("b", "s1").await.unwrap();
    refs.set_reference("a", "s2").await.unwrap();

    refs.delete_reference("a").await.unwrap();

    assert_eq!(refs.get_reference("a").await.unwrap(), None);
    let text = read_all_files(dir.path()).await;
    assert_eq!(text.lines().count(), 1);
    assert!(text.contains("s1"));
}

#[tokio::test]
async fn test_delete_many_counts_indexed_keys() {
    let dir = setup_temp_dir();
    let refs = Referencer::open(dir.path(), test_config()).await.unwrap();
    refs.set_reference("a", "s0").await.unwrap();
    refs.set_reference("b", "s0").await.unwrap();

    let removed = refs
        .delete_references(&["a".to_string(), "b".to_string(), "zzz".to_string()])
        .await
        .unwrap();

    assert_eq!(removed, 2);
    assert!(refs.get_all_references().await.unwrap().is_empty());
}

// =============================================================================
// File Management Tests
// =============================================================================

#[tokio::test]
async fn test_rollover_at_size_bound() {
    let dir = setup_temp_dir();
    let config = Arc::new(Config::builder().reference_max_bytes(32).build());
    let refs = Referencer::open(dir.path(), config.clone()).await.unwrap();

    for i in 0..10 {
        refs.set_reference(&format!("key{i}"), "main_0001_0000.json")
            .await
            .unwrap();
    }

    assert!(refs.file_count().await.unwrap() > 1);

    let reopened = Referencer::open(dir.path(), config).await.unwrap();
    let all = reopened.get_all_references().await.unwrap();
    assert_eq!(all.len(), 10);
    assert!(all.values().all(|entry| entry.files.len() == 1));
}

#[tokio::test]
async fn test_restart_replaces_everything() {
    let dir = setup_temp_dir();
    let refs = Referencer::open(dir.path(), test_config()).await.unwrap();
    refs.set_reference("old", "s0").await.unwrap();

    refs.restart(vec![
        ("a".to_string(), "t0".to_string()),
        ("b".to_string(), "t1".to_string()),
    ])
    .await
    .unwrap();

    assert_eq!(refs.get_reference("old").await.unwrap(), None);
    assert_eq!(refs.get_reference("b").await.unwrap().as_deref(), Some("t1"));

    let reopened = Referencer::open(dir.path(), test_config()).await.unwrap();
    assert_eq!(reopened.get_all_references().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_clear() {
    let dir = setup_temp_dir();
    let refs = Referencer::open(dir.path(), test_config()).await.unwrap();
    refs.set_reference("a", "s0").await.unwrap();

    refs.clear().await.unwrap();

    assert_eq!(refs.len(), Some(0));
    assert_eq!(refs.file_count().await.unwrap(), 0);
}

// =============================================================================
// Cache Policy Tests
// =============================================================================

#[tokio::test]
async fn test_timed_index_reloads_from_disk() {
    let dir = setup_temp_dir();
    let config = Arc::new(
        Config::builder()
            .reference_cache(ReferenceCachePolicy::Timed(Duration::from_millis(250)))
            .build(),
    );
    let reader = Referencer::open(dir.path(), config.clone()).await.unwrap();
    assert_eq!(reader.get_reference("a").await.unwrap(), None);

    // A second handle appends behind the warm index
    let writer = Referencer::open(dir.path(), config).await.unwrap();
    writer.set_reference("a", "s0").await.unwrap();
    assert_eq!(reader.get_reference("a").await.unwrap(), None);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(reader.get_reference("a").await.unwrap().as_deref(), Some("s0"));
}
