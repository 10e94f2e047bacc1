//! Log pipeline end-to-end: history replay, live follow, trims, cleanup and
//! legacy import.
use async_trait::async_trait;
use mantle_logstore::{LiveMachines, LogConfig, StoreManager};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tempfile::TempDir;

struct FixedLive(Vec<String>);

#[async_trait]
impl LiveMachines for FixedLive {
    async fn live_machine_ids(&self) -> Vec<String> {
        self.0.clone()
    }
}

fn open(dir: &TempDir, tweak: impl FnOnce(&mut LogConfig)) -> StoreManager {
    let mut config = LogConfig {
        path: dir.path().join("machine-logs.db"),
        ..LogConfig::default()
    };
    tweak(&mut config);
    StoreManager::open(config).unwrap()
}

#[tokio::test]
async fn follow_reader_replays_history_then_streams_live_writes() {
    let dir = TempDir::new().unwrap();
    let manager = open(&dir, |c| c.cleanup_probability = 0.0);
    let store = manager.machine_store("m1");

    for i in 0..1000 {
        store.write_line(format!("line {i}").as_bytes()).unwrap();
    }

    let mut reader = store.reader(100, true).unwrap();
    for i in 900..1000 {
        let line = reader.read_line().await.unwrap().unwrap();
        assert_eq!(line, format!("line {i}").as_bytes());
    }

    // The reader is at the tail now; two more writes must arrive in order.
    store.write_line(b"tail 1").unwrap();
    store.write_line(b"tail 2").unwrap();
    assert_eq!(reader.read_line().await.unwrap().unwrap(), b"tail 1");
    assert_eq!(reader.read_line().await.unwrap().unwrap(), b"tail 2");

    reader.close();
    assert!(reader.read_line().await.unwrap().is_none());
}

#[tokio::test]
async fn non_follow_reader_ends_at_exhaustion() {
    let dir = TempDir::new().unwrap();
    let manager = open(&dir, |c| c.cleanup_probability = 0.0);
    let store = manager.machine_store("m1");
    for i in 0..5 {
        store.write_line(format!("l{i}").as_bytes()).unwrap();
    }

    // Negative count reads from the beginning.
    let mut reader = store.reader(-1, false).unwrap();
    let mut seen = Vec::new();
    while let Some(line) = reader.read_line().await.unwrap() {
        seen.push(line);
    }
    assert_eq!(seen.len(), 5);
    assert_eq!(seen[0], b"l0");

    // Zero count starts empty.
    let mut reader = store.reader(0, false).unwrap();
    assert!(reader.read_line().await.unwrap().is_none());
}

#[tokio::test]
async fn zero_count_follow_reader_sees_only_new_lines() {
    let dir = TempDir::new().unwrap();
    let manager = open(&dir, |c| c.cleanup_probability = 0.0);
    let store = manager.machine_store("m1");
    store.write_line(b"old").unwrap();

    let mut reader = store.reader(0, true).unwrap();
    store.write_line(b"new").unwrap();
    assert_eq!(reader.read_line().await.unwrap().unwrap(), b"new");
}

#[tokio::test]
async fn deterministic_trim_keeps_the_row_cap() {
    let dir = TempDir::new().unwrap();
    let manager = open(&dir, |c| {
        c.cleanup_probability = 1.0;
        c.max_lines_per_machine = 10;
    });
    let store = manager.machine_store("m1");
    for i in 0..50 {
        store.write_line(format!("line {i}").as_bytes()).unwrap();
    }

    let mut reader = store.reader(-1, false).unwrap();
    let mut seen = Vec::new();
    while let Some(line) = reader.read_line().await.unwrap() {
        seen.push(String::from_utf8(line).unwrap());
    }
    assert_eq!(seen.len(), 10);
    assert_eq!(seen.last().unwrap(), "line 49");
}

#[tokio::test]
async fn writes_are_truncated_to_bounds() {
    let dir = TempDir::new().unwrap();
    let manager = open(&dir, |c| c.cleanup_probability = 0.0);

    let long_id = "m".repeat(300);
    let store = manager.machine_store(&long_id);
    assert_eq!(store.machine_id().chars().count(), 128);

    let big = vec![b'x'; 64 * 1024];
    store.write_line(&big).unwrap();
    let mut reader = store.reader(1, false).unwrap();
    let line = reader.read_line().await.unwrap().unwrap();
    assert_eq!(line.len(), 16 * 1024);
}

#[tokio::test]
async fn cleanup_removes_orphans_and_aged_rows() {
    let dir = TempDir::new().unwrap();
    fn past() -> i64 {
        1_000_000
    }
    let manager = open(&dir, |c| {
        c.cleanup_probability = 0.0;
        c.cleanup_older_than = Duration::from_secs(3600);
        c.now = past;
    });
    let live = manager.machine_store("live");
    let orphan = manager.machine_store("orphan");
    live.write_line(b"keep").unwrap();
    orphan.write_line(b"drop").unwrap();

    // Nothing is older than an hour yet; only the orphan goes.
    manager
        .cleanup(&FixedLive(vec!["live".into()]))
        .await
        .unwrap();
    let mut reader = live.reader(-1, false).unwrap();
    assert!(reader.read_line().await.unwrap().is_some());
    let mut reader = orphan.reader(-1, false).unwrap();
    assert!(reader.read_line().await.unwrap().is_none());
}

#[tokio::test]
async fn size_budget_drops_oldest_rows_first() {
    let dir = TempDir::new().unwrap();
    let manager = open(&dir, |c| {
        c.cleanup_probability = 0.0;
        c.max_size = Some(64 * 1024);
    });
    let store = manager.machine_store("m1");
    for i in 0..200 {
        let mut line = format!("line {i} ").into_bytes();
        line.resize(4096, b'.');
        store.write_line(&line).unwrap();
    }
    manager
        .cleanup(&FixedLive(vec!["m1".into()]))
        .await
        .unwrap();

    let mut reader = store.reader(-1, false).unwrap();
    let mut lines = Vec::new();
    while let Some(line) = reader.read_line().await.unwrap() {
        lines.push(String::from_utf8_lossy(&line).into_owned());
    }
    assert!(lines.len() < 200, "cleanup must shed rows, kept {}", lines.len());
    // Oldest rows go first.
    assert!(!lines.iter().any(|l| l.starts_with("line 0 ")));
}

#[tokio::test]
async fn closed_manager_rejects_writes_and_ends_readers() {
    let dir = TempDir::new().unwrap();
    let manager = open(&dir, |c| c.cleanup_probability = 0.0);
    let store = manager.machine_store("m1");
    store.write_line(b"x").unwrap();
    let mut reader = store.reader(-1, true).unwrap();

    manager.close();
    assert!(store.write_line(b"y").is_err());
    assert!(reader.read_line().await.unwrap().is_none());
}

#[tokio::test]
async fn legacy_logs_are_imported_once_verified() {
    let dir = TempDir::new().unwrap();
    let contents = b"old line 1\nold line 2\n";
    std::fs::write(dir.path().join("m1.log"), contents).unwrap();
    let digest = Sha256::digest(contents);
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    std::fs::write(dir.path().join("m1.log.sha256sum"), hex).unwrap();

    // No sidecar: stale, removed without import.
    std::fs::write(dir.path().join("m2.log"), b"stale\n").unwrap();

    let manager = open(&dir, |c| c.cleanup_probability = 0.0);
    let store = manager.machine_store("m1");
    let mut reader = store.reader(-1, false).unwrap();
    assert_eq!(reader.read_line().await.unwrap().unwrap(), b"old line 1");
    assert_eq!(reader.read_line().await.unwrap().unwrap(), b"old line 2");
    assert!(reader.read_line().await.unwrap().is_none());

    assert!(!dir.path().join("m1.log").exists());
    assert!(!dir.path().join("m1.log.sha256sum").exists());
    assert!(!dir.path().join("m2.log").exists());

    let m2 = manager.machine_store("m2");
    let mut reader = m2.reader(-1, false).unwrap();
    assert!(reader.read_line().await.unwrap().is_none());
}
