mod common;

use common::{FaultyStore, files_in, seeded_bytes};
use romvault_core::config::TransferConfig;
use romvault_ingest::{ChunkedTransfer, IngestError, RetryPolicy};
use romvault_storage::{MemoryBackend, ObjectStore};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::tempdir;

const THRESHOLD: u64 = 1024;

fn transfer(store: Arc<dyn ObjectStore>, temp_dir: &Path, retries: u32) -> ChunkedTransfer {
    transfer_with(store, temp_dir, retries, 3, 5)
}

fn transfer_with(
    store: Arc<dyn ObjectStore>,
    temp_dir: &Path,
    retries: u32,
    max_concurrent_chunks: usize,
    operation_timeout_secs: u64,
) -> ChunkedTransfer {
    let config = TransferConfig {
        chunk_threshold: THRESHOLD,
        max_concurrent_chunks,
        operation_timeout_secs,
        temp_dir: Some(temp_dir.to_path_buf()),
    };
    let retry = RetryPolicy::new(retries, Duration::from_millis(1), Duration::from_millis(4));
    ChunkedTransfer::new(store, &config, retry)
}

#[tokio::test]
async fn test_reassembly_around_threshold() {
    let tmp = tempdir().unwrap();
    let t = THRESHOLD as usize;

    for (seed, size) in [t - 1, t, t + 1, 2 * t, 2 * t + 1].into_iter().enumerate() {
        let store = Arc::new(FaultyStore::new(MemoryBackend::new()));
        let data = seeded_bytes(seed as u64, size);
        store.put("uploads/set.zip", data.clone()).await.unwrap();

        let local = transfer(store.clone(), tmp.path(), 0)
            .fetch("uploads/set.zip")
            .await
            .unwrap();

        assert_eq!(local.size(), size as u64);
        assert_eq!(std::fs::read(local.path()).unwrap(), data, "size {size}");

        let expected_ranges = if size as u64 <= THRESHOLD {
            0
        } else {
            size.div_ceil(t)
        };
        assert_eq!(
            store.range_calls.load(Ordering::SeqCst),
            expected_ranges,
            "size {size}"
        );

        // Only the assembled file remains while it is held.
        assert_eq!(files_in(tmp.path()).len(), 1);
        drop(local);
        assert!(files_in(tmp.path()).is_empty());
    }
}

#[tokio::test]
async fn test_reverse_completion_keeps_index_order() {
    let tmp = tempdir().unwrap();
    let store = Arc::new(FaultyStore::new(MemoryBackend::new()));
    let data = seeded_bytes(11, 5 * THRESHOLD as usize + 17);
    store.put("set.zip", data.clone()).await.unwrap();
    store.complete_ranges_in_reverse(THRESHOLD, 6, Duration::from_millis(25));

    let local = transfer_with(store.clone(), tmp.path(), 0, 6, 5)
        .fetch("set.zip")
        .await
        .unwrap();

    let reversed: Vec<u64> = (0..6).rev().map(|i| i * THRESHOLD).collect();
    assert_eq!(store.completed_ranges(), reversed);
    assert_eq!(std::fs::read(local.path()).unwrap(), data);
}

#[tokio::test]
async fn test_chunk_deadline_cleans_up() {
    let tmp = tempdir().unwrap();
    let store = Arc::new(FaultyStore::new(MemoryBackend::new()));
    store
        .put("big.zip", seeded_bytes(5, 4 * THRESHOLD as usize + 1))
        .await
        .unwrap();
    store.stall_range_at(3 * THRESHOLD, Duration::from_secs(30));

    let err = transfer_with(store.clone(), tmp.path(), 0, 5, 1)
        .fetch("big.zip")
        .await
        .unwrap_err();

    match &err {
        IngestError::TransferFailed { reason, .. } => assert!(reason.contains("exceeded"), "{reason}"),
        other => panic!("unexpected error: {other:?}"),
    }
    // The other ranges landed on disk before the stalled one timed out.
    assert_eq!(store.completed_ranges().len(), 4);
    assert!(files_in(tmp.path()).is_empty());
}

#[tokio::test]
async fn test_chunk_failure_cleans_up() {
    let tmp = tempdir().unwrap();
    let store = Arc::new(FaultyStore::new(MemoryBackend::new()));
    store
        .put("big.zip", seeded_bytes(7, 4 * THRESHOLD as usize + 1))
        .await
        .unwrap();
    store.fail_range_at(2 * THRESHOLD, usize::MAX);

    let err = transfer(store.clone(), tmp.path(), 1)
        .fetch("big.zip")
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::TransferFailed { .. }), "{err:?}");
    assert!(files_in(tmp.path()).is_empty());
}

#[tokio::test]
async fn test_failed_chunk_is_retried() {
    let tmp = tempdir().unwrap();
    let store = Arc::new(FaultyStore::new(MemoryBackend::new()));
    let data = seeded_bytes(9, 3 * THRESHOLD as usize);
    store.put("set.zip", data.clone()).await.unwrap();
    store.fail_range_at(THRESHOLD, 2);

    let local = transfer(store.clone(), tmp.path(), 2)
        .fetch("set.zip")
        .await
        .unwrap();

    assert_eq!(std::fs::read(local.path()).unwrap(), data);
    assert_eq!(store.range_calls.load(Ordering::SeqCst), 3 + 2);
}

#[tokio::test]
async fn test_missing_object_not_retried() {
    let tmp = tempdir().unwrap();
    let store = Arc::new(MemoryBackend::new());

    let err = transfer(store, tmp.path(), 3)
        .fetch("uploads/absent.zip")
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::ObjectNotFound { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_keep_survives_drop() {
    let tmp = tempdir().unwrap();
    let store = Arc::new(MemoryBackend::new());
    store
        .put("set.zip", seeded_bytes(3, 10))
        .await
        .unwrap();

    let local = transfer(store, tmp.path(), 0)
        .fetch("set.zip")
        .await
        .unwrap();
    let kept = local.keep().unwrap();

    assert_eq!(std::fs::read(&kept).unwrap().len(), 10);
    std::fs::remove_file(kept).unwrap();
}
