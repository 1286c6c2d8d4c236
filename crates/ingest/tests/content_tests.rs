mod common;

use common::FaultyStore;
use romvault_core::Fingerprint;
use romvault_ingest::{ContentStore, IngestError, RetryPolicy};
use romvault_storage::{FilesystemBackend, ObjectStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn all_files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                found.push(path);
            }
        }
    }
    found
}

#[tokio::test]
async fn test_upload_deadline_leaves_no_partial_object() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("store");
    let backend = FilesystemBackend::new(&root).await.unwrap();
    let store = Arc::new(FaultyStore::new(backend));
    store.stall_writes(Duration::from_secs(30));

    let staged = tmp.path().join("staged.zip");
    std::fs::write(&staged, vec![5u8; 4096]).unwrap();

    let retry = RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1));
    let content = ContentStore::new(store.clone(), Duration::from_millis(100), retry);
    let path = content.path("g20.bin", &Fingerprint::compute(b"g20")).unwrap();

    let err = content.put_if_absent(&staged, &path).await.unwrap_err();

    assert!(matches!(err, IngestError::TransferFailed { .. }), "{err:?}");
    let leaked: Vec<_> = all_files(&root)
        .into_iter()
        .filter(|p| p.to_string_lossy().contains(".~inflight."))
        .collect();
    assert!(leaked.is_empty(), "{leaked:?}");
    assert!(!store.exists_with_prefix(path.as_str()).await.unwrap());
    assert!(staged.exists());
}

#[tokio::test]
async fn test_upload_to_filesystem_lands_atomically() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("store");
    let backend = FilesystemBackend::new(&root).await.unwrap();
    let content = ContentStore::new(Arc::new(backend), Duration::from_secs(5), RetryPolicy::none());

    let staged = tmp.path().join("staged.zip");
    std::fs::write(&staged, vec![9u8; 3 * 1024 * 1024 + 1]).unwrap();
    let path = content.path("big.bin", &Fingerprint::compute(b"big")).unwrap();

    content.put_if_absent(&staged, &path).await.unwrap();

    let files = all_files(&root);
    assert_eq!(files, vec![root.join(path.as_str())]);
    assert_eq!(std::fs::metadata(&files[0]).unwrap().len(), 3 * 1024 * 1024 + 1);
}
