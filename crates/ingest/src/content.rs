//! Content-addressed storage of repackaged entries.

use crate::archive::{ArchiveReader, ZipArchiveReader};
use crate::error::{IngestError, Result};
use crate::retry::{RetryPolicy, deadline_exceeded, with_deadline};
use bytes::Bytes;
use romvault_core::{Fingerprint, FingerprintSink, ObjectPath};
use romvault_storage::{ObjectStore, StorageError, StreamingUpload};
use serde::Serialize;
use std::io::{self, Cursor};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::instrument;

/// Read size when streaming a staged file to the store (1 MiB).
const UPLOAD_READ_SIZE: usize = 1024 * 1024;

/// Result of [`ContentStore::put_if_absent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// Content under this path was already present.
    Skipped,
    Uploaded { bytes: u64 },
}

/// Result of [`ContentStore::verify`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerifyOutcome {
    /// Nothing is stored at the path.
    Missing,
    /// The stored entry hashes to the expected fingerprint.
    Verified,
    /// The stored entry hashes to `found` instead.
    Mismatch { found: Fingerprint },
}

/// Writes repackaged entries to the target store, once per object path.
#[derive(Clone)]
pub struct ContentStore {
    store: Arc<dyn ObjectStore>,
    operation_timeout: Duration,
    retry: RetryPolicy,
}

impl ContentStore {
    pub fn new(store: Arc<dyn ObjectStore>, operation_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            store,
            operation_timeout,
            retry,
        }
    }

    /// Object path for an entry with the given fingerprint.
    pub fn path(&self, entry_name: &str, fingerprint: &Fingerprint) -> Result<ObjectPath> {
        Ok(ObjectPath::new(entry_name, fingerprint)?)
    }

    /// Whether any stored key starts with `path`.
    pub async fn exists(&self, path: &ObjectPath) -> Result<bool> {
        self.retry
            .run("exists", || async {
                with_deadline(
                    self.operation_timeout,
                    "exists",
                    self.store.exists_with_prefix(path.as_str()),
                )
                .await
                .map_err(|e| IngestError::from_probe(path, e))
            })
            .await
    }

    /// Upload `local_file` to `path` unless something is already stored there.
    ///
    /// Check-then-put without locking: two concurrent runs may both upload,
    /// and the second write replaces identical bytes.
    #[instrument(skip(self, local_file, path), fields(backend = self.store.backend_name(), object_path = %path))]
    pub async fn put_if_absent(&self, local_file: &Path, path: &ObjectPath) -> Result<PutOutcome> {
        if self.exists(path).await? {
            tracing::debug!(object_path = %path, "Already stored");
            return Ok(PutOutcome::Skipped);
        }

        let bytes = self
            .retry
            .run("upload", || self.upload_once(local_file, path))
            .await?;

        tracing::debug!(object_path = %path, bytes, "Uploaded");
        Ok(PutOutcome::Uploaded { bytes })
    }

    /// One upload attempt under the operation deadline. A partial upload is
    /// aborted before any error, the deadline included, is returned.
    async fn upload_once(&self, local_file: &Path, path: &ObjectPath) -> Result<u64> {
        let read_failed =
            |e: io::Error| IngestError::local_io(format!("reading {}", local_file.display()), e);
        let timed_out =
            || IngestError::from_upload(path, deadline_exceeded("upload", self.operation_timeout));
        let deadline = Instant::now() + self.operation_timeout;

        let mut file = tokio::fs::File::open(local_file).await.map_err(read_failed)?;
        let mut upload = match tokio::time::timeout_at(deadline, self.store.put_stream(path.as_str())).await {
            Ok(started) => started.map_err(|e| IngestError::from_upload(path, e))?,
            Err(_) => return Err(timed_out()),
        };

        let copy = async {
            let mut buf = vec![0u8; UPLOAD_READ_SIZE];
            loop {
                let n = file.read(&mut buf).await.map_err(read_failed)?;
                if n == 0 {
                    return Ok::<(), IngestError>(());
                }
                upload
                    .write(Bytes::copy_from_slice(&buf[..n]))
                    .await
                    .map_err(|e| IngestError::from_upload(path, e))?;
            }
        };
        let copied = tokio::time::timeout_at(deadline, copy)
            .await
            .unwrap_or_else(|_| Err(timed_out()));

        if let Err(err) = copied {
            self.abort(upload, path).await;
            return Err(err);
        }

        match tokio::time::timeout_at(deadline, upload.finish()).await {
            Ok(finished) => finished.map_err(|e| IngestError::from_upload(path, e)),
            Err(_) => Err(timed_out()),
        }
    }

    async fn abort(&self, upload: Box<dyn StreamingUpload>, path: &ObjectPath) {
        match tokio::time::timeout(self.operation_timeout, upload.abort()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(object_path = %path, error = %e, "Failed to abort partial upload");
            }
            Err(_) => {
                tracing::warn!(object_path = %path, "Timed out aborting partial upload");
            }
        }
    }

    /// Download the object at `path` and check that its entry hashes to
    /// `expected`. The object is read into memory.
    #[instrument(skip(self, path, expected), fields(backend = self.store.backend_name(), object_path = %path))]
    pub async fn verify(&self, path: &ObjectPath, expected: &Fingerprint) -> Result<VerifyOutcome> {
        let fetched = self
            .retry
            .run("verify", || async {
                match with_deadline(self.operation_timeout, "get", self.store.get(path.as_str())).await {
                    Ok(data) => Ok(Some(data)),
                    Err(StorageError::NotFound(_)) => Ok(None),
                    Err(e) => Err(IngestError::from_fetch(path.as_str(), e)),
                }
            })
            .await?;

        let Some(data) = fetched else {
            tracing::info!(object_path = %path, "Nothing stored at path");
            return Ok(VerifyOutcome::Missing);
        };

        let label = path.to_string();
        let entry_name = path.entry_name().to_string();
        let found = tokio::task::spawn_blocking(move || stored_fingerprint(data, &label, &entry_name))
            .await
            .map_err(|e| IngestError::local_io("verifying object", io::Error::other(e)))??;

        if found == *expected {
            tracing::info!(object_path = %path, "Stored content verified");
            Ok(VerifyOutcome::Verified)
        } else {
            tracing::warn!(object_path = %path, expected = %expected, found = %found, "Stored content differs");
            Ok(VerifyOutcome::Mismatch { found })
        }
    }
}

/// Fingerprint of the entry named `entry_name` inside a stored zip.
fn stored_fingerprint(data: Bytes, label: &str, entry_name: &str) -> Result<Fingerprint> {
    let corrupt = |reason: String| IngestError::CorruptArchive {
        archive: label.to_string(),
        reason,
    };

    let mut reader = ZipArchiveReader::new(Cursor::new(data), label)?;
    let index = reader
        .entries()
        .iter()
        .find(|entry| !entry.is_dir && entry.name == entry_name)
        .map(|entry| entry.index)
        .ok_or_else(|| corrupt(format!("no entry named {entry_name}")))?;

    let mut input = reader.open_entry(index)?;
    let mut sink = FingerprintSink::new(io::sink());
    io::copy(&mut input, &mut sink).map_err(|e| corrupt(format!("{entry_name}: {e}")))?;
    Ok(sink.digest()?)
}
