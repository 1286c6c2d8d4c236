//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::fmt;
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncReadExt;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Read size used when streaming local files into uploads (1 MiB).
const UPLOAD_READ_SIZE: usize = 1024 * 1024;

/// A byte range within an object: `start..end`, or `start..` to the end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Half-open range `[start, end)`.
    pub fn bounded(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Everything from `start` to the end of the object.
    pub fn to_end(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Length of a bounded range; `None` for open-ended ranges.
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Reject inverted ranges.
    pub fn validate(&self) -> StorageResult<()> {
        match self.end {
            Some(end) if end < self.start => Err(StorageError::InvalidRange(format!(
                "end ({}) < start ({})",
                end, self.start
            ))),
            _ => Ok(()),
        }
    }

    /// HTTP `Range` header value (inclusive end).
    pub fn to_header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end.saturating_sub(1)),
            None => format!("bytes={}-", self.start),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}..{}", self.start, end),
            None => write!(f, "{}..", self.start),
        }
    }
}

/// Object store abstraction for content-addressed storage.
///
/// One instance addresses one bucket (or one directory tree); keys are
/// relative to it.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Check whether any object key starts with `prefix`.
    async fn exists_with_prefix(&self, prefix: &str) -> StorageResult<bool>;

    /// Get an object's size without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Get an object as a byte stream.
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream>;

    /// Get a range of bytes from an object.
    ///
    /// Open-ended ranges read to the end of the object.
    async fn get_range(&self, key: &str, range: ByteRange) -> StorageResult<Bytes>;

    /// Put an object atomically.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Put an object only if it doesn't exist.
    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> StorageResult<bool>;

    /// Start a streaming upload.
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>>;

    /// Upload a local file, streaming it through [`ObjectStore::put_stream`].
    ///
    /// Returns the number of bytes uploaded. The upload is aborted if reading
    /// the file fails part-way.
    async fn put_file(&self, key: &str, path: &Path) -> StorageResult<u64> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut upload = self.put_stream(key).await?;
        let mut buf = vec![0u8; UPLOAD_READ_SIZE];
        loop {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    let _ = upload.abort().await;
                    return Err(StorageError::Io(e));
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = upload.write(Bytes::copy_from_slice(&buf[..n])).await {
                let _ = upload.abort().await;
                return Err(e);
            }
        }
        upload.finish().await
    }

    /// List objects with a prefix.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Get the name of this storage backend.
    ///
    /// Returns a static string identifier for the backend type (e.g., "s3", "filesystem").
    /// Used for logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// don't require connectivity verification.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
    /// Content type (if available).
    pub content_type: Option<String>,
}

/// Trait for streaming uploads.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Finish the upload and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abort the upload.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}
