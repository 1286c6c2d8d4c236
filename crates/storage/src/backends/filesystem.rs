//! Local filesystem storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteRange, ByteStream, ObjectMeta, ObjectStore, StreamingUpload};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;
use uuid::Uuid;

/// Default chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum range size for get_range operations (128 MiB).
const MAX_RANGE_SIZE: u64 = 128 * 1024 * 1024;

/// Marker embedded in in-flight write files; such files are never listed.
const TEMP_MARKER: &str = ".~inflight.";

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend, creating the root if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path under the root, off the async runtime.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || resolve_key(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Sibling path used while a write is in flight.
    fn temp_path_for(path: &Path) -> PathBuf {
        let suffix = format!("{TEMP_MARKER}{}", Uuid::new_v4());
        let name = path
            .file_name()
            .map(|n| format!("{}{suffix}", n.to_string_lossy()))
            .unwrap_or(suffix);
        path.with_file_name(name)
    }

    /// Walk `base` and collect keys of regular files, skipping symlinks and
    /// in-flight writes.
    async fn walk(&self, base: PathBuf) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        match fs::try_exists(&base).await {
            Ok(true) => {}
            Ok(false) => return Ok(keys),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(StorageError::Io(e)),
        }

        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotADirectory => {
                    // The prefix named a file rather than a directory.
                    if let Ok(rel) = dir.strip_prefix(&self.root) {
                        keys.push(key_string(rel));
                    }
                    continue;
                }
                Err(e) => return Err(StorageError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file()
                    && !entry.file_name().to_string_lossy().contains(TEMP_MARKER)
                    && let Ok(rel) = path.strip_prefix(&self.root)
                {
                    keys.push(key_string(rel));
                }
            }
        }
        Ok(keys)
    }
}

/// Storage keys always use `/`, whatever the platform separator.
fn key_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn map_not_found(key: &str, e: std::io::Error) -> StorageError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(e)
    }
}

/// Map a key to a path under `root`, refusing anything that could escape it.
///
/// Keys must be relative and made only of normal components. The deepest
/// existing ancestor of the resulting path is canonicalized and must stay
/// inside the canonical root, which also catches symlinks pointing outside.
fn resolve_key(root: &Path, key: &str) -> StorageResult<PathBuf> {
    if key.starts_with('/') || key.starts_with('\\') {
        return Err(StorageError::InvalidKey(format!(
            "path traversal not allowed: {key}"
        )));
    }
    if !Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(StorageError::InvalidKey(format!(
            "contains unsafe path component: {key}"
        )));
    }

    let path = root.join(key);
    let canonical_root = root.canonicalize().map_err(|e| {
        StorageError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to canonicalize root: {e}"),
        ))
    })?;

    let mut candidate = Some(path.as_path());
    while let Some(current) = candidate {
        match std::fs::symlink_metadata(current) {
            Ok(meta) => {
                let resolved = current.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidKey(format!("dangling symlink in key: {key}"))
                    } else {
                        StorageError::Io(e)
                    }
                })?;
                if !resolved.starts_with(&canonical_root) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {key}"
                    )));
                }
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                candidate = current.parent();
            }
            Err(e) => return Err(StorageError::Io(e)),
        }
    }
    Ok(path)
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        Ok(fs::metadata(&path).await.is_ok_and(|m| m.is_file()))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists_with_prefix(&self, prefix: &str) -> StorageResult<bool> {
        // Only the directory holding the last prefix component needs walking.
        let dir = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let base = self.key_path(dir).await?;
        let keys = self.walk(base).await?;
        Ok(keys.iter().any(|k| k.starts_with(prefix)))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| map_not_found(key, e))?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(key.to_string()));
        }

        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
            content_type: None,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path).await.map_err(|e| map_not_found(key, e))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let path = self.key_path(key).await?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| map_not_found(key, e))?;

        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "filesystem", range = %range))]
    async fn get_range(&self, key: &str, range: ByteRange) -> StorageResult<Bytes> {
        range.validate()?;

        let path = self.key_path(key).await?;
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| map_not_found(key, e))?;
        let object_size = file.metadata().await?.len();

        let end = range.end.unwrap_or(object_size);
        if range.start > object_size || end > object_size {
            return Err(StorageError::InvalidRange(format!(
                "range {range} outside object of {object_size} bytes"
            )));
        }

        let range_size = end - range.start;
        if range_size > MAX_RANGE_SIZE {
            return Err(StorageError::InvalidRange(format!(
                "range size {range_size} exceeds maximum {MAX_RANGE_SIZE} bytes"
            )));
        }
        let len = usize::try_from(range_size).map_err(|_| {
            StorageError::InvalidRange(format!(
                "range size {range_size} exceeds platform address space"
            ))
        })?;

        file.seek(std::io::SeekFrom::Start(range.start)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;

        Ok(Bytes::from(buf))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;

        // Write beside the target, fsync, then rename so readers never see a
        // partially written object.
        let temp_path = Self::temp_path_for(&path);
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }

        Ok(())
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> StorageResult<bool> {
        // Check-then-write races with concurrent writers of the same key.
        // Keys are content-derived, so the loser overwrites identical bytes.
        if self.exists(key).await? {
            return Ok(false);
        }

        self.put(key, data).await?;
        Ok(true)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;

        let temp_path = Self::temp_path_for(&path);
        let file = fs::File::create(&temp_path).await?;

        Ok(Box::new(FilesystemUpload {
            file: Some(file),
            temp_path,
            final_path: path,
            bytes_written: 0,
            settled: false,
        }))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let base = self.key_path(prefix).await?;
        self.walk(base).await
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}

/// Streaming upload for filesystem backend.
///
/// Data goes to a sibling temp file that is renamed into place on
/// [`StreamingUpload::finish`]. Dropping the upload unfinished removes the
/// temp file, so a cancelled upload leaves nothing behind.
struct FilesystemUpload {
    file: Option<fs::File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
    settled: bool,
}

impl FilesystemUpload {
    fn file(&mut self) -> StorageResult<&mut fs::File> {
        self.file.as_mut().ok_or_else(|| {
            StorageError::Io(std::io::Error::other("upload already finished"))
        })
    }
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.file()?.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        let file = self.file()?;
        file.sync_all().await?;
        self.file = None;

        fs::rename(&self.temp_path, &self.final_path).await?;
        self.settled = true;
        Ok(self.bytes_written)
    }

    async fn abort(mut self: Box<Self>) -> StorageResult<()> {
        self.file = None;
        let _ = fs::remove_file(&self.temp_path).await;
        self.settled = true;
        Ok(())
    }
}

impl Drop for FilesystemUpload {
    fn drop(&mut self) {
        if !self.settled {
            self.file = None;
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}
