//! In-process storage backend.
//!
//! Objects live in a sorted map, so prefix queries are range scans. Used as
//! a test double and for dry runs; nothing survives the process.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteRange, ByteStream, ObjectMeta, ObjectStore, StreamingUpload};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::instrument;

/// Chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

type Objects = Arc<RwLock<BTreeMap<String, Bytes>>>;

/// Object store backed by an in-memory map. Clones share the same objects.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    objects: Objects,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// All keys, in lexicographic order.
    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    async fn object(&self, key: &str) -> StorageResult<Bytes> {
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    #[instrument(skip(self), fields(backend = "memory"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn exists_with_prefix(&self, prefix: &str) -> StorageResult<bool> {
        let objects = self.objects.read().await;
        let first = objects.range(prefix.to_string()..).next();
        Ok(first.is_some_and(|(key, _)| key.starts_with(prefix)))
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let data = self.object(key).await?;
        Ok(ObjectMeta {
            size: data.len() as u64,
            last_modified: None,
            content_type: None,
        })
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.object(key).await
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let data = self.object(key).await?;
        let chunks: Vec<StorageResult<Bytes>> = (0..data.len())
            .step_by(STREAM_CHUNK_SIZE)
            .map(|start| Ok(data.slice(start..(start + STREAM_CHUNK_SIZE).min(data.len()))))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    #[instrument(skip(self), fields(backend = "memory", range = %range))]
    async fn get_range(&self, key: &str, range: ByteRange) -> StorageResult<Bytes> {
        range.validate()?;
        let data = self.object(key).await?;
        let size = data.len() as u64;
        let end = range.end.unwrap_or(size);
        if range.start > size || end > size {
            return Err(StorageError::InvalidRange(format!(
                "range {range} outside object of {size} bytes"
            )));
        }
        Ok(data.slice(range.start as usize..end as usize))
    }

    #[instrument(skip(self, data), fields(backend = "memory", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.objects.write().await.insert(key.to_string(), data);
        Ok(())
    }

    #[instrument(skip(self, data), fields(backend = "memory", size = data.len()))]
    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> StorageResult<bool> {
        let mut objects = self.objects.write().await;
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(key.to_string(), data);
        Ok(true)
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        Ok(Box::new(MemoryUpload {
            objects: Arc::clone(&self.objects),
            key: key.to_string(),
            buffer: BytesMut::new(),
        }))
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Buffers the whole object; it becomes visible on `finish`.
struct MemoryUpload {
    objects: Objects,
    key: String,
    buffer: BytesMut,
}

#[async_trait]
impl StreamingUpload for MemoryUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        self.buffer.extend_from_slice(&data);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        let MemoryUpload {
            objects,
            key,
            buffer,
        } = *self;
        let len = buffer.len() as u64;
        objects.write().await.insert(key, buffer.freeze());
        Ok(len)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        Ok(())
    }
}
