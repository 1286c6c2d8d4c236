//! Downloading source objects to local temp files.
//!
//! Objects up to the chunk threshold are streamed in one request. Larger
//! objects are split into fixed-size byte ranges that are fetched
//! concurrently into their own temp files and then concatenated in index
//! order.

use crate::error::{IngestError, Result};
use crate::retry::{RetryPolicy, deadline_exceeded, with_deadline};
use bytes::Bytes;
use futures::TryStreamExt;
use romvault_core::config::TransferConfig;
use romvault_storage::{ByteRange, ByteStream, ObjectStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempPath;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::instrument;

/// One byte range of a chunked download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferChunk {
    pub index: usize,
    pub offset: u64,
    /// `None` for the final chunk, which reads to the end of the object.
    pub length: Option<u64>,
}

impl TransferChunk {
    pub fn range(&self) -> ByteRange {
        match self.length {
            Some(length) => ByteRange::bounded(self.offset, self.offset + length),
            None => ByteRange::to_end(self.offset),
        }
    }

    /// Bytes this chunk should yield from an object of `size` bytes.
    pub fn expected_len(&self, size: u64) -> u64 {
        self.length
            .unwrap_or_else(|| size.saturating_sub(self.offset))
    }
}

/// Partition `[0, size)` into `chunk_size` pieces. Every chunk but the last
/// has a bounded length; the last reads to the end of the object.
pub fn plan_chunks(size: u64, chunk_size: u64) -> Vec<TransferChunk> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(size.div_ceil(chunk_size) as usize);
    let mut offset = 0;

    while offset < size {
        let length = (offset + chunk_size < size).then_some(chunk_size);
        chunks.push(TransferChunk {
            index: chunks.len(),
            offset,
            length,
        });
        offset += chunk_size;
    }

    chunks
}

/// A downloaded range, alive until reassembly.
#[derive(Debug)]
pub struct FetchedChunk {
    pub chunk: TransferChunk,
    pub local_path: TempPath,
}

/// A downloaded object. The file is deleted when this is dropped unless it
/// was handed off with [`LocalObject::into_temp_path`] or [`LocalObject::keep`].
#[derive(Debug)]
pub struct LocalObject {
    path: TempPath,
    size: u64,
}

impl LocalObject {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn into_temp_path(self) -> TempPath {
        self.path
    }

    /// Detach the file from cleanup and return its path.
    pub fn keep(self) -> Result<PathBuf> {
        self.path
            .keep()
            .map_err(|e| IngestError::local_io("keeping downloaded object", e.error))
    }
}

/// Fetches objects from one store, chunking large ones.
#[derive(Clone)]
pub struct ChunkedTransfer {
    store: Arc<dyn ObjectStore>,
    chunk_threshold: u64,
    max_concurrent_chunks: usize,
    operation_timeout: Duration,
    temp_dir: PathBuf,
    retry: RetryPolicy,
}

impl ChunkedTransfer {
    pub fn new(store: Arc<dyn ObjectStore>, config: &TransferConfig, retry: RetryPolicy) -> Self {
        Self {
            store,
            chunk_threshold: config.chunk_threshold.max(1),
            max_concurrent_chunks: config.max_concurrent_chunks.max(1),
            operation_timeout: config.operation_timeout(),
            temp_dir: config.temp_dir(),
            retry,
        }
    }

    pub fn chunk_threshold(&self) -> u64 {
        self.chunk_threshold
    }

    /// Download `key` into a local temp file.
    #[instrument(skip(self), fields(backend = self.store.backend_name()))]
    pub async fn fetch(&self, key: &str) -> Result<LocalObject> {
        let started = Instant::now();

        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| IngestError::local_io(format!("creating {}", self.temp_dir.display()), e))?;

        let size = self
            .retry
            .run("head", || async {
                with_deadline(self.operation_timeout, "head", self.store.head(key))
                    .await
                    .map(|meta| meta.size)
                    .map_err(|e| IngestError::from_fetch(key, e))
            })
            .await?;

        let local = if size <= self.chunk_threshold {
            tracing::debug!(key, size, "Streaming object in one request");
            self.retry
                .run("get_stream", || self.fetch_whole(key, size))
                .await?
        } else {
            self.fetch_chunked(key, size).await?
        };

        tracing::info!(
            key,
            size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched source object"
        );
        Ok(local)
    }

    async fn fetch_whole(&self, key: &str, size: u64) -> Result<LocalObject> {
        let (mut file, path) = create_temp(&self.temp_dir, ".fetch-")?;

        let download = async {
            let mut stream = self
                .store
                .get_stream(key)
                .await
                .map_err(|e| IngestError::from_fetch(key, e))?;
            drain_into(&mut stream, &mut file, key).await
        };
        let written = match tokio::time::timeout(self.operation_timeout, download).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(IngestError::from_fetch(
                    key,
                    deadline_exceeded("get_stream", self.operation_timeout),
                ));
            }
        };

        if written != size {
            return Err(IngestError::TransferFailed {
                key: key.to_string(),
                reason: format!("received {written} bytes, expected {size}"),
            });
        }

        Ok(LocalObject {
            path,
            size: written,
        })
    }

    async fn fetch_chunked(&self, key: &str, size: u64) -> Result<LocalObject> {
        let chunks = plan_chunks(size, self.chunk_threshold);
        tracing::debug!(key, size, chunks = chunks.len(), "Fetching object in ranges");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_chunks));
        let mut tasks = JoinSet::new();

        for chunk in &chunks {
            let chunk = *chunk;
            let store = Arc::clone(&self.store);
            let semaphore = Arc::clone(&semaphore);
            let retry = self.retry.clone();
            let key = key.to_string();
            let temp_dir = self.temp_dir.clone();
            let deadline = self.operation_timeout;

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|_| {
                    IngestError::TransferFailed {
                        key: key.clone(),
                        reason: "chunk scheduler closed".to_string(),
                    }
                })?;

                let local_path = retry
                    .run("get_range", || {
                        fetch_chunk(store.as_ref(), &key, chunk, size, deadline, &temp_dir)
                    })
                    .await?;
                tracing::debug!(key = %key, index = chunk.index, "Chunk complete");
                Ok::<_, IngestError>(FetchedChunk { chunk, local_path })
            });
        }

        let mut slots: Vec<Option<FetchedChunk>> = (0..chunks.len()).map(|_| None).collect();

        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(|e| IngestError::TransferFailed {
                key: key.to_string(),
                reason: format!("chunk task failed: {e}"),
            });

            match outcome.and_then(|result| result) {
                Ok(fetched) => {
                    let index = fetched.chunk.index;
                    slots[index] = Some(fetched);
                }
                Err(err) => {
                    // Drain the cancelled tasks so their temp files are gone
                    // before the error surfaces.
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return Err(err);
                }
            }
        }

        let parts: Vec<FetchedChunk> = slots.into_iter().flatten().collect();
        if parts.len() != chunks.len() {
            return Err(IngestError::TransferFailed {
                key: key.to_string(),
                reason: format!("{} of {} chunks arrived", parts.len(), chunks.len()),
            });
        }

        self.assemble(key, size, parts).await
    }

    /// Concatenate chunk files in index order.
    async fn assemble(&self, key: &str, size: u64, parts: Vec<FetchedChunk>) -> Result<LocalObject> {
        let (mut output, path) = create_temp(&self.temp_dir, ".fetch-")?;
        let mut assembled = 0u64;

        for part in &parts {
            let mut input = tokio::fs::File::open(&part.local_path)
                .await
                .map_err(|e| IngestError::local_io("opening chunk", e))?;
            assembled += tokio::io::copy(&mut input, &mut output)
                .await
                .map_err(|e| IngestError::local_io("assembling chunks", e))?;
        }
        output
            .flush()
            .await
            .map_err(|e| IngestError::local_io("assembling chunks", e))?;
        drop(parts);

        if assembled != size {
            return Err(IngestError::TransferFailed {
                key: key.to_string(),
                reason: format!("assembled {assembled} bytes, expected {size}"),
            });
        }

        Ok(LocalObject { path, size })
    }
}

async fn fetch_chunk(
    store: &dyn ObjectStore,
    key: &str,
    chunk: TransferChunk,
    size: u64,
    deadline: Duration,
    temp_dir: &Path,
) -> Result<TempPath> {
    let data: Bytes = with_deadline(deadline, "get_range", store.get_range(key, chunk.range()))
        .await
        .map_err(|e| IngestError::from_fetch(key, e))?;

    let expected = chunk.expected_len(size);
    if data.len() as u64 != expected {
        return Err(IngestError::TransferFailed {
            key: key.to_string(),
            reason: format!(
                "chunk {} returned {} bytes, expected {expected}",
                chunk.index,
                data.len()
            ),
        });
    }

    let (mut file, path) = create_temp(temp_dir, ".chunk-")?;
    file.write_all(&data)
        .await
        .map_err(|e| IngestError::local_io("writing chunk", e))?;
    file.flush()
        .await
        .map_err(|e| IngestError::local_io("writing chunk", e))?;
    Ok(path)
}

/// Copy `stream` into `out`. Store read failures are transfer errors; write
/// failures are local and not worth retrying.
async fn drain_into<W>(stream: &mut ByteStream, out: &mut W, key: &str) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    while let Some(data) = stream
        .try_next()
        .await
        .map_err(|e| IngestError::from_fetch(key, e))?
    {
        out.write_all(&data)
            .await
            .map_err(|e| IngestError::local_io("writing download", e))?;
        written += data.len() as u64;
    }
    out.flush()
        .await
        .map_err(|e| IngestError::local_io("writing download", e))?;
    Ok(written)
}

fn create_temp(dir: &Path, prefix: &str) -> Result<(tokio::fs::File, TempPath)> {
    let (file, path) = tempfile::Builder::new()
        .prefix(prefix)
        .tempfile_in(dir)
        .map_err(|e| IngestError::local_io(format!("creating temp file in {}", dir.display()), e))?
        .into_parts();
    Ok((tokio::fs::File::from_std(file), path))
}
