use async_trait::async_trait;
use bytes::Bytes;
use romvault_storage::{
    ByteRange, ByteStream, MemoryBackend, ObjectMeta, ObjectStore, StorageError, StorageResult,
    StreamingUpload,
};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

const NO_OFFSET: u64 = u64::MAX;

/// Range reads sleep longer the lower they start, so chunks finish in
/// reverse order.
#[derive(Clone, Copy)]
struct ReverseCompletion {
    chunk_size: u64,
    chunks: u64,
    step: Duration,
}

/// A store (by default a [`MemoryBackend`]) that can be told to fail or
/// stall specific calls, and counts what reaches it.
#[allow(dead_code)]
pub struct FaultyStore<S = MemoryBackend> {
    pub inner: S,
    fail_range_offset: AtomicU64,
    range_failures_left: AtomicUsize,
    probe_failures_left: AtomicUsize,
    stall_range_offset: AtomicU64,
    range_stall: Mutex<Duration>,
    write_stall: Mutex<Option<Duration>>,
    reverse: Mutex<Option<ReverseCompletion>>,
    /// Start offsets of range reads in the order they completed.
    pub completed_ranges: Mutex<Vec<u64>>,
    pub range_calls: AtomicUsize,
    pub probe_calls: AtomicUsize,
    pub uploads: AtomicUsize,
}

#[allow(dead_code)]
impl<S: ObjectStore> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_range_offset: AtomicU64::new(NO_OFFSET),
            range_failures_left: AtomicUsize::new(0),
            probe_failures_left: AtomicUsize::new(0),
            stall_range_offset: AtomicU64::new(NO_OFFSET),
            range_stall: Mutex::new(Duration::ZERO),
            write_stall: Mutex::new(None),
            reverse: Mutex::new(None),
            completed_ranges: Mutex::new(Vec::new()),
            range_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
        }
    }

    /// Delay the range read starting at `offset` by `delay`.
    pub fn stall_range_at(&self, offset: u64, delay: Duration) {
        *self.range_stall.lock().unwrap() = delay;
        self.stall_range_offset.store(offset, Ordering::SeqCst);
    }

    /// Hold range reads so that, of `chunks` ranges of `chunk_size` bytes,
    /// the last finishes first and the first finishes last.
    pub fn complete_ranges_in_reverse(&self, chunk_size: u64, chunks: u64, step: Duration) {
        *self.reverse.lock().unwrap() = Some(ReverseCompletion {
            chunk_size,
            chunks,
            step,
        });
    }

    /// Sleep `delay` before every write of a streaming upload.
    pub fn stall_writes(&self, delay: Duration) {
        *self.write_stall.lock().unwrap() = Some(delay);
    }

    pub fn completed_ranges(&self) -> Vec<u64> {
        self.completed_ranges.lock().unwrap().clone()
    }

    fn range_delay(&self, start: u64) -> Duration {
        if start == self.stall_range_offset.load(Ordering::SeqCst) {
            return *self.range_stall.lock().unwrap();
        }
        match *self.reverse.lock().unwrap() {
            Some(order) => {
                let index = start / order.chunk_size.max(1);
                let remaining = order.chunks.saturating_sub(index) as u32;
                order.step * remaining
            }
            None => Duration::ZERO,
        }
    }

    /// Fail the next `times` range reads that start at `offset`.
    pub fn fail_range_at(&self, offset: u64, times: usize) {
        self.fail_range_offset.store(offset, Ordering::SeqCst);
        self.range_failures_left.store(times, Ordering::SeqCst);
    }

    /// Fail the next `times` prefix probes.
    pub fn fail_probes(&self, times: usize) {
        self.probe_failures_left.store(times, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for FaultyStore<S> {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn exists_with_prefix(&self, prefix: &str) -> StorageResult<bool> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.probe_failures_left) {
            return Err(StorageError::Io(std::io::Error::other("injected probe failure")));
        }
        self.inner.exists_with_prefix(prefix).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.inner.get(key).await
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.get_stream(key).await
    }

    async fn get_range(&self, key: &str, range: ByteRange) -> StorageResult<Bytes> {
        self.range_calls.fetch_add(1, Ordering::SeqCst);
        if range.start == self.fail_range_offset.load(Ordering::SeqCst)
            && Self::take_failure(&self.range_failures_left)
        {
            return Err(StorageError::Io(std::io::Error::other("injected range failure")));
        }
        let delay = self.range_delay(range.start);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let data = self.inner.get_range(key, range).await?;
        self.completed_ranges.lock().unwrap().push(range.start);
        Ok(data)
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, data).await
    }

    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> StorageResult<bool> {
        self.inner.put_if_not_exists(key, data).await
    }

    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let upload = self.inner.put_stream(key).await?;
        let stall = *self.write_stall.lock().unwrap();
        match stall {
            Some(delay) => Ok(Box::new(StalledUpload { inner: upload, delay })),
            None => Ok(upload),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    fn backend_name(&self) -> &'static str {
        "faulty"
    }
}

/// Upload whose writes each wait `delay` before reaching the inner upload.
struct StalledUpload {
    inner: Box<dyn StreamingUpload>,
    delay: Duration,
}

#[async_trait]
impl StreamingUpload for StalledUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.write(data).await
    }

    async fn finish(self: Box<Self>) -> StorageResult<u64> {
        self.inner.finish().await
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.inner.abort().await
    }
}
