//! Archive ingestion for romvault.
//!
//! - [`transfer`]: download source objects, in ranges when they are large
//! - [`pipeline`]: split an archive into per-entry zips and store them by content
//! - [`content`]: the content-addressed target store
//! - [`router`]: publish upload notifications to size-class queues

pub mod archive;
pub mod content;
pub mod error;
pub mod pipeline;
pub mod retry;
pub mod router;
pub mod sanitize;
pub mod transfer;

pub use archive::{ArchiveEntry, ArchiveReader, ArchiveSource, ArchiveWriter, MemoryArchive};
pub use content::{ContentStore, PutOutcome, VerifyOutcome};
pub use error::{EntryState, IngestError, Result};
pub use pipeline::{ArchivePipeline, EntryOutcome, RunReport};
pub use retry::RetryPolicy;
pub use router::{MemoryPublisher, QueuePublisher, SizeRouter, UploadEvent};
pub use transfer::{ChunkedTransfer, FetchedChunk, LocalObject, TransferChunk};

use romvault_core::config::AppConfig;
use romvault_core::{Fingerprint, ObjectPath};
use romvault_storage::ObjectStore;
use std::sync::Arc;

/// Downloads an uploaded archive and runs it through the pipeline.
#[derive(Clone)]
pub struct Ingestor {
    transfer: ChunkedTransfer,
    pipeline: ArchivePipeline,
}

impl Ingestor {
    pub fn new(transfer: ChunkedTransfer, pipeline: ArchivePipeline) -> Self {
        Self { transfer, pipeline }
    }

    /// Build both stores and the ingestion stages from configuration.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        config.validate().map_err(IngestError::Config)?;

        let source = romvault_storage::from_config(&config.source)
            .await
            .map_err(|e| IngestError::Config(format!("source store: {e}")))?;
        let target = romvault_storage::from_config(&config.target)
            .await
            .map_err(|e| IngestError::Config(format!("target store: {e}")))?;

        Ok(Self::with_stores(config, source, target))
    }

    /// Build the ingestion stages around already constructed stores.
    pub fn with_stores(
        config: &AppConfig,
        source: Arc<dyn ObjectStore>,
        target: Arc<dyn ObjectStore>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        let transfer = ChunkedTransfer::new(source, &config.transfer, retry.clone());
        let content = ContentStore::new(target, config.transfer.operation_timeout(), retry);
        let pipeline = ArchivePipeline::new(
            content,
            &config.pipeline,
            &config.transfer.temp_dir(),
        );
        Self::new(transfer, pipeline)
    }

    pub fn transfer(&self) -> &ChunkedTransfer {
        &self.transfer
    }

    pub fn pipeline(&self) -> &ArchivePipeline {
        &self.pipeline
    }

    /// Fetch `key` from the source store and ingest it.
    ///
    /// The downloaded copy is removed afterwards; the source object is left
    /// in place.
    pub async fn ingest(&self, key: &str) -> Result<RunReport> {
        let local = self.transfer.fetch(key).await?;
        let report = self.pipeline.run(local.path()).await;
        drop(local);
        report
    }

    /// Check that the target store holds `fingerprint` under `entry_name`'s
    /// object path.
    pub async fn verify(
        &self,
        entry_name: &str,
        fingerprint: &Fingerprint,
    ) -> Result<(ObjectPath, VerifyOutcome)> {
        let content = self.pipeline.content();
        let path = content.path(entry_name, fingerprint)?;
        let outcome = content.verify(&path, fingerprint).await?;
        Ok((path, outcome))
    }
}
