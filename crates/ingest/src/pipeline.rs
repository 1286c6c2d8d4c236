//! Archive ingestion: split an archive into single-entry archives, one per
//! member, and store each under its content-derived path.
//!
//! For every file entry the pipeline
//! 1. opens the entry's decompressed stream,
//! 2. writes it into a fresh single-entry zip through a [`FingerprintSink`],
//! 3. derives the [`ObjectPath`] from the base name and fingerprint,
//! 4. uploads the zip unless that path is already stored.
//!
//! Every entry name is checked against the extraction root before any entry
//! is processed, so an archive carrying a traversal name produces no uploads.

use crate::archive::{ArchiveEntry, ArchiveSource, ArchiveWriter, ZipArchiveWriter, ZipFileSource};
use crate::content::{ContentStore, PutOutcome};
use crate::error::{EntryState, IngestError, Result};
use crate::sanitize::resolve_entry_path;
use futures::StreamExt;
use romvault_core::config::PipelineConfig;
use romvault_core::{Fingerprint, FingerprintSink, ObjectPath, base_name};
use serde::Serialize;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::{TempDir, TempPath};
use tracing::instrument;

/// Copy buffer for repackaging (256 KiB).
const COPY_BUFFER_SIZE: usize = 256 * 1024;

/// What happened to one stored entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntryOutcome {
    pub entry: String,
    pub object_path: ObjectPath,
    pub fingerprint: Fingerprint,
    /// [`EntryState::Skipped`] or [`EntryState::Uploaded`].
    pub state: EntryState,
    /// Size of the uploaded single-entry archive; 0 when skipped.
    pub uploaded_bytes: u64,
}

/// Terminal state of every entry of one run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub archive: String,
    pub entries: Vec<EntryOutcome>,
    /// Directory entries, which are never stored.
    pub directories: usize,
    /// Entry failures collected when `fail_fast` is off.
    pub failures: Vec<IngestError>,
}

impl RunReport {
    pub fn uploaded(&self) -> usize {
        self.count(EntryState::Uploaded)
    }

    pub fn skipped(&self) -> usize {
        self.count(EntryState::Skipped)
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    fn count(&self, state: EntryState) -> usize {
        self.entries.iter().filter(|e| e.state == state).count()
    }
}

/// Write `input` as entry `entry_name` of `writer`, fingerprinting the bytes
/// on the way through. The writer is left open.
///
/// Read failures mean the source entry is damaged; write failures are local.
pub fn repackage(
    input: &mut dyn Read,
    entry_name: &str,
    size_hint: u64,
    writer: &mut dyn ArchiveWriter,
) -> Result<Fingerprint> {
    writer.start_entry(entry_name, size_hint)?;

    let mut sink = FingerprintSink::new(writer);
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(IngestError::CorruptArchive {
                    archive: entry_name.to_string(),
                    reason: format!("reading entry: {e}"),
                });
            }
        };
        sink.write_all(&buf[..n])
            .map_err(|e| IngestError::local_io(format!("writing {entry_name}"), e))?;
    }

    Ok(sink.digest()?)
}

/// Runs archives through repackaging and content-addressed upload.
#[derive(Clone)]
pub struct ArchivePipeline {
    content: ContentStore,
    extraction_root: PathBuf,
    entry_concurrency: usize,
    fail_fast: bool,
}

impl ArchivePipeline {
    /// `default_root` is used when the config names no extraction root.
    pub fn new(content: ContentStore, config: &PipelineConfig, default_root: &Path) -> Self {
        Self {
            content,
            extraction_root: config
                .extraction_root
                .clone()
                .unwrap_or_else(|| default_root.to_path_buf()),
            entry_concurrency: config.entry_concurrency.max(1),
            fail_fast: config.fail_fast,
        }
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    /// Process the zip at `archive_path`, then delete it whether or not the
    /// run succeeded.
    #[instrument(skip(self), fields(archive = %archive_path.display()))]
    pub async fn run(&self, archive_path: &Path) -> Result<RunReport> {
        let _remove_source = scopeguard::guard(archive_path.to_path_buf(), |path| {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed source archive"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to remove source archive"
                ),
            }
        });

        self.run_source(Arc::new(ZipFileSource::new(archive_path)))
            .await
    }

    /// Process any archive source. The source itself is left alone.
    pub async fn run_source(&self, source: Arc<dyn ArchiveSource>) -> Result<RunReport> {
        let started = Instant::now();
        let label = source.describe();

        let listing = {
            let source = Arc::clone(&source);
            tokio::task::spawn_blocking(move || -> Result<Vec<ArchiveEntry>> {
                Ok(source.open()?.entries().to_vec())
            })
            .await
            .map_err(|e| IngestError::local_io("listing archive", io::Error::other(e)))??
        };

        for entry in &listing {
            if let Err(err) = resolve_entry_path(&self.extraction_root, &entry.name) {
                tracing::warn!(archive = %label, entry = %entry.name, "Rejecting archive with unsafe entry name");
                return Err(err);
            }
        }

        tokio::fs::create_dir_all(&self.extraction_root)
            .await
            .map_err(|e| {
                IngestError::local_io(format!("creating {}", self.extraction_root.display()), e)
            })?;
        let staging = tempfile::Builder::new()
            .prefix(".romvault-run-")
            .tempdir_in(&self.extraction_root)
            .map_err(|e| IngestError::local_io("creating staging directory", e))?;
        let staging = Arc::new(staging);

        let (directories, files): (Vec<ArchiveEntry>, Vec<ArchiveEntry>) =
            listing.into_iter().partition(|entry| entry.is_dir);

        let mut report = RunReport {
            archive: label.clone(),
            directories: directories.len(),
            ..RunReport::default()
        };

        let mut results = futures::stream::iter(files)
            .map(|entry| self.process_entry(Arc::clone(&source), entry, Arc::clone(&staging)))
            .buffered(self.entry_concurrency);

        while let Some(result) = results.next().await {
            match result {
                Ok(outcome) => report.entries.push(outcome),
                Err(err) if self.fail_fast => {
                    tracing::warn!(archive = %label, error = %err, "Aborting run");
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(archive = %label, error = %err, "Entry failed");
                    report.failures.push(err);
                }
            }
        }

        tracing::info!(
            archive = %label,
            uploaded = report.uploaded(),
            skipped = report.skipped(),
            failed = report.failures.len(),
            directories = report.directories,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Processed archive"
        );
        Ok(report)
    }

    async fn process_entry(
        &self,
        source: Arc<dyn ArchiveSource>,
        entry: ArchiveEntry,
        staging: Arc<TempDir>,
    ) -> Result<EntryOutcome> {
        let started = Instant::now();
        let entry_name = entry.name.clone();
        let fail = |state: EntryState, object_path: Option<ObjectPath>, err: IngestError| {
            IngestError::EntryFailed {
                entry: entry_name.clone(),
                state,
                object_path,
                source: Box::new(err),
            }
        };

        tracing::debug!(entry = %entry_name, state = %EntryState::Opened, "Entry");

        let (fingerprint, staged) = tokio::task::spawn_blocking(move || {
            repackage_entry(source.as_ref(), &entry, &staging)
        })
        .await
        .map_err(|e| {
            fail(
                EntryState::Fingerprinting,
                None,
                IngestError::local_io("archive task", io::Error::other(e)),
            )
        })?
        .map_err(|(state, err)| fail(state, None, err))?;

        tracing::debug!(entry = %entry_name, fingerprint = %fingerprint, state = %EntryState::Digested, "Entry");

        let object_path = self
            .content
            .path(&entry_name, &fingerprint)
            .map_err(|err| fail(EntryState::Digested, None, err))?;

        tracing::debug!(entry = %entry_name, object_path = %object_path, state = %EntryState::PathComputed, "Entry");

        let outcome = self
            .content
            .put_if_absent(&staged, &object_path)
            .await
            .map_err(|err| fail(EntryState::PathComputed, Some(object_path.clone()), err))?;
        drop(staged);

        let (state, uploaded_bytes) = match outcome {
            PutOutcome::Skipped => (EntryState::Skipped, 0),
            PutOutcome::Uploaded { bytes } => (EntryState::Uploaded, bytes),
        };

        tracing::info!(
            entry = %entry_name,
            object_path = %object_path,
            size = fingerprint.size(),
            outcome = %state,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Entry stored"
        );

        Ok(EntryOutcome {
            entry: entry_name,
            object_path,
            fingerprint,
            state,
            uploaded_bytes,
        })
    }
}

/// Blocking half of an entry: open a private reader, repackage into a staged
/// zip, and return the fingerprint with the staged file. Errors carry the
/// state the entry had reached.
fn repackage_entry(
    source: &dyn ArchiveSource,
    entry: &ArchiveEntry,
    staging: &TempDir,
) -> std::result::Result<(Fingerprint, TempPath), (EntryState, IngestError)> {
    let opened = |err: IngestError| (EntryState::Opened, err);

    let name = base_name(&entry.name).map_err(|e| opened(e.into()))?;
    // A reader per entry re-parses the central directory each time, which is
    // quadratic in member count, but keeps concurrent entries independent.
    let mut reader = source.open().map_err(opened)?;
    let mut input = reader.open_entry(entry.index).map_err(opened)?;

    let (file, staged) = tempfile::Builder::new()
        .prefix(".entry-")
        .suffix(".zip")
        .tempfile_in(staging.path())
        .map_err(|e| opened(IngestError::local_io("staging entry", e)))?
        .into_parts();

    let mut writer = Box::new(ZipArchiveWriter::new(file));
    let fingerprint = repackage(input.as_mut(), name, entry.size, writer.as_mut()).map_err(|err| {
        let err = match err {
            IngestError::CorruptArchive { reason, .. } => IngestError::CorruptArchive {
                archive: source.describe(),
                reason: format!("{}: {reason}", entry.name),
            },
            other => other,
        };
        (EntryState::Fingerprinting, err)
    })?;
    writer.finish().map_err(|err| (EntryState::Digested, err))?;

    Ok((fingerprint, staged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveReader, MemoryArchive, ZipArchiveReader};
    use crate::retry::RetryPolicy;
    use bytes::Bytes;
    use romvault_storage::{MemoryBackend, ObjectStore};
    use std::io::Cursor;
    use std::time::Duration;

    fn pipeline(backend: &MemoryBackend, root: &Path, fail_fast: bool) -> ArchivePipeline {
        let content = ContentStore::new(
            Arc::new(backend.clone()),
            Duration::from_secs(5),
            RetryPolicy::none(),
        );
        let config = PipelineConfig {
            fail_fast,
            ..PipelineConfig::default()
        };
        ArchivePipeline::new(content, &config, root)
    }

    #[test]
    fn test_repackage_fingerprints_and_writes() {
        let data: Vec<u8> = (0u8..20).collect();
        let mut writer = ZipArchiveWriter::new(Cursor::new(Vec::new()));
        let fp = repackage(&mut data.as_slice(), "game.bin", 20, &mut writer).unwrap();
        assert_eq!(fp.crc32_hex(), "3bddffa4");
        assert_eq!(fp.sha1_hex(), "602c63d2f3d13ca3206cdf204cde24e7d8f4266c");

        let bytes = writer.into_inner().unwrap().into_inner();
        let mut reader = ZipArchiveReader::new(Cursor::new(bytes), "out.zip").unwrap();
        assert_eq!(reader.entries()[0].name, "game.bin");
        let mut out = Vec::new();
        reader.open_entry(0).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_memory_archive_run() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let archive = MemoryArchive::new("set")
            .with_dir("roms/")
            .with_file("roms/readme.txt", Bytes::new())
            .with_file("roms/game.bin", (0u8..20).collect::<Vec<u8>>());

        let report = pipeline(&backend, dir.path(), true)
            .run_source(Arc::new(archive))
            .await
            .unwrap();

        assert_eq!(report.directories, 1);
        assert_eq!(report.uploaded(), 2);
        assert_eq!(
            report.entries[0].object_path.as_str(),
            "readme.txt/0/00000000/da39a3ee5e6b4b0d3255bfef95601890afd80709/readme.txt.zip"
        );
        assert_eq!(backend.len().await, 2);

        // Staging is cleaned up with the run.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_traversal_rejects_whole_archive() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let archive = MemoryArchive::new("evil")
            .with_file("fine.bin", Bytes::from_static(b"ok"))
            .with_file("../../etc/passwd", Bytes::from_static(b"root"));

        let err = pipeline(&backend, dir.path(), false)
            .run_source(Arc::new(archive))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::PathTraversal { .. }));
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_unreadable_entry_reports_state() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let archive = MemoryArchive::new("damaged")
            .with_unreadable_file("bad.bin")
            .with_file("good.bin", Bytes::from_static(b"good"));

        let err = pipeline(&backend, dir.path(), true)
            .run_source(Arc::new(archive.clone()))
            .await
            .unwrap_err();
        match err {
            IngestError::EntryFailed {
                entry,
                state,
                object_path,
                source,
            } => {
                assert_eq!(entry, "bad.bin");
                assert_eq!(state, EntryState::Fingerprinting);
                assert!(object_path.is_none());
                assert!(matches!(*source, IngestError::CorruptArchive { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let report = pipeline(&backend, dir.path(), false)
            .run_source(Arc::new(archive))
            .await
            .unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.uploaded(), 1);
        assert!(!report.is_success());
        assert!(backend.exists_with_prefix("good.bin/4/").await.unwrap());
    }
}
