//! Archive reading and writing.
//!
//! The pipeline only sees these traits. Zip files back them in production;
//! [`MemoryArchive`] stands in for tests.

use crate::error::{IngestError, Result};
use bytes::Bytes;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Read-only description of one archive member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub index: usize,
    /// Name exactly as recorded in the archive.
    pub name: String,
    pub is_dir: bool,
    /// Uncompressed size claimed by the archive header.
    pub size: u64,
}

/// Something that can be opened as an archive, possibly many times.
///
/// Each call to [`ArchiveSource::open`] yields an independent reader, so
/// entries can be processed on separate threads without sharing state.
pub trait ArchiveSource: Send + Sync {
    /// Label used in errors and log lines.
    fn describe(&self) -> String;

    fn open(&self) -> Result<Box<dyn ArchiveReader>>;
}

/// An opened archive.
pub trait ArchiveReader: Send {
    fn entries(&self) -> &[ArchiveEntry];

    /// Decompressed content of the entry at `index`.
    fn open_entry(&mut self, index: usize) -> Result<Box<dyn Read + '_>>;
}

/// A writer producing an archive of one or more entries.
///
/// Bytes written through [`Write`] go to the most recently started entry.
pub trait ArchiveWriter: Write + Send {
    fn start_entry(&mut self, name: &str, size_hint: u64) -> Result<()>;

    /// Write the archive trailer and release the destination.
    fn finish(self: Box<Self>) -> Result<()>;
}

fn corrupt(archive: &str, reason: impl ToString) -> IngestError {
    IngestError::CorruptArchive {
        archive: archive.to_string(),
        reason: reason.to_string(),
    }
}

/// A zip file on local disk.
#[derive(Clone, Debug)]
pub struct ZipFileSource {
    path: PathBuf,
}

impl ZipFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ArchiveSource for ZipFileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn open(&self) -> Result<Box<dyn ArchiveReader>> {
        let label = self.describe();
        let file = File::open(&self.path).map_err(|e| corrupt(&label, e))?;
        let reader = ZipArchiveReader::new(file, label)?;
        Ok(Box::new(reader))
    }
}

/// [`ArchiveReader`] over any seekable zip stream.
pub struct ZipArchiveReader<R> {
    archive: ZipArchive<R>,
    entries: Vec<ArchiveEntry>,
    label: String,
}

impl<R: Read + Seek> ZipArchiveReader<R> {
    pub fn new(reader: R, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let mut archive = ZipArchive::new(reader).map_err(|e| corrupt(&label, e))?;

        let mut entries = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let file = archive.by_index_raw(index).map_err(|e| corrupt(&label, e))?;
            entries.push(ArchiveEntry {
                index,
                name: file.name().to_string(),
                is_dir: file.is_dir(),
                size: file.size(),
            });
        }

        Ok(Self {
            archive,
            entries,
            label,
        })
    }
}

impl<R: Read + Seek + Send> ArchiveReader for ZipArchiveReader<R> {
    fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    fn open_entry(&mut self, index: usize) -> Result<Box<dyn Read + '_>> {
        let file = self
            .archive
            .by_index(index)
            .map_err(|e| corrupt(&self.label, e))?;
        Ok(Box::new(file))
    }
}

/// [`ArchiveWriter`] producing a deflate-compressed zip.
pub struct ZipArchiveWriter<W: Write + Seek> {
    inner: ZipWriter<W>,
}

impl<W: Write + Seek> ZipArchiveWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: ZipWriter::new(inner),
        }
    }

    /// Finish the archive and hand back the destination.
    pub fn into_inner(self) -> Result<W> {
        self.inner
            .finish()
            .map_err(|e| IngestError::local_io("finishing zip", io::Error::other(e)))
    }
}

impl<W: Write + Seek> Write for ZipArchiveWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write + Seek + Send> ArchiveWriter for ZipArchiveWriter<W> {
    fn start_entry(&mut self, name: &str, size_hint: u64) -> Result<()> {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(size_hint >= u64::from(u32::MAX));
        self.inner
            .start_file(name, options)
            .map_err(|e| IngestError::local_io(format!("starting zip entry {name}"), io::Error::other(e)))
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.into_inner().map(drop)
    }
}

#[derive(Clone, Debug)]
enum MemoryEntryData {
    Dir,
    File(Bytes),
    /// Opens fine, fails on the first read.
    Unreadable,
}

/// An archive held in memory. Cheap to clone; clones share entries.
#[derive(Clone, Debug, Default)]
pub struct MemoryArchive {
    label: String,
    entries: Arc<Vec<ArchiveEntry>>,
    data: Arc<Vec<MemoryEntryData>>,
}

impl MemoryArchive {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    fn push(mut self, name: &str, is_dir: bool, data: MemoryEntryData) -> Self {
        let size = match &data {
            MemoryEntryData::File(bytes) => bytes.len() as u64,
            _ => 0,
        };
        let entries = Arc::make_mut(&mut self.entries);
        entries.push(ArchiveEntry {
            index: entries.len(),
            name: name.to_string(),
            is_dir,
            size,
        });
        Arc::make_mut(&mut self.data).push(data);
        self
    }

    pub fn with_file(self, name: &str, contents: impl Into<Bytes>) -> Self {
        self.push(name, false, MemoryEntryData::File(contents.into()))
    }

    pub fn with_dir(self, name: &str) -> Self {
        self.push(name, true, MemoryEntryData::Dir)
    }

    /// An entry whose content cannot be decompressed.
    pub fn with_unreadable_file(self, name: &str) -> Self {
        self.push(name, false, MemoryEntryData::Unreadable)
    }
}

impl ArchiveSource for MemoryArchive {
    fn describe(&self) -> String {
        format!("memory:{}", self.label)
    }

    fn open(&self) -> Result<Box<dyn ArchiveReader>> {
        Ok(Box::new(self.clone()))
    }
}

impl ArchiveReader for MemoryArchive {
    fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    fn open_entry(&mut self, index: usize) -> Result<Box<dyn Read + '_>> {
        match self.data.get(index) {
            Some(MemoryEntryData::File(bytes)) => Ok(Box::new(Cursor::new(bytes.clone()))),
            Some(MemoryEntryData::Dir) => Ok(Box::new(io::empty())),
            Some(MemoryEntryData::Unreadable) => Ok(Box::new(FailingReader)),
            None => Err(corrupt(
                &self.describe(),
                format!("no entry at index {index}"),
            )),
        }
    }
}

struct FailingReader;

impl Read for FailingReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::InvalidData, "invalid deflate stream"))
    }
}
