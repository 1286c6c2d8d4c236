//! Content fingerprints: byte count, IEEE CRC32 and SHA1 of a byte stream.
//!
//! A fingerprint is accumulated incrementally, in write order, and finalized
//! exactly once. The same bytes always produce the same fingerprint no matter
//! how the writes were split.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::io::{self, Write};

/// The `{size, crc32, sha1}` identity of a byte sequence.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "FingerprintRepr", try_from = "FingerprintRepr")]
pub struct Fingerprint {
    size: u64,
    crc32: u32,
    sha1: [u8; 20],
}

impl Fingerprint {
    /// Create a fingerprint from already computed parts.
    pub fn from_parts(size: u64, crc32: u32, sha1: [u8; 20]) -> Self {
        Self { size, crc32, sha1 }
    }

    /// Fingerprint an in-memory buffer.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Self::hasher();
        hasher.update(data);
        hasher.finalize()
    }

    /// Create an incremental hasher.
    pub fn hasher() -> FingerprintHasher {
        FingerprintHasher {
            size: 0,
            crc32: crc32fast::Hasher::new(),
            sha1: Sha1::new(),
        }
    }

    /// Number of bytes fingerprinted.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Raw IEEE CRC32 value.
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    /// Raw SHA1 digest.
    pub fn sha1(&self) -> &[u8; 20] {
        &self.sha1
    }

    /// CRC32 as 8 lowercase hex digits, big-endian.
    pub fn crc32_hex(&self) -> String {
        format!("{:08x}", self.crc32)
    }

    /// SHA1 as 40 lowercase hex digits.
    pub fn sha1_hex(&self) -> String {
        hex::encode(self.sha1)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fingerprint({}, {}, {})",
            self.size,
            self.crc32_hex(),
            &self.sha1_hex()[..12]
        )
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.size, self.crc32_hex(), self.sha1_hex())
    }
}

/// Serialized form: hex strings instead of raw bytes.
#[derive(Serialize, Deserialize)]
struct FingerprintRepr {
    size: u64,
    crc32: String,
    sha1: String,
}

impl From<Fingerprint> for FingerprintRepr {
    fn from(fp: Fingerprint) -> Self {
        Self {
            size: fp.size,
            crc32: fp.crc32_hex(),
            sha1: fp.sha1_hex(),
        }
    }
}

impl TryFrom<FingerprintRepr> for Fingerprint {
    type Error = Error;

    fn try_from(repr: FingerprintRepr) -> Result<Self> {
        let crc32 = u32::from_str_radix(&repr.crc32, 16)
            .map_err(|e| Error::InvalidHash(format!("crc32 {:?}: {e}", repr.crc32)))?;
        let mut sha1 = [0u8; 20];
        hex::decode_to_slice(&repr.sha1, &mut sha1)
            .map_err(|e| Error::InvalidHash(format!("sha1 {:?}: {e}", repr.sha1)))?;
        Ok(Self {
            size: repr.size,
            crc32,
            sha1,
        })
    }
}

/// Incremental fingerprint accumulator.
pub struct FingerprintHasher {
    size: u64,
    crc32: crc32fast::Hasher,
    sha1: Sha1,
}

impl FingerprintHasher {
    /// Update all three accumulators with data.
    pub fn update(&mut self, data: &[u8]) {
        self.size += data.len() as u64;
        self.crc32.update(data);
        self.sha1.update(data);
    }

    /// Finalize and return the fingerprint.
    pub fn finalize(self) -> Fingerprint {
        Fingerprint {
            size: self.size,
            crc32: self.crc32.finalize(),
            sha1: self.sha1.finalize().into(),
        }
    }
}

/// A write-through sink that fingerprints everything passing into `inner`.
///
/// Only the bytes the destination accepted are accounted, so a short write
/// never skews the fingerprint. [`FingerprintSink::digest`] must be called
/// once after the last write; writing afterwards fails.
pub struct FingerprintSink<W> {
    inner: W,
    hasher: Option<FingerprintHasher>,
}

impl<W: Write> FingerprintSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Some(Fingerprint::hasher()),
        }
    }

    /// Finalize the accumulated fingerprint.
    ///
    /// Returns [`Error::AlreadyDigested`] on a second call.
    pub fn digest(&mut self) -> Result<Fingerprint> {
        self.hasher
            .take()
            .map(FingerprintHasher::finalize)
            .ok_or(Error::AlreadyDigested)
    }

    pub fn is_digested(&self) -> bool {
        self.hasher.is_none()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Recover the destination writer so the caller can finalize it.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for FingerprintSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let hasher = self
            .hasher
            .as_mut()
            .ok_or_else(|| io::Error::other(Error::AlreadyDigested))?;
        let written = self.inner.write(buf)?;
        hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
