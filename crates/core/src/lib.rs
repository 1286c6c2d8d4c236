//! Core domain types and shared logic for romvault.
//!
//! This crate defines the data model used across the other crates:
//! - Content fingerprints (size, CRC32, SHA1) and the write-through sink
//!   that computes them
//! - Content-addressed object paths
//! - Size classes for upload routing
//! - Configuration types

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod object_path;
pub mod size_class;

pub use error::{Error, Result};
pub use fingerprint::{Fingerprint, FingerprintHasher, FingerprintSink};
pub use object_path::{ObjectPath, base_name};
pub use size_class::{MIB, SizeClass, display_size};

/// Default chunk threshold for source downloads: 10 MiB
pub const DEFAULT_CHUNK_THRESHOLD: u64 = 10 * MIB;
