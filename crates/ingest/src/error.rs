//! Ingestion error taxonomy.

use romvault_core::ObjectPath;
use romvault_storage::StorageError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Where an entry was in its lifecycle when something went wrong.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Opened,
    Fingerprinting,
    Digested,
    PathComputed,
    Skipped,
    Uploaded,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Opened => "opened",
            EntryState::Fingerprinting => "fingerprinting",
            EntryState::Digested => "digested",
            EntryState::PathComputed => "path_computed",
            EntryState::Skipped => "skipped",
            EntryState::Uploaded => "uploaded",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while fetching, repackaging, storing or routing archives.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("object not found: {key}")]
    ObjectNotFound { key: String },

    #[error("transfer of {key} failed: {reason}")]
    TransferFailed { key: String, reason: String },

    #[error("local I/O error ({context}): {source}")]
    LocalIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt archive {archive}: {reason}")]
    CorruptArchive { archive: String, reason: String },

    #[error("entry {entry:?} escapes the extraction root")]
    PathTraversal { entry: String },

    #[error("content store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("publish to {queue} failed: {reason}")]
    PublishFailed { queue: String, reason: String },

    #[error("invalid entry: {0}")]
    InvalidEntry(#[from] romvault_core::Error),

    #[error("entry {entry} failed while {state}: {source}")]
    EntryFailed {
        entry: String,
        state: EntryState,
        object_path: Option<ObjectPath>,
        #[source]
        source: Box<IngestError>,
    },

    #[error("invalid upload event: {0}")]
    InvalidEvent(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl IngestError {
    /// Whether a later attempt of the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::TransferFailed { .. }
            | IngestError::StoreUnavailable { .. }
            | IngestError::PublishFailed { .. } => true,
            IngestError::EntryFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn local_io(context: impl Into<String>, source: std::io::Error) -> Self {
        IngestError::LocalIo {
            context: context.into(),
            source,
        }
    }

    /// Classify a failed read of a source object.
    pub(crate) fn from_fetch(key: &str, err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) | StorageError::InvalidKey(_) => IngestError::ObjectNotFound {
                key: key.to_string(),
            },
            StorageError::Config(msg) => IngestError::Config(msg),
            other => IngestError::TransferFailed {
                key: key.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Classify a failed write to the content store.
    pub(crate) fn from_upload(path: &ObjectPath, err: StorageError) -> Self {
        match err {
            StorageError::Timeout(reason) => IngestError::TransferFailed {
                key: path.to_string(),
                reason,
            },
            other => IngestError::StoreUnavailable {
                reason: format!("upload of {path}: {other}"),
            },
        }
    }

    /// Classify a failed existence probe.
    pub(crate) fn from_probe(path: &ObjectPath, err: StorageError) -> Self {
        IngestError::StoreUnavailable {
            reason: format!("existence check for {path}: {err}"),
        }
    }

    /// The object path involved, when the failure happened after it was derived.
    pub fn object_path(&self) -> Option<&ObjectPath> {
        match self {
            IngestError::EntryFailed { object_path, .. } => object_path.as_ref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        let transient = IngestError::TransferFailed {
            key: "k".into(),
            reason: "reset".into(),
        };
        assert!(transient.is_retryable());
        assert!(
            IngestError::StoreUnavailable {
                reason: "503".into()
            }
            .is_retryable()
        );
        assert!(!IngestError::ObjectNotFound { key: "k".into() }.is_retryable());
        assert!(
            !IngestError::PathTraversal {
                entry: "../x".into()
            }
            .is_retryable()
        );

        let wrapped = IngestError::EntryFailed {
            entry: "game.bin".into(),
            state: EntryState::PathComputed,
            object_path: None,
            source: Box::new(transient),
        };
        assert!(wrapped.is_retryable());
    }

    #[test]
    fn test_storage_classification() {
        let err = IngestError::from_fetch("a.zip", StorageError::NotFound("a.zip".into()));
        assert!(matches!(err, IngestError::ObjectNotFound { .. }));

        let err = IngestError::from_fetch("a.zip", StorageError::Timeout("slow".into()));
        assert!(matches!(err, IngestError::TransferFailed { .. }));

        let fp = romvault_core::Fingerprint::compute(b"x");
        let path = ObjectPath::new("x", &fp).unwrap();
        let err = IngestError::from_upload(&path, StorageError::Timeout("slow".into()));
        assert!(matches!(err, IngestError::TransferFailed { .. }));
        let err = IngestError::from_upload(&path, StorageError::Config("denied".into()));
        assert!(matches!(err, IngestError::StoreUnavailable { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_entry_state_display() {
        assert_eq!(EntryState::PathComputed.to_string(), "path_computed");
        assert_eq!(EntryState::Uploaded.as_str(), "uploaded");
    }
}
