//! Configuration types shared across crates.

use crate::size_class::{MIB, SizeClass};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Largest bounded range the storage backends will serve.
pub const MAX_CHUNK_THRESHOLD: u64 = 128 * MIB;

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the ambient AWS credential chain if not set.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to the ambient AWS credential chain if not set.
        secret_access_key: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`). Required for MinIO.
        #[serde(default)]
        force_path_style: bool,
    },
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                ..
            } => {
                if bucket.is_empty() {
                    return Err("s3 config requires a non-empty bucket".to_string());
                }
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            StorageConfig::Filesystem { path } => {
                if path.as_os_str().is_empty() {
                    return Err("filesystem config requires a non-empty path".to_string());
                }
                Ok(())
            }
        }
    }

    /// Human-readable location, used in log lines.
    pub fn describe(&self) -> String {
        match self {
            StorageConfig::Filesystem { path } => format!("file://{}", path.display()),
            StorageConfig::S3 { bucket, prefix, .. } => match prefix {
                Some(prefix) => format!("s3://{bucket}/{prefix}"),
                None => format!("s3://{bucket}"),
            },
        }
    }
}

/// Download settings for source archives.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Objects at or below this size are read in one stream; larger objects
    /// are fetched as ranges of exactly this many bytes.
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: u64,
    /// Upper bound on range requests in flight for one object.
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
    /// Deadline for every single remote call, in seconds.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Directory for temporary files. Defaults to the system temp dir.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

fn default_chunk_threshold() -> u64 {
    crate::DEFAULT_CHUNK_THRESHOLD
}

fn default_max_concurrent_chunks() -> usize {
    8
}

fn default_operation_timeout_secs() -> u64 {
    100
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: default_chunk_threshold(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            operation_timeout_secs: default_operation_timeout_secs(),
            temp_dir: None,
        }
    }
}

impl TransferConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Temp directory to use, falling back to the system default.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_threshold == 0 {
            return Err("transfer.chunk_threshold must be greater than 0".to_string());
        }
        if self.chunk_threshold > MAX_CHUNK_THRESHOLD {
            return Err(format!(
                "transfer.chunk_threshold must be at most {MAX_CHUNK_THRESHOLD} bytes"
            ));
        }
        if self.max_concurrent_chunks == 0 {
            return Err("transfer.max_concurrent_chunks must be greater than 0".to_string());
        }
        if self.operation_timeout_secs == 0 {
            return Err("transfer.operation_timeout_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Archive processing settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root that entry names are resolved against for the traversal check.
    /// Repackaged archives are staged beneath it. Defaults to the transfer
    /// temp dir.
    #[serde(default)]
    pub extraction_root: Option<PathBuf>,
    /// Number of entries processed at once. 1 means strictly sequential.
    #[serde(default = "default_entry_concurrency")]
    pub entry_concurrency: usize,
    /// Abort the whole run on the first failing entry.
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,
}

fn default_entry_concurrency() -> usize {
    1
}

fn default_fail_fast() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extraction_root: None,
            entry_concurrency: default_entry_concurrency(),
            fail_fast: default_fail_fast(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.entry_concurrency == 0 {
            return Err("pipeline.entry_concurrency must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Bounded exponential backoff for transient remote failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt. 0 disables retrying.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry; doubled on every further retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Ceiling for a single delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(format!(
                "retry.max_backoff_ms {} is smaller than retry.initial_backoff_ms {}",
                self.max_backoff_ms, self.initial_backoff_ms
            ));
        }
        Ok(())
    }
}

/// Size thresholds and queue names for routing uploaded archives.
///
/// Upper bounds are exclusive: an object of exactly `small_below` bytes is
/// medium, not small.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_small_below")]
    pub small_below: u64,
    #[serde(default = "default_medium_below")]
    pub medium_below: u64,
    #[serde(default = "default_large_below")]
    pub large_below: u64,
    #[serde(default = "default_small_queue")]
    pub small_queue: String,
    #[serde(default = "default_medium_queue")]
    pub medium_queue: String,
    #[serde(default = "default_large_queue")]
    pub large_queue: String,
    #[serde(default = "default_xlarge_queue")]
    pub xlarge_queue: String,
}

fn default_small_below() -> u64 {
    5 * MIB
}

fn default_medium_below() -> u64 {
    50 * MIB
}

fn default_large_below() -> u64 {
    100 * MIB
}

fn default_small_queue() -> String {
    "rom-upload-small".to_string()
}

fn default_medium_queue() -> String {
    "rom-upload-medium".to_string()
}

fn default_large_queue() -> String {
    "rom-upload-large".to_string()
}

fn default_xlarge_queue() -> String {
    "rom-upload-xlarge".to_string()
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            small_below: default_small_below(),
            medium_below: default_medium_below(),
            large_below: default_large_below(),
            small_queue: default_small_queue(),
            medium_queue: default_medium_queue(),
            large_queue: default_large_queue(),
            xlarge_queue: default_xlarge_queue(),
        }
    }
}

impl RoutingConfig {
    /// Classify an object size against the configured thresholds.
    pub fn classify(&self, size: u64) -> SizeClass {
        if size < self.small_below {
            SizeClass::Small
        } else if size < self.medium_below {
            SizeClass::Medium
        } else if size < self.large_below {
            SizeClass::Large
        } else {
            SizeClass::XLarge
        }
    }

    /// Queue name for a size class.
    pub fn queue(&self, class: SizeClass) -> &str {
        match class {
            SizeClass::Small => &self.small_queue,
            SizeClass::Medium => &self.medium_queue,
            SizeClass::Large => &self.large_queue,
            SizeClass::XLarge => &self.xlarge_queue,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.small_below <= self.medium_below && self.medium_below <= self.large_below) {
            return Err(format!(
                "routing thresholds must be non-decreasing, got {} / {} / {}",
                self.small_below, self.medium_below, self.large_below
            ));
        }
        for queue in [
            &self.small_queue,
            &self.medium_queue,
            &self.large_queue,
            &self.xlarge_queue,
        ] {
            if queue.is_empty() {
                return Err("routing queue names must not be empty".to_string());
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Store that uploaded archives are read from.
    pub source: StorageConfig,
    /// Content-addressed store that repackaged entries are written to.
    pub target: StorageConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
}

impl AppConfig {
    /// Filesystem-backed configuration rooted at `root`, with fast retries.
    ///
    /// **For testing only.**
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            source: StorageConfig::Filesystem {
                path: root.join("source"),
            },
            target: StorageConfig::Filesystem {
                path: root.join("target"),
            },
            transfer: TransferConfig {
                temp_dir: Some(root.join("tmp")),
                ..TransferConfig::default()
            },
            pipeline: PipelineConfig::default(),
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 4,
            },
            routing: RoutingConfig::default(),
        }
    }

    /// Validate every section, prefixing errors with the section name.
    pub fn validate(&self) -> Result<(), String> {
        self.source
            .validate()
            .map_err(|e| format!("source: {e}"))?;
        self.target
            .validate()
            .map_err(|e| format!("target: {e}"))?;
        self.transfer.validate()?;
        self.pipeline.validate()?;
        self.retry.validate()?;
        self.routing.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.chunk_threshold, 10 * MIB);
        assert_eq!(config.operation_timeout(), Duration::from_secs(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sections_default_when_missing() {
        let json = r#"{
            "source": {"type": "filesystem", "path": "/srv/uploads"},
            "target": {"type": "s3", "bucket": "roms", "region": "eu-west-1"}
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.transfer.max_concurrent_chunks, 8);
        assert_eq!(config.pipeline.entry_concurrency, 1);
        assert!(config.pipeline.fail_fast);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.routing.small_queue, "rom-upload-small");
        assert!(config.validate().is_ok());

        match config.target {
            StorageConfig::S3 {
                force_path_style,
                prefix,
                ..
            } => {
                assert!(!force_path_style);
                assert!(prefix.is_none());
            }
            other => panic!("expected s3 target, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_s3_credentials_rejected() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("key".to_string()),
            secret_access_key: None,
            force_path_style: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = AppConfig::for_testing("/tmp/romvault");
        config.transfer.chunk_threshold = 0;
        assert!(config.validate().unwrap_err().contains("chunk_threshold"));

        let mut config = AppConfig::for_testing("/tmp/romvault");
        config.pipeline.entry_concurrency = 0;
        assert!(config.validate().unwrap_err().contains("entry_concurrency"));
    }

    #[test]
    fn test_chunk_threshold_capped_at_range_limit() {
        let mut config = AppConfig::for_testing("/tmp/romvault");
        config.transfer.chunk_threshold = MAX_CHUNK_THRESHOLD;
        assert!(config.validate().is_ok());

        config.transfer.chunk_threshold = MAX_CHUNK_THRESHOLD + 1;
        assert!(config.validate().unwrap_err().contains("chunk_threshold"));
    }

    #[test]
    fn test_routing_boundaries() {
        let routing = RoutingConfig::default();
        let cases = [
            (0, SizeClass::Small),
            (5 * MIB - 1, SizeClass::Small),
            (5 * MIB, SizeClass::Medium),
            (5 * MIB + 1, SizeClass::Medium),
            (50 * MIB - 1, SizeClass::Medium),
            (50 * MIB, SizeClass::Large),
            (50 * MIB + 1, SizeClass::Large),
            (100 * MIB - 1, SizeClass::Large),
            (100 * MIB, SizeClass::XLarge),
            (100 * MIB + 1, SizeClass::XLarge),
            (u64::MAX, SizeClass::XLarge),
        ];
        for (size, expected) in cases {
            assert_eq!(routing.classify(size), expected, "size {size}");
        }
        assert_eq!(routing.queue(SizeClass::Large), "rom-upload-large");
    }

    #[test]
    fn test_routing_thresholds_configurable() {
        let routing = RoutingConfig {
            small_below: 10 * MIB,
            medium_below: 50 * MIB,
            large_below: 90 * MIB,
            ..RoutingConfig::default()
        };
        assert_eq!(routing.classify(9 * MIB), SizeClass::Small);
        assert_eq!(routing.classify(90 * MIB), SizeClass::XLarge);

        let inverted = RoutingConfig {
            small_below: 60 * MIB,
            ..RoutingConfig::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_describe_storage() {
        let s3 = StorageConfig::S3 {
            bucket: "roms".to_string(),
            endpoint: None,
            region: None,
            prefix: Some("ingest".to_string()),
            access_key_id: None,
            secret_access_key: None,
            force_path_style: false,
        };
        assert_eq!(s3.describe(), "s3://roms/ingest");
    }
}
