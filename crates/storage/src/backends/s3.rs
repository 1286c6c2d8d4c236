//! S3-compatible storage backend using AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteRange, ByteStream, ObjectMeta, ObjectStore, StreamingUpload};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Largest bounded range served by one `get_range` call (128 MiB).
const MAX_RANGE_SIZE: u64 = 128 * 1024 * 1024;

/// Minimum part size for S3 multipart uploads (5 MiB).
/// S3 requires all parts except the last to be at least 5 MB.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Maximum buffer size before spilling to temp file (64 MiB).
const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Tags carried by lazy-credential errors so they surface as config errors.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "romvault-s3-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "romvault-s3-credentials-resolve";

/// Deadline for the connectivity probe.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the AWS default credentials chain on the first signed request
/// rather than at construction, so creating a backend has no side effects.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn build_chain(
        &self,
    ) -> Result<aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        let region = aws_config::Region::new(self.region.clone());

        tokio::task::spawn(async move {
            aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                .region(region)
                .build()
                .await
        })
        .await
        .map_err(|join_err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_INIT_ERROR_MARKER}: failed to initialize AWS default credential chain: {join_err}"
            ))
        })
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self
            .chain
            .get_or_try_init(|| async { self.build_chain().await })
            .await?;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_RESOLVE_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

fn map_s3_operation_error<E>(err: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let err_text = err.to_string();
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credential initialization failed. Configure access keys explicitly or make ambient AWS credentials available."
                .to_string(),
        );
    }

    if let SdkError::TimeoutError(_) = err {
        return StorageError::Timeout(err_text);
    }

    StorageError::S3(Box::new(err))
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    matches!(err, SdkError::ServiceError(service_err) if service_err.raw().status().as_u16() == 404)
}

/// Connection settings for [`S3Backend`].
#[derive(Clone, Debug, Default)]
pub struct S3Settings {
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub prefix: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Use path-style URLs (`endpoint/bucket/key`). Required for MinIO and
    /// some other S3-compatible services; AWS itself wants virtual-hosted style.
    pub force_path_style: bool,
}

/// S3-compatible object store. One instance addresses one bucket.
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: Option<String>,
    endpoint: String,
    region: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend. No network traffic happens here.
    pub async fn new(settings: S3Settings) -> StorageResult<Self> {
        let S3Settings {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
        } = settings;

        if bucket.is_empty() {
            return Err(StorageError::Config(
                "s3 config requires a non-empty bucket".to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| "us-east-1".to_string());
        let mut s3_config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()));

        match (access_key_id, secret_access_key) {
            (Some(key_id), Some(secret)) => {
                let credentials = aws_sdk_s3::config::Credentials::new(
                    key_id,
                    secret,
                    None,
                    None,
                    "romvault-config",
                );
                s3_config_builder = s3_config_builder.credentials_provider(credentials);
            }
            (None, None) => {
                s3_config_builder = s3_config_builder.credentials_provider(
                    LazyDefaultCredentialsProvider::new(resolved_region.clone()),
                );
            }
            _ => {
                return Err(StorageError::Config(
                    "s3 config requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ));
            }
        }

        // Bare host:port endpoints ("minio:9000") are taken as plain HTTP.
        let normalized_endpoint = endpoint.map(|endpoint_url| {
            let endpoint_lower = endpoint_url.to_ascii_lowercase();
            if endpoint_lower.starts_with("http://") || endpoint_lower.starts_with("https://") {
                endpoint_url
            } else {
                format!("http://{endpoint_url}")
            }
        });

        if let Some(endpoint_url) = &normalized_endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);

            // Plain HTTP endpoints get an HTTP-only client, which needs no trust roots.
            if endpoint_url.to_ascii_lowercase().starts_with("http://") {
                s3_config_builder =
                    s3_config_builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        let endpoint = match normalized_endpoint {
            Some(url) => url,
            None => format!("s3.{resolved_region}.amazonaws.com"),
        };

        // "prefix/" and "prefix" address the same keys.
        let prefix = prefix
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty());

        Ok(Self {
            client,
            bucket,
            prefix,
            endpoint,
            region: resolved_region,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Get the full object key for a key (applies prefix if configured).
    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    /// Strip the configured prefix from a full object key.
    fn strip_prefix(&self, full_key: &str) -> String {
        match &self.prefix {
            Some(prefix) => full_key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(full_key)
                .to_string(),
            None => full_key.to_string(),
        }
    }

    /// Convert an AWS SDK error to StorageError, mapping 404 to NotFound.
    fn map_sdk_error<E>(err: SdkError<E>, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if is_not_found(&err) {
            return StorageError::NotFound(key.to_string());
        }
        map_s3_operation_error(err)
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let full_key = self.full_key(key);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(map_s3_operation_error(err)),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists_with_prefix(&self, prefix: &str) -> StorageResult<bool> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(self.full_key(prefix))
            .max_keys(1)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(output.key_count().unwrap_or(0) > 0 || !output.contents().is_empty())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let full_key = self.full_key(key);
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let last_modified = output.last_modified().and_then(|dt| {
            time::OffsetDateTime::from_unix_timestamp(dt.secs())
                .inspect_err(|e| {
                    tracing::debug!(key = %key, timestamp = dt.secs(), error = %e, "Unrepresentable S3 timestamp");
                })
                .ok()
        });

        let size = output.content_length().unwrap_or(0);
        Ok(ObjectMeta {
            size: u64::try_from(size).unwrap_or(0),
            last_modified,
            content_type: output.content_type().map(|s| s.to_string()),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let full_key = self.full_key(key);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?
            .into_bytes();

        Ok(bytes)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        use futures::StreamExt;

        let full_key = self.full_key(key);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let reader_stream = ReaderStream::new(output.body.into_async_read());
        let stream = reader_stream.map(|result| result.map_err(StorageError::Io));

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "s3", range = %range))]
    async fn get_range(&self, key: &str, range: ByteRange) -> StorageResult<Bytes> {
        range.validate()?;

        if range.is_empty() {
            return Ok(Bytes::new());
        }
        if let Some(len) = range.len()
            && len > MAX_RANGE_SIZE
        {
            return Err(StorageError::InvalidRange(format!(
                "range size {len} exceeds maximum {MAX_RANGE_SIZE} bytes"
            )));
        }

        let full_key = self.full_key(key);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .range(range.to_header())
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?
            .into_bytes();

        // A short body means the object is smaller than the requested range.
        if let Some(len) = range.len()
            && (bytes.len() as u64) != len
        {
            return Err(StorageError::InvalidRange(format!(
                "range {range} returned {} bytes",
                bytes.len()
            )));
        }

        Ok(bytes)
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let full_key = self.full_key(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put_if_not_exists(&self, key: &str, data: Bytes) -> StorageResult<bool> {
        // Check-then-put; a concurrent writer of the same key stores identical
        // content, so losing the race is harmless.
        if self.exists(key).await? {
            return Ok(false);
        }

        self.put(key, data).await?;
        Ok(true)
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn put_stream(&self, key: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let full_key = self.full_key(key);

        let create_output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        let upload_id = create_output
            .upload_id()
            .ok_or_else(|| StorageError::Config("S3 did not return upload_id".to_string()))?
            .to_string();

        Ok(Box::new(S3Upload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: full_key,
            upload_id,
            parts: Vec::new(),
            part_number: 1,
            bytes_written: 0,
            buffer: Vec::with_capacity(MIN_PART_SIZE),
            spill_file: None,
            spill_bytes: 0,
            spill_read_pos: 0,
        }))
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let mut results = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request.send().await.map_err(map_s3_operation_error)?;

            results.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key())
                    .map(|obj_key| self.strip_prefix(obj_key)),
            );

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        Ok(results)
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    /// Read-only probe: source buckets are often not writable.
    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn health_check(&self) -> StorageResult<()> {
        let probe = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(self.full_key(""))
            .max_keys(1)
            .send();

        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, probe).await {
            Ok(result) => result.map(|_| ()).map_err(map_s3_operation_error),
            Err(_) => Err(StorageError::Timeout(format!(
                "S3 health check of {} timed out after {}s",
                self.bucket,
                HEALTH_CHECK_TIMEOUT.as_secs()
            ))),
        }
    }
}

/// Streaming upload for S3 backend using multipart upload.
///
/// Buffers incoming data to meet S3's 5 MB minimum part size requirement.
/// If the buffer exceeds 64 MiB, data spills to a temporary file to bound memory usage.
struct S3Upload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<aws_sdk_s3::types::CompletedPart>,
    part_number: i32,
    bytes_written: u64,
    buffer: Vec<u8>,
    spill_file: Option<tokio::fs::File>,
    /// Bytes written to the spill file.
    spill_bytes: usize,
    /// Offset of the first spilled byte not yet uploaded.
    spill_read_pos: usize,
}

impl S3Upload {
    async fn upload_part(&mut self, data: Bytes) -> StorageResult<()> {
        let upload_output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(self.part_number)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        let completed_part = aws_sdk_s3::types::CompletedPart::builder()
            .e_tag(upload_output.e_tag().unwrap_or_default())
            .part_number(self.part_number)
            .build();

        self.parts.push(completed_part);
        self.part_number += 1;

        Ok(())
    }

    async fn upload_spilled_parts(&mut self) -> StorageResult<()> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        while self.spill_bytes - self.spill_read_pos >= MIN_PART_SIZE {
            let Some(file) = self.spill_file.as_mut() else {
                return Ok(());
            };
            file.seek(std::io::SeekFrom::Start(self.spill_read_pos as u64))
                .await?;

            let mut part_data = vec![0u8; MIN_PART_SIZE];
            file.read_exact(&mut part_data).await?;
            self.spill_read_pos += MIN_PART_SIZE;

            self.upload_part(Bytes::from(part_data)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StreamingUpload for S3Upload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        use tokio::io::AsyncWriteExt;

        self.bytes_written += data.len() as u64;

        if let Some(ref mut file) = self.spill_file {
            file.write_all(&data).await?;
            self.spill_bytes += data.len();
        } else {
            self.buffer.extend_from_slice(&data);

            if self.buffer.len() > MAX_BUFFER_SIZE {
                let mut file = tokio::fs::File::from_std(tempfile::tempfile()?);
                file.write_all(&self.buffer).await?;
                self.spill_bytes = self.buffer.len();
                self.buffer = Vec::new();
                self.spill_file = Some(file);
                tracing::debug!(
                    key = %self.key,
                    spill_bytes = self.spill_bytes,
                    "S3 upload spilled to temp file"
                );
            }
        }

        self.upload_spilled_parts().await?;

        while self.spill_file.is_none() && self.buffer.len() >= MIN_PART_SIZE {
            let part_data: Vec<u8> = self.buffer.drain(..MIN_PART_SIZE).collect();
            self.upload_part(Bytes::from(part_data)).await?;
        }

        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        // Whatever is left goes up as the last part, which may be under 5 MB.
        let mut final_data = Vec::new();

        if let Some(mut file) = self.spill_file.take() {
            let remaining = self.spill_bytes - self.spill_read_pos;
            if remaining > 0 {
                file.seek(std::io::SeekFrom::Start(self.spill_read_pos as u64))
                    .await?;
                final_data.reserve(remaining);
                file.take(remaining as u64)
                    .read_to_end(&mut final_data)
                    .await?;
            }
        }

        final_data.extend_from_slice(&self.buffer);

        if !final_data.is_empty() {
            self.upload_part(Bytes::from(final_data)).await?;
        }

        // Multipart uploads need at least one non-empty part; empty objects
        // go through PutObject instead.
        if self.parts.is_empty() {
            if let Err(e) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .upload_id(&self.upload_id)
                .send()
                .await
            {
                tracing::warn!(
                    key = %self.key,
                    upload_id = %self.upload_id,
                    error = %e,
                    "Failed to abort multipart upload for empty object"
                );
            }

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(Bytes::new().into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;

            return Ok(self.bytes_written);
        }

        let completed_upload = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(self.bytes_written)
    }

    async fn abort(self: Box<Self>) -> StorageResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(())
    }
}
