// pg-s3-backup/src/backup/s3_storage.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use s3::config::Region;
use s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use s3::primitives::{ByteStream, Length};
use s3::types::{CompletedMultipartUpload, CompletedPart, ServerSideEncryption};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::SpacesConfig;
use crate::errors::{BackupError, Result};

/// One object as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

/// A single page of a listing. `next_token` is opaque and only meaningful to the store.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub objects: Vec<StoredObject>,
    pub next_token: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    async fn upload(&self, local_path: &Path, key: &str) -> Result<()>;

    async fn list_page(&self, prefix: &str, continuation: Option<String>) -> Result<ObjectPage>;

    /// Deleting a key that no longer exists succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Lazily walks every object under a prefix, fetching pages on demand.
///
/// A listing starts from the first page each time it is created. Once a page
/// request fails the listing is finished and cannot be resumed.
pub struct ObjectListing<'a> {
    store: &'a dyn ObjectStore,
    prefix: String,
    buffered: VecDeque<StoredObject>,
    continuation: Option<String>,
    exhausted: bool,
}

impl<'a> ObjectListing<'a> {
    pub fn new(store: &'a dyn ObjectStore, prefix: impl Into<String>) -> Self {
        ObjectListing {
            store,
            prefix: prefix.into(),
            buffered: VecDeque::new(),
            continuation: None,
            exhausted: false,
        }
    }

    pub async fn next_object(&mut self) -> Result<Option<StoredObject>> {
        loop {
            if let Some(object) = self.buffered.pop_front() {
                return Ok(Some(object));
            }
            if self.exhausted {
                return Ok(None);
            }

            let page = match self
                .store
                .list_page(&self.prefix, self.continuation.take())
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    self.exhausted = true;
                    return Err(e);
                }
            };
            self.buffered.extend(page.objects);
            match page.next_token {
                Some(token) => self.continuation = Some(token),
                None => self.exhausted = true,
            }
        }
    }
}

/// Maps the configured SSE mode onto the header value, or `None` to omit the header.
pub fn server_side_encryption(mode: &str) -> Option<ServerSideEncryption> {
    let mode = mode.trim();
    if mode.eq_ignore_ascii_case("AES256") {
        Some(ServerSideEncryption::Aes256)
    } else if mode.eq_ignore_ascii_case("aws:kms") {
        Some(ServerSideEncryption::AwsKms)
    } else {
        None
    }
}

/// S3 accepts at most this many parts in one multipart upload.
pub const MAX_MULTIPART_PARTS: u64 = 10_000;

/// Part size for a multipart upload of `size` bytes: the configured chunk,
/// grown when needed so the upload fits in [`MAX_MULTIPART_PARTS`].
pub fn multipart_part_size(size: u64, chunk_bytes: u64) -> u64 {
    chunk_bytes.max(size.div_ceil(MAX_MULTIPART_PARTS)).max(1)
}

/// `(part_number, offset, length)` for each part, numbered from 1.
fn part_ranges(size: u64, part_size: u64) -> Vec<(i32, u64, u64)> {
    let mut ranges = Vec::new();
    let mut offset = 0u64;
    let mut part_number = 1i32;
    while offset < size {
        let length = part_size.min(size - offset);
        ranges.push((part_number, offset, length));
        offset += length;
        part_number += 1;
    }
    ranges
}

/// S3-compatible storage (Scaleway, DigitalOcean Spaces...) addressed path-style.
pub struct S3Storage {
    client: s3::Client,
    bucket: String,
    sse: Option<ServerSideEncryption>,
    multipart_chunk_bytes: u64,
}

impl S3Storage {
    pub async fn connect(spaces_config: &SpacesConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static",
            ))
            .load()
            .await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        let sse = server_side_encryption(&spaces_config.sse_mode);
        if sse.is_none() && !spaces_config.sse_mode.trim().is_empty() {
            warn!(
                "S3_SSE value '{}' is not recognised (expected AES256 or aws:kms); uploading without server-side encryption",
                spaces_config.sse_mode
            );
        }

        S3Storage::with_client(
            s3::Client::from_conf(s3_config),
            &spaces_config.bucket_name,
            sse,
            spaces_config.multipart_chunk_bytes,
        )
    }

    pub fn with_client(
        client: s3::Client,
        bucket: &str,
        sse: Option<ServerSideEncryption>,
        multipart_chunk_bytes: u64,
    ) -> Self {
        S3Storage {
            client,
            bucket: bucket.to_string(),
            sse,
            multipart_chunk_bytes,
        }
    }

    fn upload_error(
        &self,
        local_path: &Path,
        key: &str,
        provider_code: Option<String>,
        provider_message: Option<String>,
    ) -> BackupError {
        BackupError::Upload {
            local_path: local_path.to_path_buf(),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            provider_code,
            provider_message,
        }
    }

    fn sdk_upload_error<E, R>(&self, local_path: &Path, key: &str, err: &SdkError<E, R>) -> BackupError
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
        R: Debug,
    {
        let (code, message) = provider_details(err);
        self.upload_error(local_path, key, code, message)
    }

    async fn put_single(&self, local_path: &Path, key: &str) -> Result<()> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| self.upload_error(local_path, key, None, Some(e.to_string())))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .set_server_side_encryption(self.sse.clone())
            .send()
            .await
            .map_err(|e| self.sdk_upload_error(local_path, key, &e))?;
        Ok(())
    }

    async fn put_multipart(&self, local_path: &Path, key: &str, size: u64) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_server_side_encryption(self.sse.clone())
            .send()
            .await
            .map_err(|e| self.sdk_upload_error(local_path, key, &e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| {
                self.upload_error(
                    local_path,
                    key,
                    None,
                    Some("provider returned no multipart upload id".to_string()),
                )
            })?
            .to_string();

        let result = self.send_parts(local_path, key, &upload_id, size).await;
        if result.is_err() {
            if let Err(abort_err) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                warn!(
                    "Could not abort multipart upload {} for {}: {}",
                    upload_id,
                    key,
                    DisplayErrorContext(&abort_err)
                );
            }
        }
        result
    }

    async fn send_parts(&self, local_path: &Path, key: &str, upload_id: &str, size: u64) -> Result<()> {
        let part_size = multipart_part_size(size, self.multipart_chunk_bytes);
        if part_size > self.multipart_chunk_bytes {
            info!(
                "Raising part size of {} to {} bytes to stay within {} parts",
                key, part_size, MAX_MULTIPART_PARTS
            );
        }

        let mut parts = Vec::new();
        for (part_number, offset, length) in part_ranges(size, part_size) {
            let body = ByteStream::read_from()
                .path(local_path)
                .offset(offset)
                .length(Length::Exact(length))
                .build()
                .await
                .map_err(|e| self.upload_error(local_path, key, None, Some(e.to_string())))?;

            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .content_length(length as i64)
                .body(body)
                .send()
                .await
                .map_err(|e| self.sdk_upload_error(local_path, key, &e))?;

            debug!("Uploaded part {} ({} bytes) of {}", part_number, length, key);
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| self.sdk_upload_error(local_path, key, &e))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload(&self, local_path: &Path, key: &str) -> Result<()> {
        let size = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| self.upload_error(local_path, key, None, Some(e.to_string())))?
            .len();

        info!("[upload] s3://{}/{} <- {} ({} bytes)", self.bucket, key, local_path.display(), size);
        if size > self.multipart_chunk_bytes {
            self.put_multipart(local_path, key, size).await
        } else {
            self.put_single(local_path, key).await
        }
    }

    async fn list_page(&self, prefix: &str, continuation: Option<String>) -> Result<ObjectPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| storage_error("list", &self.bucket, prefix, &e))?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|object| {
                let key = object.key()?;
                let last_modified = object.last_modified().and_then(to_utc);
                if last_modified.is_none() {
                    debug!("Skipping {} without a usable last-modified time", key);
                }
                Some(StoredObject {
                    key: key.to_string(),
                    last_modified: last_modified?,
                })
            })
            .collect();

        let next_token = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ObjectPage { objects, next_token })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                if provider_details(&err).0.as_deref() == Some("NoSuchKey") {
                    debug!("{} was already gone", key);
                    return Ok(());
                }
                Err(storage_error("delete", &self.bucket, key, &err))
            }
        }
    }
}

fn provider_details<E, R>(err: &SdkError<E, R>) -> (Option<String>, Option<String>)
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: Debug,
{
    match err.as_service_error() {
        Some(service) => (
            service.code().map(str::to_string),
            service.message().map(str::to_string),
        ),
        None => (None, Some(DisplayErrorContext(err).to_string())),
    }
}

fn storage_error<E, R>(operation: &'static str, bucket: &str, target: &str, err: &SdkError<E, R>) -> BackupError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: Debug,
{
    let (code, message) = provider_details(err);
    BackupError::Storage {
        operation,
        bucket: bucket.to_string(),
        target: target.to_string(),
        message: format!(
            "{} - {}",
            code.as_deref().unwrap_or("Unknown"),
            message.as_deref().unwrap_or("no message from provider")
        ),
    }
}

fn to_utc(timestamp: &s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp.secs(), timestamp.subsec_nanos())
}
