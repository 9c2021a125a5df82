use crate::config::StorageConfig;
use crate::job::JobId;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Logical bucket. Input, output and preview live in separate namespaces so
/// locked and unlocked content can never be cross-served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Input,
    Output,
    Preview,
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Bucket::Input => "input",
            Bucket::Output => "output",
            Bucket::Preview => "preview",
        };
        f.write_str(name)
    }
}

/// Bytes plus their MIME type
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

impl Blob {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object {bucket}/{key} not found")]
    NotFound { bucket: Bucket, key: String },

    #[error("Failed to {operation} {bucket}/{key}: {message}")]
    Request {
        operation: &'static str,
        bucket: Bucket,
        key: String,
        message: String,
    },
}

/// Blob storage seam over the three buckets
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write a blob, replacing any previous object under the key
    async fn put(&self, bucket: Bucket, key: &str, blob: Blob) -> Result<(), StorageError>;

    /// Read a blob; a missing key is [`StorageError::NotFound`]
    async fn get(&self, bucket: Bucket, key: &str) -> Result<Blob, StorageError>;

    /// Resolve the input key uploaded for a job (`{job_id}.{ext}`) with a single listing
    async fn find_input(&self, job_id: &JobId) -> Result<Option<String>, StorageError>;

    async fn delete(&self, bucket: Bucket, key: &str) -> Result<(), StorageError>;

    /// Retrievable URL for a stored object
    async fn url(&self, bucket: Bucket, key: &str) -> Result<String, StorageError>;
}

/// Key of the original upload
pub fn input_key(job_id: &JobId, extension: &str) -> String {
    format!("{}.{}", job_id, extension)
}

/// Key of the full-resolution result
pub fn output_key(job_id: &JobId, extension: &str) -> String {
    format!("{}_out.{}", job_id, extension)
}

/// Key of the watermarked preview (always PNG)
pub fn preview_key(job_id: &JobId) -> String {
    format!("{}.png", job_id)
}

/// Get content type for a file extension
pub fn content_type_for_extension(extension: &str) -> &'static str {
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Get the key extension for an image content type
pub fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();

    match essence.as_str() {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        _ => None,
    }
}

/// S3-backed storage gateway
pub struct S3Gateway {
    client: S3Client,
    config: StorageConfig,
    presigned_url_expiry: Duration,
}

impl S3Gateway {
    /// Create a new S3 gateway
    pub async fn new(config: &StorageConfig) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            input_bucket = %config.input_bucket,
            output_bucket = %config.output_bucket,
            preview_bucket = %config.preview_bucket,
            region = %config.region,
            "S3 gateway initialized"
        );

        Self {
            client,
            config: config.clone(),
            presigned_url_expiry: Duration::from_secs(config.presigned_url_expiry_secs),
        }
    }

    fn bucket_name(&self, bucket: Bucket) -> &str {
        match bucket {
            Bucket::Input => &self.config.input_bucket,
            Bucket::Output => &self.config.output_bucket,
            Bucket::Preview => &self.config.preview_bucket,
        }
    }

    /// Simple single-part upload for small files
    async fn simple_upload(&self, bucket: Bucket, key: &str, blob: Blob) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(self.bucket_name(bucket))
            .key(key)
            .body(ByteStream::from(blob.bytes))
            .content_type(blob.content_type)
            .send()
            .await
            .map_err(|e| request_error("upload", bucket, key, DisplayErrorContext(e)))?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(&self, bucket: Bucket, key: &str, blob: Blob) -> Result<(), StorageError> {
        let bucket_name = self.bucket_name(bucket);

        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(bucket_name)
            .key(key)
            .content_type(&blob.content_type)
            .send()
            .await
            .map_err(|e| request_error("start multipart upload", bucket, key, DisplayErrorContext(e)))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| request_error("start multipart upload", bucket, key, "no upload id in response"))?;

        let mut completed_parts = Vec::new();

        for (index, chunk) in blob.bytes.chunks(self.config.part_size_bytes).enumerate() {
            let part_number = index as i32 + 1;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(bucket_name)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| request_error("upload part", bucket, key, DisplayErrorContext(e)))?;

            completed_parts.push(
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        let completed_upload = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket_name)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| request_error("complete multipart upload", bucket, key, DisplayErrorContext(e)))?;

        Ok(())
    }
}

#[async_trait]
impl BlobStore for S3Gateway {
    #[instrument(skip(self, blob), fields(size_bytes = blob.bytes.len()))]
    async fn put(&self, bucket: Bucket, key: &str, blob: Blob) -> Result<(), StorageError> {
        if blob.bytes.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(bucket, key, blob).await?;
        } else {
            self.simple_upload(bucket, key, blob).await?;
        }

        debug!("Object uploaded");
        metrics::counter!("animator.storage.uploads").increment(1);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, bucket: Bucket, key: &str) -> Result<Blob, StorageError> {
        let response = match self
            .client
            .get_object()
            .bucket(self.bucket_name(bucket))
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(StorageError::NotFound {
                        bucket,
                        key: key.to_string(),
                    });
                }
                return Err(request_error("download", bucket, key, DisplayErrorContext(e)));
            }
        };

        let content_type = response
            .content_type()
            .map(String::from)
            .unwrap_or_else(|| {
                let extension = key.rsplit('.').next().unwrap_or_default();
                content_type_for_extension(extension).to_string()
            });

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| request_error("read body of", bucket, key, e))?
            .into_bytes()
            .to_vec();

        Ok(Blob::new(bytes, content_type))
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn find_input(&self, job_id: &JobId) -> Result<Option<String>, StorageError> {
        let prefix = format!("{}.", job_id);

        let response = self
            .client
            .list_objects_v2()
            .bucket(self.bucket_name(Bucket::Input))
            .prefix(&prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| request_error("list", Bucket::Input, &prefix, DisplayErrorContext(e)))?;

        Ok(response
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(String::from))
            .next())
    }

    #[instrument(skip(self))]
    async fn delete(&self, bucket: Bucket, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(self.bucket_name(bucket))
            .key(key)
            .send()
            .await
            .map_err(|e| request_error("delete", bucket, key, DisplayErrorContext(e)))?;

        debug!("Object deleted");
        Ok(())
    }

    async fn url(&self, bucket: Bucket, key: &str) -> Result<String, StorageError> {
        if let Some(ref base) = self.config.public_base_url {
            return Ok(format!(
                "{}/{}/{}",
                base.trim_end_matches('/'),
                self.bucket_name(bucket),
                key
            ));
        }

        let presigning_config = PresigningConfig::expires_in(self.presigned_url_expiry)
            .map_err(|e| request_error("presign", bucket, key, e))?;

        let presigned = self
            .client
            .get_object()
            .bucket(self.bucket_name(bucket))
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| request_error("presign", bucket, key, DisplayErrorContext(e)))?;

        Ok(presigned.uri().to_string())
    }
}

fn request_error(
    operation: &'static str,
    bucket: Bucket,
    key: &str,
    message: impl fmt::Display,
) -> StorageError {
    StorageError::Request {
        operation,
        bucket,
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// In-process blob store with the same contract as [`S3Gateway`]
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<(Bucket, String), Blob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, bucket: Bucket, key: &str) -> bool {
        self.objects.lock().contains_key(&(bucket, key.to_string()))
    }

    pub fn object_count(&self, bucket: Bucket) -> usize {
        self.objects.lock().keys().filter(|(b, _)| *b == bucket).count()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bucket: Bucket, key: &str, blob: Blob) -> Result<(), StorageError> {
        self.objects.lock().insert((bucket, key.to_string()), blob);
        Ok(())
    }

    async fn get(&self, bucket: Bucket, key: &str) -> Result<Blob, StorageError> {
        self.objects
            .lock()
            .get(&(bucket, key.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket,
                key: key.to_string(),
            })
    }

    async fn find_input(&self, job_id: &JobId) -> Result<Option<String>, StorageError> {
        let prefix = format!("{}.", job_id);
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .keys()
            .filter(|(b, k)| *b == Bucket::Input && k.starts_with(&prefix))
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        Ok(keys.into_iter().next())
    }

    async fn delete(&self, bucket: Bucket, key: &str) -> Result<(), StorageError> {
        self.objects.lock().remove(&(bucket, key.to_string()));
        Ok(())
    }

    async fn url(&self, bucket: Bucket, key: &str) -> Result<String, StorageError> {
        Ok(format!("memory://{}/{}", bucket, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_conventions() {
        let job_id = JobId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap();

        assert_eq!(
            input_key(&job_id, "jpg"),
            "550e8400-e29b-41d4-a716-446655440000.jpg"
        );
        assert_eq!(
            output_key(&job_id, "png"),
            "550e8400-e29b-41d4-a716-446655440000_out.png"
        );
        assert_eq!(
            preview_key(&job_id),
            "550e8400-e29b-41d4-a716-446655440000.png"
        );
    }

    #[test]
    fn test_content_type_for_extension() {
        assert_eq!(content_type_for_extension("jpeg"), "image/jpeg");
        assert_eq!(content_type_for_extension("JPG"), "image/jpeg");
        assert_eq!(content_type_for_extension("png"), "image/png");
        assert_eq!(content_type_for_extension("unknown"), "application/octet-stream");
    }

    #[test]
    fn test_extension_for_content_type() {
        assert_eq!(extension_for_content_type("image/jpeg"), Some("jpg"));
        assert_eq!(extension_for_content_type("image/PNG; charset=binary"), Some("png"));
        assert_eq!(extension_for_content_type("image/webp"), Some("webp"));
        assert_eq!(extension_for_content_type("application/pdf"), None);
    }

    #[tokio::test]
    async fn test_memory_store_find_input_uses_job_prefix() {
        let store = MemoryBlobStore::new();
        let job_id = JobId::parse("abc").unwrap();

        store
            .put(Bucket::Input, "abcd.png", Blob::new(vec![1], "image/png"))
            .await
            .unwrap();
        assert_eq!(store.find_input(&job_id).await.unwrap(), None);

        store
            .put(Bucket::Input, "abc.webp", Blob::new(vec![2], "image/webp"))
            .await
            .unwrap();
        assert_eq!(
            store.find_input(&job_id).await.unwrap(),
            Some("abc.webp".to_string())
        );
    }

    #[tokio::test]
    async fn test_memory_store_missing_object_is_not_found() {
        let store = MemoryBlobStore::new();
        let err = store.get(Bucket::Output, "nope.png").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { bucket: Bucket::Output, .. }));
    }
}
