use crate::config::S3Config;
use async_trait::async_trait;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from the object store
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("failed to list objects under prefix {prefix}: {message}")]
    Listing { prefix: String, message: String },

    #[error("object storage access error: {0}")]
    Access(String),

    #[error("failed to presign URL: {0}")]
    Presign(String),
}

/// Listed object key plus the timestamp that drives merge ordering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Full object key
    pub key: String,
    /// Last-modified time reported by the store
    pub last_modified: DateTime<Utc>,
}

/// Object storage the pipeline reads inputs from and writes outputs to.
///
/// Listing handles pagination transparently and returns a flat sequence in
/// the backend's listing order; callers impose merge order themselves.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object's bytes
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError>;

    /// Write an object
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError>;

    /// Delete an object
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError>;

    /// List every object under a key prefix, following pagination
    async fn list_prefix(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectInfo>, ObjectStoreError>;

    /// Presign a time-limited download URL
    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires: Duration,
    ) -> Result<String, ObjectStoreError>;

    /// Presign a time-limited upload URL
    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        expires: Duration,
    ) -> Result<String, ObjectStoreError>;
}

/// S3-backed object store
#[derive(Clone)]
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    /// Create an S3 object store from the shared AWS config
    pub fn new(sdk_config: &aws_config::SdkConfig, config: &S3Config) -> Self {
        let mut builder = S3ConfigBuilder::from(sdk_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        let client = S3Client::from_conf(builder.build());

        info!(region = %config.region, "S3 object store initialized");

        Self { client }
    }

    /// Create from a pre-built client (for testing)
    pub fn from_client(client: S3Client) -> Self {
        Self { client }
    }

    fn to_chrono(ts: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
        ts.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    ObjectStoreError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    ObjectStoreError::Access(format!("GetObject {bucket}/{key} failed: {e}"))
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Access(format!("reading {bucket}/{key} failed: {e}")))?;

        Ok(bytes.into_bytes().to_vec())
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let size = body.len();

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Access(format!("PutObject {bucket}/{key} failed: {e}")))?;

        debug!(bucket = %bucket, key = %key, size_bytes = size, "Object uploaded");
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                ObjectStoreError::Access(format!("DeleteObject {bucket}/{key} failed: {e}"))
            })?;

        debug!(bucket = %bucket, key = %key, "Object deleted");
        Ok(())
    }

    async fn list_prefix(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<ObjectInfo>, ObjectStoreError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket).prefix(prefix);

            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| ObjectStoreError::Listing {
                prefix: prefix.to_string(),
                message: e.to_string(),
            })?;

            for obj in response.contents() {
                if let Some(key) = obj.key() {
                    objects.push(ObjectInfo {
                        key: key.to_string(),
                        last_modified: Self::to_chrono(obj.last_modified()),
                    });
                }
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated() == Some(true) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires: Duration,
    ) -> Result<String, ObjectStoreError> {
        let presigning_config = PresigningConfig::expires_in(expires)
            .map_err(|e| ObjectStoreError::Presign(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| ObjectStoreError::Presign(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }

    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        expires: Duration,
    ) -> Result<String, ObjectStoreError> {
        let presigning_config = PresigningConfig::expires_in(expires)
            .map_err(|e| ObjectStoreError::Presign(e.to_string()))?;

        let presigned = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .map_err(|e| ObjectStoreError::Presign(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }
}
