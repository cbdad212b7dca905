use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the merge service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration (input, quarantine, output buckets)
    pub s3: S3Config,
    /// DynamoDB configuration for the group status table
    pub dynamodb: DynamoDbConfig,
    /// Merge pipeline configuration
    #[serde(default)]
    pub merge: MergeConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding uploaded input files and manifests
    pub valid_bucket: String,
    /// Bucket receiving quarantined files after a failed merge
    pub invalid_bucket: String,
    /// Bucket receiving merged output documents
    pub output_bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Download presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Upload presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub upload_url_expiry_secs: u64,
}

/// DynamoDB configuration for the group status table
#[derive(Debug, Clone, Deserialize)]
pub struct DynamoDbConfig {
    /// Table name holding one record per group id
    pub table_name: String,
    /// Custom endpoint URL (for LocalStack/dynamodb-local)
    pub endpoint_url: Option<String>,
}

/// Merge pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MergeConfig {
    /// Extension of files that participate in a merge
    #[serde(default = "default_input_extension")]
    pub input_extension: String,
    /// TTL horizon for group records in seconds
    #[serde(default = "default_group_ttl_secs")]
    pub group_ttl_secs: u64,
    /// Maximum attempts when allocating a unique group id
    #[serde(default = "default_alloc_max_attempts")]
    pub alloc_max_attempts: u32,
    /// Concurrent quarantine copies
    #[serde(default = "default_quarantine_concurrency")]
    pub quarantine_concurrency: usize,
    /// Delete input files after a successful merge
    #[serde(default)]
    pub delete_inputs_after_merge: bool,
    /// Poller wait attempts before returning "still processing"
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    /// Poller wait interval between attempts in milliseconds
    #[serde(default = "default_poll_wait_interval_ms")]
    pub poll_wait_interval_ms: u64,
    /// Extensions accepted by the upload URL endpoint
    #[serde(default = "default_allowed_upload_extensions")]
    pub allowed_upload_extensions: Vec<String>,
}

/// API configuration for the HTTP surface
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Allowed CORS origins (empty = allow any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "merge-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    30
}

fn default_input_extension() -> String {
    ".pdf".to_string()
}

fn default_group_ttl_secs() -> u64 {
    60 * 60
}

fn default_alloc_max_attempts() -> u32 {
    5
}

fn default_quarantine_concurrency() -> usize {
    4
}

fn default_max_poll_attempts() -> u32 {
    1
}

fn default_poll_wait_interval_ms() -> u64 {
    2000
}

fn default_allowed_upload_extensions() -> Vec<String> {
    vec![".pdf".to_string(), ".json".to_string()]
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "merge-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/merge").required(false))
            .add_source(config::File::with_name("/etc/merge/merge").required(false))
            // MERGE__S3__VALID_BUCKET -> s3.valid_bucket
            .add_source(
                config::Environment::with_prefix("MERGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get download presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.presigned_url_expiry_secs)
    }

    /// Get upload presigned URL expiry as Duration
    pub fn upload_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.upload_url_expiry_secs)
    }

    /// Get group record TTL as Duration
    pub fn group_ttl(&self) -> Duration {
        Duration::from_secs(self.merge.group_ttl_secs)
    }

    /// Get poll wait interval as Duration
    pub fn poll_wait_interval(&self) -> Duration {
        Duration::from_millis(self.merge.poll_wait_interval_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            input_extension: default_input_extension(),
            group_ttl_secs: default_group_ttl_secs(),
            alloc_max_attempts: default_alloc_max_attempts(),
            quarantine_concurrency: default_quarantine_concurrency(),
            delete_inputs_after_merge: false,
            max_poll_attempts: default_max_poll_attempts(),
            poll_wait_interval_ms: default_poll_wait_interval_ms(),
            allowed_upload_extensions: default_allowed_upload_extensions(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_alloc_max_attempts(), 5);
        assert_eq!(default_group_ttl_secs(), 3600);
        assert_eq!(default_presigned_url_expiry_secs(), 30);
        assert_eq!(default_input_extension(), ".pdf");
    }

    #[test]
    fn test_default_upload_extensions_include_manifest() {
        let exts = default_allowed_upload_extensions();
        assert!(exts.contains(&".pdf".to_string()));
        assert!(exts.contains(&".json".to_string()));
    }
}
