use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the animator service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Object storage configuration
    pub storage: StorageConfig,
    /// Image transformation API configuration
    pub transform: TransformConfig,
    /// Preview (watermark) configuration
    #[serde(default)]
    pub preview: PreviewConfig,
    /// Payment processor configuration
    pub payments: PaymentsConfig,
    /// Processing state machine configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Upload validation configuration
    #[serde(default)]
    pub uploads: UploadConfig,
    /// Identity migration configuration
    #[serde(default)]
    pub migration: MigrationConfig,
    /// API configuration
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

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Object storage configuration (S3 or S3-compatible)
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Bucket holding original uploads
    #[serde(default = "default_input_bucket")]
    pub input_bucket: String,
    /// Bucket holding full-resolution results
    #[serde(default = "default_output_bucket")]
    pub output_bucket: String,
    /// Bucket holding watermarked previews
    #[serde(default = "default_preview_bucket")]
    pub preview_bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Serve objects as `{public_base_url}/{bucket}/{key}` instead of presigning
    pub public_base_url: Option<String>,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Generative image API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TransformConfig {
    /// Base URL of the images API
    #[serde(default = "default_transform_api_base")]
    pub api_base: String,
    /// Bearer token for the images API
    pub api_key: String,
    /// Model name sent with each edit request
    #[serde(default = "default_transform_model")]
    pub model: String,
    /// Style prompt
    #[serde(default = "default_transform_prompt")]
    pub prompt: String,
    /// Largest input accepted for transformation
    #[serde(default = "default_transform_max_input_bytes")]
    pub max_input_bytes: usize,
    /// Request timeout in seconds
    #[serde(default = "default_transform_timeout_secs")]
    pub timeout_secs: u64,
}

/// Preview derivation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PreviewConfig {
    /// Produce a watermarked preview for every job
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Opacity of the darkening overlay (0.0 - 1.0)
    #[serde(default = "default_overlay_alpha")]
    pub overlay_alpha: f32,
}

/// Payment processor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentsConfig {
    /// Base URL of the payment processor API
    #[serde(default = "default_payments_api_base")]
    pub api_base: String,
    /// Secret API key
    pub secret_key: String,
    /// Price object charged for one unlock
    pub price_id: String,
    /// Shared secret for webhook signatures
    pub webhook_secret: Option<String>,
    /// Maximum accepted webhook timestamp skew in seconds
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,
    /// Request timeout in seconds
    #[serde(default = "default_payments_timeout_secs")]
    pub timeout_secs: u64,
}

/// Processing state machine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// An in-progress attempt older than this may be re-claimed
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

/// Upload validation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Largest accepted upload in bytes
    #[serde(default = "default_upload_max_bytes")]
    pub max_bytes: usize,
}

/// Identity migration configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Maximum job ids per cookie migration request
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "animator-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_input_bucket() -> String {
    "input-images".to_string()
}

fn default_output_bucket() -> String {
    "output-images".to_string()
}

fn default_preview_bucket() -> String {
    "preview-images".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_transform_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_transform_model() -> String {
    "gpt-image-1".to_string()
}

fn default_transform_prompt() -> String {
    "Restyle this image in a hand-painted animation look: watercolor backgrounds, \
     soft pastel palette, warm golden lighting, gentle linework and subtle film grain. \
     Keep the subject's identity, pose, camera framing and scene composition."
        .to_string()
}

fn default_transform_max_input_bytes() -> usize {
    20 * 1024 * 1024 // 20MB
}

fn default_transform_timeout_secs() -> u64 {
    180
}

fn default_overlay_alpha() -> f32 {
    0.5
}

fn default_payments_api_base() -> String {
    "https://api.stripe.com/v1".to_string()
}

fn default_webhook_tolerance_secs() -> u64 {
    300
}

fn default_payments_timeout_secs() -> u64 {
    20
}

fn default_stale_after_secs() -> u64 {
    900 // 15 minutes
}

fn default_upload_max_bytes() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_max_batch() -> usize {
    100
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
            // Start with default values
            .set_default("service.name", "animator-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/animator").required(false))
            .add_source(config::File::with_name("/etc/animator/animator").required(false))
            // Override with environment variables
            // ANIMATOR__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("ANIMATOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.storage.presigned_url_expiry_secs)
    }

    /// Get the in-progress staleness window as Duration
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.processing.stale_after_secs)
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

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            overlay_alpha: default_overlay_alpha(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_upload_max_bytes(),
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_batch: default_max_batch(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_batch(), 100);
        assert_eq!(default_overlay_alpha(), 0.5);
        assert_eq!(default_presigned_url_expiry_secs(), 3600);
        assert_eq!(default_upload_max_bytes(), 10 * 1024 * 1024);
    }

    #[test]
    fn test_minimal_document_fills_defaults() {
        let raw = serde_json::json!({
            "database": { "url": "postgres://animator@localhost/animator" },
            "storage": {},
            "transform": { "api_key": "sk-test" },
            "payments": { "secret_key": "sk_test", "price_id": "price_123" }
        });

        let config: Config = serde_json::from_value(raw).unwrap();

        assert_eq!(config.storage.input_bucket, "input-images");
        assert_eq!(config.storage.preview_bucket, "preview-images");
        assert!(config.preview.enabled);
        assert_eq!(config.migration.max_batch, 100);
        assert_eq!(config.stale_after(), Duration::from_secs(900));
        assert!(config.payments.webhook_secret.is_none());
    }
}
