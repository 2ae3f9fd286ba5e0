//! Configuration management for the plate importer.
//!
//! Configuration is layered: an optional `config/importer` file, an optional
//! `/etc/plate-importer/importer` file, then `IMPORTER__*` environment
//! variables (e.g. `IMPORTER__UPLOAD__URL` -> `upload.url`).

use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the importer service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Capture database configuration
    pub database: DatabaseConfig,
    /// Image share configuration
    pub images: ImageConfig,
    /// Recognition engine configuration
    #[serde(default)]
    pub recognition: RecognitionConfig,
    /// Aggregation service upload configuration
    pub upload: UploadConfig,
    /// Polling and checkpoint configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Optional vehicle classifier; the `vehicle` field is omitted without it
    #[serde(default)]
    pub vehicle: Option<VehicleConfig>,
    /// Per-camera metadata
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
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
    /// Log output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus metrics port (0 disables the exporter)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Capture database configuration
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
    /// Maximum rows fetched per camera per pass
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
}

/// Image share configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    /// Directory the image references are resolved against
    pub base_path: PathBuf,
    /// Read attempts before an unreachable share is reported
    #[serde(default = "default_image_max_attempts")]
    pub max_attempts: u32,
    /// Initial retry delay in milliseconds
    #[serde(default = "default_image_retry_ms")]
    pub retry_initial_ms: u64,
    /// File that always exists on the mounted share, relative to `base_path`.
    /// Without it, an empty `base_path` is taken to mean the share is unmounted.
    #[serde(default)]
    pub share_marker: Option<String>,
}

/// Recognition engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionConfig {
    /// Engine executable
    #[serde(default = "default_recognition_command")]
    pub command: String,
    /// Arguments placed before the engine options (e.g. for a wrapper script)
    #[serde(default)]
    pub args: Vec<String>,
    /// Country code passed to the engine (`-c`)
    #[serde(default = "default_country")]
    pub country: String,
    /// Default region hint passed to the engine (`-p`)
    #[serde(default)]
    pub region_hint: Option<String>,
    /// Engine configuration file (`--config`)
    #[serde(default)]
    pub config_file: Option<PathBuf>,
    /// Per-image engine timeout in seconds
    #[serde(default = "default_recognition_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum engine processes running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Candidates below this confidence (0.0 - 1.0) are dropped
    #[serde(default)]
    pub min_confidence: f32,
    /// Alternate candidates requested from the engine (`-n`)
    #[serde(default = "default_top_n")]
    pub top_n: u32,
}

/// Aggregation service upload configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Aggregation endpoint URL
    pub url: String,
    /// Company identifier issued by the aggregation service
    pub company_id: String,
    /// Identifier of this agent installation
    pub agent_uid: String,
    /// Request timeout in seconds
    #[serde(default = "default_upload_timeout_secs")]
    pub timeout_secs: u64,
    /// Delivery attempts per event before giving up for this pass
    #[serde(default = "default_upload_max_attempts")]
    pub max_attempts: u32,
    /// Initial backoff in milliseconds
    #[serde(default = "default_upload_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    /// Maximum backoff in milliseconds
    #[serde(default = "default_upload_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Attach the plate crop and overview images to the upload
    #[serde(default)]
    pub include_images: bool,
    /// Accept invalid TLS certificates (self-signed on-premise servers)
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Width in pixels of the uploaded plate crop thumbnail
    #[serde(default = "default_plate_thumbnail_width")]
    pub plate_thumbnail_width: u32,
    /// Width in pixels of the uploaded vehicle thumbnail
    #[serde(default = "default_vehicle_thumbnail_width")]
    pub vehicle_thumbnail_width: u32,
}

/// Vehicle classifier engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct VehicleConfig {
    /// Classifier executable; reads the image on stdin, prints JSON
    pub command: String,
    /// Arguments placed before the classifier options
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-image timeout in seconds
    #[serde(default = "default_recognition_timeout_secs")]
    pub timeout_secs: u64,
}

/// Polling and checkpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Wait between passes for a camera in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Wait after the capture store was unreachable in seconds
    #[serde(default = "default_source_retry_secs")]
    pub source_retry_secs: u64,
    /// Interval between camera discovery runs in seconds
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    /// Checkpoint state file
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
}

/// Static metadata for one camera
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Camera name as it appears in capture rows
    pub name: String,
    /// Numeric camera id registered with the aggregation service
    pub camera_id: i64,
    /// GPS latitude in decimal degrees
    pub gps_latitude: f64,
    /// GPS longitude in decimal degrees
    pub gps_longitude: f64,
}

// Default value functions
fn default_service_name() -> String {
    "plate-importer".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_batch_size() -> i64 {
    1000
}

fn default_image_max_attempts() -> u32 {
    3
}

fn default_image_retry_ms() -> u64 {
    500
}

fn default_recognition_command() -> String {
    "alpr".to_string()
}

fn default_country() -> String {
    "us".to_string()
}

fn default_recognition_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    4
}

fn default_top_n() -> u32 {
    10
}

fn default_upload_timeout_secs() -> u64 {
    10
}

fn default_plate_thumbnail_width() -> u32 {
    150
}

fn default_vehicle_thumbnail_width() -> u32 {
    256
}

fn default_upload_max_attempts() -> u32 {
    5
}

fn default_upload_backoff_initial_ms() -> u64 {
    1000
}

fn default_upload_backoff_max_ms() -> u64 {
    30000
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_source_retry_secs() -> u64 {
    15
}

fn default_discovery_interval_secs() -> u64 {
    60
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("state/checkpoints.json")
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            command: default_recognition_command(),
            args: Vec::new(),
            country: default_country(),
            region_hint: None,
            config_file: None,
            timeout_secs: default_recognition_timeout_secs(),
            max_concurrent: default_max_concurrent(),
            min_confidence: 0.0,
            top_n: default_top_n(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            source_retry_secs: default_source_retry_secs(),
            discovery_interval_secs: default_discovery_interval_secs(),
            checkpoint_path: default_checkpoint_path(),
        }
    }
}

impl Config {
    /// Load configuration from config files and environment
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/importer").required(false))
            .add_source(config::File::with_name("/etc/plate-importer/importer").required(false))
            // IMPORTER__UPLOAD__COMPANY_ID -> upload.company_id
            .add_source(
                config::Environment::with_prefix("IMPORTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingField("database.url".to_string()));
        }
        if self.database.batch_size <= 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "database.batch_size".to_string(),
                message: "Batch size must be greater than 0".to_string(),
            });
        }

        if self.upload.url.is_empty() {
            return Err(ConfigValidationError::MissingField("upload.url".to_string()));
        }
        if !self.upload.url.starts_with("http://") && !self.upload.url.starts_with("https://") {
            return Err(ConfigValidationError::InvalidValue {
                field: "upload.url".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }
        if self.upload.company_id.is_empty() {
            return Err(ConfigValidationError::MissingField("upload.company_id".to_string()));
        }
        if self.upload.agent_uid.is_empty() {
            return Err(ConfigValidationError::MissingField("upload.agent_uid".to_string()));
        }
        if self.upload.timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "upload.timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }
        if self.upload.plate_thumbnail_width == 0 || self.upload.vehicle_thumbnail_width == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "upload.plate_thumbnail_width".to_string(),
                message: "Thumbnail widths must be greater than 0".to_string(),
            });
        }
        if self.upload.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "upload.max_attempts".to_string(),
                message: "At least one attempt is required".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.recognition.min_confidence) {
            return Err(ConfigValidationError::InvalidValue {
                field: "recognition.min_confidence".to_string(),
                message: "Confidence must be between 0.0 and 1.0".to_string(),
            });
        }
        if self.recognition.timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "recognition.timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }
        if let Some(ref vehicle) = self.vehicle {
            if vehicle.command.is_empty() {
                return Err(ConfigValidationError::MissingField("vehicle.command".to_string()));
            }
            if vehicle.timeout_secs == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: "vehicle.timeout_secs".to_string(),
                    message: "Timeout must be greater than 0".to_string(),
                });
            }
        }
        if self.recognition.max_concurrent == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "recognition.max_concurrent".to_string(),
                message: "Must allow at least one engine process".to_string(),
            });
        }

        let mut names = HashSet::new();
        for camera in &self.cameras {
            if !names.insert(camera.name.as_str()) {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("cameras.{}", camera.name),
                    message: "Camera configured more than once".to_string(),
                });
            }
            if !(-90.0..=90.0).contains(&camera.gps_latitude)
                || !(-180.0..=180.0).contains(&camera.gps_longitude)
            {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("cameras.{}", camera.name),
                    message: "GPS coordinates out of range".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl DatabaseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl ImageConfig {
    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }
}

impl RecognitionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl UploadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl VehicleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn source_retry(&self) -> Duration {
        Duration::from_secs(self.source_retry_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
