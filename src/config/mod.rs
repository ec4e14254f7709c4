use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// API server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// API server address
    #[serde(default = "default_address")]
    pub address: String,
    /// API server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Upper bound for multipart uploads
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_upload_mb() -> usize {
    512
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            log_level: default_log_level(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL
    #[serde(default = "default_db_url")]
    pub url: String,
    /// Connection pool max size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Automatic migration on startup
    #[serde(default = "default_true")]
    pub auto_migrate: bool,
}

fn default_db_url() -> String {
    "sqlite://data/mizva.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            max_connections: default_max_connections(),
            auto_migrate: true,
        }
    }
}

/// Where images, frames and uploads are written
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Root served under `/data`; thumbnails and frames live here
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Uploaded videos and reference images
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    /// Keep a downscaled full frame next to every event thumbnail
    #[serde(default = "default_true")]
    pub save_full_frames: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("data/uploads")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            uploads_dir: default_uploads_dir(),
            save_full_frames: true,
        }
    }
}

/// Face detection and recognition configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecognitionConfig {
    /// ONNX face detector (YOLO-style output)
    #[serde(default = "default_detector_model")]
    pub detector_model: PathBuf,
    /// ONNX embedding model (ArcFace-style, 112x112 input)
    #[serde(default = "default_embedder_model")]
    pub embedder_model: PathBuf,
    #[serde(default = "default_detection_input_size")]
    pub detection_input_size: u32,
    #[serde(default = "default_embedding_input_size")]
    pub embedding_input_size: u32,
    /// Minimum detector score
    #[serde(default = "default_detection_confidence")]
    pub detection_confidence: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_max_faces")]
    pub max_faces: usize,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
    /// Match threshold used when a request does not carry one
    #[serde(default = "default_match_threshold")]
    pub default_threshold: f32,
    /// Initial global low-quality gate (runtime adjustable)
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f32,
}

fn default_detector_model() -> PathBuf {
    PathBuf::from("models/face_detector.onnx")
}

fn default_embedder_model() -> PathBuf {
    PathBuf::from("models/face_embedder.onnx")
}

fn default_detection_input_size() -> u32 {
    640
}

fn default_embedding_input_size() -> u32 {
    112
}

fn default_detection_confidence() -> f32 {
    0.5
}

fn default_iou_threshold() -> f32 {
    0.4
}

fn default_max_faces() -> usize {
    20
}

fn default_intra_threads() -> usize {
    4
}

fn default_match_threshold() -> f32 {
    0.6
}

fn default_quality_threshold() -> f32 {
    0.4
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            detector_model: default_detector_model(),
            embedder_model: default_embedder_model(),
            detection_input_size: default_detection_input_size(),
            embedding_input_size: default_embedding_input_size(),
            detection_confidence: default_detection_confidence(),
            iou_threshold: default_iou_threshold(),
            max_faces: default_max_faces(),
            intra_threads: default_intra_threads(),
            default_threshold: default_match_threshold(),
            quality_threshold: default_quality_threshold(),
        }
    }
}

/// Live RTSP ingestion configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    /// Frames per second forwarded to recognition when a camera does not set one
    #[serde(default = "default_fps")]
    pub default_fps: f64,
    /// Connection timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// tcp or udp
    #[serde(default = "default_transport")]
    pub default_transport: String,
    /// Consecutive decode failures before the camera goes to error
    #[serde(default = "default_max_decode_errors")]
    pub max_consecutive_decode_errors: u32,
    /// How long stop waits for the frame loop before aborting it
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Restart cameras that were enabled when the process exited
    #[serde(default = "default_true")]
    pub restart_on_boot: bool,
    /// Minimum gap between stored events of one camera. Live matches are
    /// still pushed to subscribers inside the window.
    #[serde(default = "default_event_cooldown_ms")]
    pub event_cooldown_ms: u64,
}

fn default_fps() -> f64 {
    3.0
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_transport() -> String {
    "tcp".to_string()
}

fn default_max_decode_errors() -> u32 {
    25
}

fn default_stop_grace_ms() -> u64 {
    2000
}

fn default_event_cooldown_ms() -> u64 {
    1000
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            default_fps: default_fps(),
            default_timeout_ms: default_timeout_ms(),
            default_transport: default_transport(),
            max_consecutive_decode_errors: default_max_decode_errors(),
            stop_grace_ms: default_stop_grace_ms(),
            restart_on_boot: true,
            event_cooldown_ms: default_event_cooldown_ms(),
        }
    }
}

/// Live event fan-out configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventsConfig {
    /// Events buffered per camera before slow subscribers start losing them
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// SSE keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_channel_capacity() -> usize {
    100
}

fn default_keep_alive_secs() -> u64 {
    15
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

/// Background job configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobsConfig {
    /// Number of jobs executed concurrently
    #[serde(default = "default_job_workers")]
    pub workers: usize,
}

fn default_job_workers() -> usize {
    2
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_job_workers(),
        }
    }
}

/// Event retention configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    /// Whether the sweep runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval in seconds between sweeps
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Initial hour thresholds; 0 disables a rule
    #[serde(default = "default_retention_hours")]
    pub matched_event_hours: u32,
    #[serde(default = "default_retention_hours")]
    pub unmatched_event_hours: u32,
    #[serde(default = "default_retention_hours")]
    pub matched_full_frame_hours: u32,
    #[serde(default = "default_retention_hours")]
    pub unmatched_full_frame_hours: u32,
}

fn default_check_interval() -> u64 {
    3600
}

fn default_retention_hours() -> u32 {
    720
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: default_check_interval(),
            matched_event_hours: default_retention_hours(),
            unmatched_event_hours: default_retention_hours(),
            matched_full_frame_hours: default_retention_hours(),
            unmatched_full_frame_hours: default_retention_hours(),
        }
    }
}

/// Load configuration from a file or use default
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => {
            let config_str = std::fs::read_to_string(path)
                .context(format!("Failed to read config file: {:?}", path))?;

            let config = if path.extension().map_or(false, |ext| ext == "json") {
                serde_json::from_str(&config_str).context("Failed to parse JSON config")?
            } else if path.extension().map_or(false, |ext| ext == "toml") {
                toml::from_str(&config_str).context("Failed to parse TOML config")?
            } else {
                return Err(anyhow::anyhow!("Unsupported config file format"));
            };

            Ok(config)
        }
        None => Ok(Config::default()),
    }
}
