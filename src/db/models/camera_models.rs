use crate::error::Error;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What a camera matches detected faces against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// One reference face uploaded with the start request
    Single,
    /// Every enrolled watchlist person
    Watchlist,
}

impl MatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::Single => "single",
            MatchMode::Watchlist => "watchlist",
        }
    }
}

impl FromStr for MatchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(MatchMode::Single),
            "watchlist" => Ok(MatchMode::Watchlist),
            other => Err(Error::Validation(format!("Unknown mode: {}", other))),
        }
    }
}

/// RTSP lower transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            other => Err(Error::Validation(format!("Unknown transport: {}", other))),
        }
    }
}

/// Lifecycle of a camera's ingestion worker.
///
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`, with `Starting`
/// and `Running` able to fall into `Error`. An errored camera can be
/// restarted or acknowledged back to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl CameraStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraStatus::Stopped => "stopped",
            CameraStatus::Starting => "starting",
            CameraStatus::Running => "running",
            CameraStatus::Stopping => "stopping",
            CameraStatus::Error => "error",
        }
    }

    /// A worker exists (or is being created) in these states.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CameraStatus::Starting | CameraStatus::Running | CameraStatus::Stopping
        )
    }

    pub fn can_transition_to(&self, next: CameraStatus) -> bool {
        use CameraStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Error, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Error)
                | (Stopping, Stopped)
                | (Error, Stopping)
                | (Error, Stopped)
        )
    }
}

impl fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CameraStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(CameraStatus::Stopped),
            "starting" => Ok(CameraStatus::Starting),
            "running" => Ok(CameraStatus::Running),
            "stopping" => Ok(CameraStatus::Stopping),
            "error" => Ok(CameraStatus::Error),
            other => Err(Error::Database(format!("Unknown camera status: {}", other))),
        }
    }
}

/// Row as stored in the `cameras` table
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CameraRow {
    pub id: String,
    pub name: String,
    pub url: String,
    pub mode: String,
    pub threshold: f64,
    pub fps: f64,
    pub transport: String,
    pub timeout_ms: i64,
    pub known_relpath: Option<String>,
    pub status: String,
    pub last_error: Option<String>,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// The part of a camera a worker needs to run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    pub mode: MatchMode,
    pub threshold: f32,
    pub fps: f64,
    pub transport: Transport,
    pub timeout_ms: u64,
    /// Reference image under the data dir, single mode only
    pub known_relpath: Option<String>,
}

/// Camera as reported to pollers: persisted configuration and status plus
/// the live counters kept by the registry.
#[derive(Debug, Clone, Serialize)]
pub struct Camera {
    #[serde(flatten)]
    pub config: CameraConfig,
    pub status: CameraStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_confidence: Option<f32>,
    pub matches_count: u64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Camera {
    pub fn id(&self) -> &str {
        &self.config.id
    }
}

pub fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

impl TryFrom<CameraRow> for Camera {
    type Error = Error;

    fn try_from(row: CameraRow) -> Result<Self, Self::Error> {
        Ok(Camera {
            config: CameraConfig {
                mode: row.mode.parse()?,
                transport: row.transport.parse()?,
                threshold: row.threshold as f32,
                fps: row.fps,
                timeout_ms: row.timeout_ms.max(0) as u64,
                known_relpath: row.known_relpath,
                id: row.id,
                name: row.name,
                url: row.url,
            },
            status: row.status.parse()?,
            last_seen: None,
            last_error: row.last_error,
            last_confidence: None,
            matches_count: 0,
            enabled: row.enabled,
            created_at: millis_to_datetime(row.created_at),
        })
    }
}
