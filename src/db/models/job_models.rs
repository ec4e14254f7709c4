use crate::db::models::camera_models::millis_to_datetime;
use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    PicToVideo,
    VideoAnalysis,
    RtspAnalysis,
    VideoToVideo,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::PicToVideo => "pic_to_video",
            JobType::VideoAnalysis => "video_analysis",
            JobType::RtspAnalysis => "rtsp_analysis",
            JobType::VideoToVideo => "video_to_video",
        }
    }
}

impl FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pic_to_video" => Ok(JobType::PicToVideo),
            "video_analysis" => Ok(JobType::VideoAnalysis),
            "rtsp_analysis" => Ok(JobType::RtspAnalysis),
            "video_to_video" => Ok(JobType::VideoToVideo),
            other => Err(Error::Database(format!("Unknown job type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            other => Err(Error::Database(format!("Unknown job status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: String,
    pub job_type: String,
    pub status: String,
    pub progress: f64,
    pub payload: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Job as returned by `GET /api/jobs/:id`
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: f64,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let payload = serde_json::from_str(&row.payload)?;
        let result = match row.result {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };

        Ok(JobRecord {
            job_type: row.job_type.parse()?,
            status: row.status.parse()?,
            progress: row.progress,
            payload,
            result,
            error: row.error,
            created_at: millis_to_datetime(row.created_at),
            updated_at: millis_to_datetime(row.updated_at),
            id: row.id,
        })
    }
}
