//! Background analysis jobs: uploaded videos and time-boxed RTSP captures.

use crate::db::models::camera_models::Transport;
use crate::db::models::job_models::JobType;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

pub mod analysis;
pub mod manager;

pub use analysis::{AnalysisResult, JobProgress, JobRunner};
pub use manager::JobManager;

pub const MIN_RTSP_DURATION_SECS: u64 = 10;
pub const MAX_RTSP_DURATION_SECS: u64 = 300;

/// Work described by a job; stored as the job payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobRequest {
    /// Find one known face in an uploaded video
    PicToVideo {
        known_relpath: String,
        known_path: PathBuf,
        video_path: PathBuf,
        threshold: f32,
    },
    /// Detect and match every face of an uploaded video
    VideoAnalysis {
        video_path: PathBuf,
        threshold: f32,
        use_watchlist: bool,
        skip_frames: u64,
    },
    /// Same as video analysis, on `duration_secs` of a registered camera
    RtspAnalysis {
        camera_id: String,
        url: String,
        transport: Transport,
        timeout_ms: u64,
        duration_secs: u64,
        threshold: f32,
        use_watchlist: bool,
        skip_frames: u64,
    },
    /// Pair the faces of video A with their best match in video B
    VideoToVideo {
        video_a_path: PathBuf,
        video_b_path: PathBuf,
        threshold: f32,
    },
}

impl JobRequest {
    pub fn job_type(&self) -> JobType {
        match self {
            JobRequest::PicToVideo { .. } => JobType::PicToVideo,
            JobRequest::VideoAnalysis { .. } => JobType::VideoAnalysis,
            JobRequest::RtspAnalysis { .. } => JobType::RtspAnalysis,
            JobRequest::VideoToVideo { .. } => JobType::VideoToVideo,
        }
    }

    /// Fresh id in the format clients know for this job type
    pub fn new_id(&self) -> String {
        let short = &Uuid::new_v4().simple().to_string()[..8];
        match self {
            JobRequest::PicToVideo { .. } | JobRequest::VideoToVideo { .. } => {
                format!("job-{}", Uuid::new_v4())
            }
            JobRequest::VideoAnalysis { .. } => {
                format!("video_{}_{}", Utc::now().timestamp(), short)
            }
            JobRequest::RtspAnalysis { .. } => {
                format!("rtsp_{}_{}", Utc::now().timestamp(), short)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_job_type() {
        let pic = JobRequest::PicToVideo {
            known_relpath: "uploads/k.jpg".to_string(),
            known_path: PathBuf::from("/data/uploads/k.jpg"),
            video_path: PathBuf::from("/data/uploads/v.mp4"),
            threshold: 0.6,
        };
        assert!(pic.new_id().starts_with("job-"));
        assert_eq!(pic.job_type(), JobType::PicToVideo);

        let video = JobRequest::VideoAnalysis {
            video_path: PathBuf::from("/data/uploads/v.mp4"),
            threshold: 0.6,
            use_watchlist: true,
            skip_frames: 1,
        };
        let id = video.new_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts[0], "video");
        assert_eq!(parts[2].len(), 8);

        let pair = JobRequest::VideoToVideo {
            video_a_path: PathBuf::from("/data/uploads/a.mp4"),
            video_b_path: PathBuf::from("/data/uploads/b.mp4"),
            threshold: 0.6,
        };
        assert!(pair.new_id().starts_with("job-"));
        assert_eq!(pair.job_type().as_str(), "video_to_video");
    }

    #[test]
    fn payload_is_tagged() {
        let request = JobRequest::VideoAnalysis {
            video_path: PathBuf::from("v.mp4"),
            threshold: 0.5,
            use_watchlist: false,
            skip_frames: 2,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["kind"], "video_analysis");
        assert_eq!(serde_json::from_value::<JobRequest>(value).unwrap(), request);
    }
}
