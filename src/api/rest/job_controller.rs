use super::form::MultipartForm;
use super::{ApiError, ApiResult, AppState};
use crate::db::models::job_models::{JobRecord, JobStatus};
use crate::jobs::{AnalysisResult, JobRequest, MAX_RTSP_DURATION_SECS, MIN_RTSP_DURATION_SECS};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use serde::{Deserialize, Serialize};

const DEFAULT_RTSP_DURATION_SECS: u64 = 30;
const DEFAULT_JOB_LIST_LIMIT: i64 = 50;

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/api/video-analysis/start", post(start_video_analysis))
        .route("/api/video-analysis/results/:id", get(job_status))
        .route("/api/video-analysis/export/:id", get(export_analysis))
        .route("/api/rtsp-analysis/start", post(start_rtsp_analysis))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/:id", get(job_status))
        .route("/api/uploads", get(list_uploads))
}

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobAccepted {
    fn of(record: &JobRecord) -> Self {
        Self {
            job_id: record.id.clone(),
            status: record.status,
            message: None,
        }
    }
}

/// Options shared by video and RTSP analysis forms
struct AnalysisOptions {
    threshold: f32,
    use_watchlist: bool,
    skip_frames: u64,
}

fn analysis_options(state: &AppState, form: &MultipartForm) -> ApiResult<AnalysisOptions> {
    let threshold = form.parse_or("threshold", state.default_threshold)?;
    if !(0.0..=1.0).contains(&threshold) {
        return Err(ApiError::bad_request(format!(
            "threshold must be between 0 and 1, got {}",
            threshold
        )));
    }
    let skip_frames = form.parse_or("skip_frames", 1u64)?;
    if skip_frames == 0 {
        return Err(ApiError::bad_request("skip_frames must be at least 1"));
    }

    Ok(AnalysisOptions {
        threshold,
        use_watchlist: form.flag("use_watchlist", true),
        skip_frames,
    })
}

async fn start_video_analysis(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<JobAccepted>> {
    let form = MultipartForm::read(multipart).await?;
    video_analysis_from_form(&state, form).await.map(Json)
}

pub async fn video_analysis_from_form(
    state: &AppState,
    form: MultipartForm,
) -> ApiResult<JobAccepted> {
    let video = form
        .file("video")
        .ok_or_else(|| ApiError::bad_request("video file is required"))?;
    let options = analysis_options(state, &form)?;

    let video_path = state
        .uploads
        .save_video(video.file_name.as_deref(), &video.bytes)
        .await?;
    let record = state
        .jobs
        .submit(JobRequest::VideoAnalysis {
            video_path,
            threshold: options.threshold,
            use_watchlist: options.use_watchlist,
            skip_frames: options.skip_frames,
        })
        .await?;

    Ok(JobAccepted::of(&record))
}

async fn start_rtsp_analysis(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<JobAccepted>> {
    let form = MultipartForm::read(multipart).await?;
    rtsp_analysis_from_form(&state, form).await.map(Json)
}

pub async fn rtsp_analysis_from_form(
    state: &AppState,
    form: MultipartForm,
) -> ApiResult<JobAccepted> {
    let camera_id = form
        .text("rtsp_id")
        .ok_or_else(|| ApiError::bad_request("rtsp_id is required"))?;
    let duration_secs = form.parse_or("duration", DEFAULT_RTSP_DURATION_SECS)?;
    if !(MIN_RTSP_DURATION_SECS..=MAX_RTSP_DURATION_SECS).contains(&duration_secs) {
        return Err(ApiError::bad_request(format!(
            "duration must be between {} and {} seconds",
            MIN_RTSP_DURATION_SECS, MAX_RTSP_DURATION_SECS
        )));
    }
    let options = analysis_options(state, &form)?;

    let camera = state.registry.get(camera_id).await?;
    let record = state
        .jobs
        .submit(JobRequest::RtspAnalysis {
            camera_id: camera.config.id.clone(),
            url: camera.config.url.clone(),
            transport: camera.config.transport,
            timeout_ms: camera.config.timeout_ms,
            duration_secs,
            threshold: options.threshold,
            use_watchlist: options.use_watchlist,
            skip_frames: options.skip_frames,
        })
        .await?;
    info!(
        "RTSP analysis {} of camera {} for {}s",
        record.id, camera.config.id, duration_secs
    );

    Ok(JobAccepted {
        message: Some(format!(
            "Analysing {} for {} seconds",
            camera.config.id, duration_secs
        )),
        ..JobAccepted::of(&record)
    })
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobRecord>> {
    Ok(Json(state.jobs.status(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    pub format: Option<String>,
}

async fn export_analysis(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ExportParams>,
) -> ApiResult<Response> {
    let format = params.format.unwrap_or_else(|| "json".to_string());
    if format != "json" && format != "csv" {
        return Err(ApiError::bad_request(format!(
            "Unsupported format {}, use json or csv",
            format
        )));
    }

    let not_completed = || ApiError::not_found("Job not found or not completed");
    let record = state.jobs.status(&id).await.map_err(|_| not_completed())?;
    let result = match (record.status, record.result) {
        (JobStatus::Done, Some(result)) => result,
        _ => return Err(not_completed()),
    };

    if format == "csv" {
        let analysis: AnalysisResult = serde_json::from_value(result).map_err(|e| {
            ApiError::bad_request(format!("Job {} has no frame analysis: {}", id, e))
        })?;
        let disposition = format!("attachment; filename=video_analysis_{}.csv", id);
        return Ok((
            [
                (header::CONTENT_TYPE, "text/csv".to_string()),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            analysis.to_csv(),
        )
            .into_response());
    }

    let body = serde_json::to_string_pretty(&result)
        .map_err(|e| ApiError::from(crate::error::Error::from(e)))?;
    let disposition = format!("attachment; filename=video_analysis_{}.json", id);
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct JobListParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobRecord>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<JobListParams>,
) -> ApiResult<Json<JobListResponse>> {
    let limit = params.limit.unwrap_or(DEFAULT_JOB_LIST_LIMIT).clamp(1, 1000);
    Ok(Json(JobListResponse {
        jobs: state.jobs.recent(limit).await?,
    }))
}

#[derive(Debug, Serialize)]
pub struct UploadsResponse {
    pub uploads: Vec<String>,
}

async fn list_uploads(State(state): State<AppState>) -> ApiResult<Json<UploadsResponse>> {
    Ok(Json(UploadsResponse {
        uploads: state.uploads.list_videos().await?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::rest::testing::{body_bytes, body_json, test_app};
    use crate::media::testing::Step;
    use crate::services::camera_registry::CameraRegistration;
    use axum::http::StatusCode;
    use image::RgbImage;
    use std::time::Duration;

    async fn wait_for_terminal(state: &AppState, id: &str) -> JobRecord {
        for _ in 0..200 {
            let record = state.jobs.status(id).await.unwrap();
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("job {} did not finish", id);
    }

    #[tokio::test]
    async fn video_analysis_runs_and_exports() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        let mut steps: Vec<Step> = (0..4).map(|_| Step::Frame(RgbImage::new(320, 240))).collect();
        steps.push(Step::End);
        app.opener.push(steps);

        let form = MultipartForm::default()
            .with_file("video", "clip.mp4", b"not really a video".to_vec())
            .with_field("use_watchlist", "false");
        let accepted = video_analysis_from_form(&app.state, form).await.unwrap();
        assert!(accepted.job_id.starts_with("video_"));
        assert_eq!(accepted.status, JobStatus::Queued);

        let record = wait_for_terminal(&app.state, &accepted.job_id).await;
        assert_eq!(record.status, JobStatus::Done);
        assert_eq!(record.progress, 1.0);

        let json = export_analysis(
            State(app.state.clone()),
            Path(accepted.job_id.clone()),
            Query(ExportParams { format: None }),
        )
        .await
        .unwrap();
        let disposition = json.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_string();
        assert!(disposition.ends_with(&format!("video_analysis_{}.json", accepted.job_id)));
        assert_eq!(body_json(json).await["totalFrames"], 4);

        let csv = export_analysis(
            State(app.state.clone()),
            Path(accepted.job_id.clone()),
            Query(ExportParams {
                format: Some("csv".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(csv.headers()[header::CONTENT_TYPE], "text/csv");
        let csv = String::from_utf8(body_bytes(csv).await).unwrap();
        assert!(csv.starts_with("Frame,Timestamp,Faces_Count,Matched_Count,Person_Names"));

        let Json(uploads) = list_uploads(State(app.state.clone())).await.unwrap();
        assert_eq!(uploads.uploads.len(), 1);
        let Json(jobs) = list_jobs(State(app.state.clone()), Query(JobListParams { limit: None }))
            .await
            .unwrap();
        assert_eq!(jobs.jobs.len(), 1);
        app.state.jobs.shutdown().await;
    }

    #[tokio::test]
    async fn export_requires_a_finished_job_and_known_format() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;

        let err = export_analysis(
            State(app.state.clone()),
            Path("video_1_deadbeef".to_string()),
            Query(ExportParams { format: None }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, 404);
        assert_eq!(err.message, "Job not found or not completed");

        let err = export_analysis(
            State(app.state.clone()),
            Path("video_1_deadbeef".to_string()),
            Query(ExportParams {
                format: Some("xml".to_string()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, 400);

        let err = job_status(State(app.state.clone()), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND.as_u16());
        app.state.jobs.shutdown().await;
    }

    #[tokio::test]
    async fn analysis_forms_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;

        let err = video_analysis_from_form(&app.state, MultipartForm::default())
            .await
            .unwrap_err();
        assert_eq!(err.status, 400);

        let form = MultipartForm::default()
            .with_file("video", "clip.mp4", b"x".to_vec())
            .with_field("skip_frames", "0");
        let err = video_analysis_from_form(&app.state, form).await.unwrap_err();
        assert_eq!(err.status, 400);

        let form = MultipartForm::default()
            .with_field("rtsp_id", "cam-9")
            .with_field("duration", "5");
        let err = rtsp_analysis_from_form(&app.state, form).await.unwrap_err();
        assert_eq!(err.status, 400);

        let form = MultipartForm::default().with_field("rtsp_id", "cam-9");
        let err = rtsp_analysis_from_form(&app.state, form).await.unwrap_err();
        assert_eq!(err.status, 404);
        app.state.jobs.shutdown().await;
    }

    #[tokio::test]
    async fn rtsp_analysis_of_a_registered_camera_is_queued() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        app.state
            .registry
            .register(CameraRegistration {
                id: Some("cam-1".to_string()),
                url: "rtsp://10.0.0.5/stream1".to_string(),
                ..CameraRegistration::default()
            })
            .await
            .unwrap();

        let form = MultipartForm::default()
            .with_field("rtsp_id", "cam-1")
            .with_field("duration", "10");
        let accepted = rtsp_analysis_from_form(&app.state, form).await.unwrap();
        assert!(accepted.job_id.starts_with("rtsp_"));
        assert!(accepted.message.unwrap().contains("10 seconds"));

        let record = app.state.jobs.status(&accepted.job_id).await.unwrap();
        assert_eq!(record.payload["camera_id"], "cam-1");
        assert_eq!(record.payload["duration_secs"], 10);
        app.state.jobs.shutdown().await;
    }
}
