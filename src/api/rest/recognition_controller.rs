use super::form::MultipartForm;
use super::job_controller::JobAccepted;
use super::{ApiError, ApiResult, AppState};
use crate::jobs::JobRequest;
use crate::services::compare::{self, Comparison};
use axum::extract::{Multipart, State};
use axum::routing::post;
use axum::{Json, Router};
use log::info;
use serde::Serialize;

const KNOWN_DIR: &str = "uploads";

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/api/compare", post(compare_faces))
        .route("/api/recognize/pic-to-video", post(pic_to_video))
        .route("/api/recognize/video-to-video", post(video_to_video))
}

#[derive(Debug, Serialize)]
pub struct CompareResponse {
    pub ok: bool,
    pub data: Comparison,
}

async fn compare_faces(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<CompareResponse>> {
    let form = MultipartForm::read(multipart).await?;
    compare_from_form(&state, form).await.map(Json)
}

pub async fn compare_from_form(state: &AppState, form: MultipartForm) -> ApiResult<CompareResponse> {
    let (first, second) = match (form.file("file1"), form.file("file2")) {
        (Some(a), Some(b)) => (a.bytes.clone(), b.bytes.clone()),
        _ => return Err(ApiError::bad_request("file1 and file2 are required")),
    };
    let threshold = form.parse_or("threshold", state.default_threshold)?;

    let data = compare::compare(
        state.engine.clone(),
        state.uploads.data_dir().to_path_buf(),
        first,
        second,
        threshold,
    )
    .await?;
    info!(
        "Compared two faces: similarity {:.3}, same person {}",
        data.similarity, data.is_same_person
    );

    Ok(CompareResponse { ok: true, data })
}

async fn pic_to_video(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<JobAccepted>> {
    let form = MultipartForm::read(multipart).await?;
    pic_to_video_from_form(&state, form).await.map(Json)
}

pub async fn pic_to_video_from_form(state: &AppState, form: MultipartForm) -> ApiResult<JobAccepted> {
    let (known, video) = match (form.file("known"), form.file("video")) {
        (Some(known), Some(video)) => (known, video),
        _ => return Err(ApiError::bad_request("known (image) and video are required")),
    };
    let threshold = match_threshold(state, &form)?;

    let known_relpath = state
        .uploads
        .save_image(KNOWN_DIR, "known", known.file_name.as_deref(), &known.bytes)
        .await?;
    let known_path = state.uploads.data_path(&known_relpath)?;
    let video_path = state
        .uploads
        .save_video(video.file_name.as_deref(), &video.bytes)
        .await?;

    let record = state
        .jobs
        .submit(JobRequest::PicToVideo {
            known_relpath,
            known_path,
            video_path,
            threshold,
        })
        .await?;

    Ok(JobAccepted {
        job_id: record.id,
        status: record.status,
        message: None,
    })
}

async fn video_to_video(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<JobAccepted>> {
    let form = MultipartForm::read(multipart).await?;
    video_to_video_from_form(&state, form).await.map(Json)
}

pub async fn video_to_video_from_form(
    state: &AppState,
    form: MultipartForm,
) -> ApiResult<JobAccepted> {
    let (video_a, video_b) = match (form.file("videoA"), form.file("videoB")) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(ApiError::bad_request("videoA and videoB are required")),
    };
    let threshold = match_threshold(state, &form)?;

    let video_a_path = state
        .uploads
        .save_video(video_a.file_name.as_deref(), &video_a.bytes)
        .await?;
    let video_b_path = state
        .uploads
        .save_video(video_b.file_name.as_deref(), &video_b.bytes)
        .await?;

    let record = state
        .jobs
        .submit(JobRequest::VideoToVideo {
            video_a_path,
            video_b_path,
            threshold,
        })
        .await?;

    Ok(JobAccepted {
        job_id: record.id,
        status: record.status,
        message: None,
    })
}

fn match_threshold(state: &AppState, form: &MultipartForm) -> ApiResult<f32> {
    let threshold = form.parse_or("threshold", state.default_threshold)?;
    if !(0.0..=1.0).contains(&threshold) {
        return Err(ApiError::bad_request(format!(
            "threshold must be between 0 and 1, got {}",
            threshold
        )));
    }
    Ok(threshold)
}
