use super::form::MultipartForm;
use super::{ApiError, ApiResult, AppState};
use crate::db::models::camera_models::{Camera, CameraStatus, MatchMode, Transport};
use crate::error::{domain_error, Error};
use crate::services::camera_registry::{is_valid_source_url, CameraRegistration};
use crate::services::compare::face_embedding;
use axum::body::StreamBody;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

const MJPEG_POLL: Duration = Duration::from_millis(40);
const KNOWN_DIR: &str = "uploads";

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/api/rtsp/start", post(start_camera))
        .route("/api/rtsp/stop", post(stop_camera))
        .route("/api/rtsp/status/:id", get(camera_status))
        .route("/api/rtsp/events/:id", get(camera_events))
        .route("/api/rtsp/snapshot/:id", get(camera_snapshot))
        .route("/api/rtsp/stream/:id", get(camera_stream))
        .route("/api/cameras", get(list_cameras))
        .route("/api/cameras/cleanup", post(cleanup_cameras))
        .route("/api/cameras/reload", post(reload_cameras))
        .route("/api/cameras/:id", delete(delete_camera))
}

/// Result of start and stop; unknown cameras report `not_found` with a 404
#[derive(Debug, Serialize)]
pub struct CameraStateResponse {
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl CameraStateResponse {
    fn of(camera: &Camera) -> Self {
        Self {
            id: camera.config.id.clone(),
            status: camera.status.as_str().to_string(),
            last_error: camera.last_error.clone(),
        }
    }
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(CameraStateResponse {
            id: id.to_string(),
            status: "not_found".to_string(),
            last_error: None,
        }),
    )
        .into_response()
}

/// Turn a camera lookup failure into the polling shape
fn camera_or_not_found(id: &str, result: anyhow::Result<Camera>) -> Result<Camera, Response> {
    match result {
        Ok(camera) => Ok(camera),
        Err(e) if matches!(domain_error(&e), Some(Error::NotFound(_))) => Err(not_found(id)),
        Err(e) => Err(ApiError::from(e).into_response()),
    }
}

async fn start_camera(State(state): State<AppState>, multipart: Multipart) -> Response {
    match MultipartForm::read(multipart).await {
        Ok(form) => match start_from_form(&state, form).await {
            Ok(response) => Json(response).into_response(),
            Err(e) => e.into_response(),
        },
        Err(e) => e.into_response(),
    }
}

/// Register (or update) the camera from the form and start it. Waits for
/// the connection; a camera that cannot connect is returned in `error`.
pub async fn start_from_form(state: &AppState, form: MultipartForm) -> ApiResult<CameraStateResponse> {
    let url = form
        .text("url")
        .ok_or_else(|| ApiError::bad_request("url is required"))?
        .to_string();
    if !is_valid_source_url(&url) {
        return Err(ApiError::bad_request(format!("Unsupported camera url: {}", url)));
    }
    let mode: MatchMode = form.parse_or("mode", MatchMode::Watchlist)?;
    let transport: Option<Transport> = form.parse_opt("transport")?;

    let mut known_relpath = None;
    if mode == MatchMode::Single {
        if let Some(known) = form.file("known") {
            if face_embedding(state.engine.clone(), known.bytes.clone())
                .await?
                .is_none()
            {
                return Err(ApiError::bad_request("No face detected in known image"));
            }
            let relpath = state
                .uploads
                .save_image(KNOWN_DIR, "known", known.file_name.as_deref(), &known.bytes)
                .await?;
            known_relpath = Some(relpath);
        }
    }

    let registration = CameraRegistration {
        id: form.text("id").map(str::to_string),
        url,
        name: form.text("name").map(str::to_string),
        mode: Some(mode),
        threshold: form.parse_opt("threshold")?,
        fps: form.parse_opt("fps")?,
        transport,
        timeout_ms: form.parse_opt("timeout_ms")?,
        known_relpath,
    };

    let previous = match registration.id.as_deref() {
        Some(id) => state.registry.get(id).await.ok(),
        None => None,
    };
    let camera = state.registry.register(registration).await?;

    // a new configuration needs a fresh worker
    if previous.map_or(false, |p| p.status.is_active() && p.config != camera.config) {
        info!("Camera {} reconfigured, restarting", camera.id());
        state.supervisor.stop(camera.id()).await?;
    }

    let camera = state.supervisor.start(camera.id()).await?;
    Ok(CameraStateResponse::of(&camera))
}

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    pub id: Option<String>,
}

pub async fn stop_camera(
    State(state): State<AppState>,
    body: Option<Json<StopRequest>>,
) -> Response {
    let Some(id) = body
        .and_then(|Json(request)| request.id)
        .filter(|id| !id.trim().is_empty())
    else {
        return ApiError::bad_request("id is required").into_response();
    };

    match camera_or_not_found(&id, state.supervisor.stop(&id).await) {
        Ok(_) => Json(CameraStateResponse {
            id,
            status: CameraStatus::Stopped.as_str().to_string(),
            last_error: None,
        })
        .into_response(),
        Err(response) => response,
    }
}

/// Status as polled by clients; the shape is the same in every state
#[derive(Debug, Serialize)]
pub struct CameraStatusResponse {
    pub id: String,
    pub name: String,
    pub status: CameraStatus,
    pub enabled: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub matches_count: u64,
    pub last_error: Option<String>,
    pub last_confidence: Option<f32>,
}

impl From<Camera> for CameraStatusResponse {
    fn from(camera: Camera) -> Self {
        Self {
            id: camera.config.id,
            name: camera.config.name,
            status: camera.status,
            enabled: camera.enabled,
            last_seen: camera.last_seen,
            matches_count: camera.matches_count,
            last_error: camera.last_error,
            last_confidence: camera.last_confidence,
        }
    }
}

pub async fn camera_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match camera_or_not_found(&id, state.supervisor.status(&id).await) {
        Ok(camera) => Json(CameraStatusResponse::from(camera)).into_response(),
        Err(response) => response,
    }
}

/// Live `rtsp_match` events of a running camera
pub async fn camera_events(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(rx) = state.broadcaster.subscribe(&id).await else {
        return not_found(&id);
    };
    debug!("New event subscriber for camera {}", id);

    let events = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(payload) => match Event::default().event("rtsp_match").json_data(payload.as_ref()) {
                    Ok(event) => return Some((Ok::<Event, Infallible>(event), rx)),
                    Err(e) => warn!("Failed to encode match event: {}", e),
                },
                Err(RecvError::Lagged(missed)) => {
                    warn!("Event subscriber lagged behind, {} events dropped", missed)
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(state.keep_alive))
        .into_response()
}

fn no_cache_headers(content_type: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers
}

/// Latest analysed frame; 204 while the camera has not produced one
pub async fn camera_snapshot(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if let Err(response) = camera_or_not_found(&id, state.registry.get(&id).await) {
        return response;
    }
    match state.snapshots.get(&id) {
        Some(snapshot) => (no_cache_headers("image/jpeg"), snapshot.jpeg).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Snapshots as a multipart MJPEG stream, ending when the camera stops
pub async fn camera_stream(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if let Err(response) = camera_or_not_found(&id, state.registry.get(&id).await) {
        return response;
    }

    let frames = stream::unfold((state, id, 0u64), |(state, id, mut last_seq)| async move {
        loop {
            match state.snapshots.get(&id) {
                Some(snapshot) if snapshot.seq != last_seq => {
                    last_seq = snapshot.seq;
                    let mut part = Vec::with_capacity(snapshot.jpeg.len() + 64);
                    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
                    part.extend_from_slice(&snapshot.jpeg);
                    part.extend_from_slice(b"\r\n");
                    return Some((Ok::<Bytes, Infallible>(Bytes::from(part)), (state, id, last_seq)));
                }
                Some(_) => {}
                None => match state.registry.get(&id).await {
                    Ok(camera) if camera.status.is_active() => {}
                    _ => return None,
                },
            }
            tokio::time::sleep(MJPEG_POLL).await;
        }
    });

    (
        no_cache_headers("multipart/x-mixed-replace; boundary=frame"),
        StreamBody::new(frames),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub struct CameraListResponse {
    pub cameras: Vec<Camera>,
}

pub async fn list_cameras(State(state): State<AppState>) -> ApiResult<Json<CameraListResponse>> {
    Ok(Json(CameraListResponse {
        cameras: state.registry.list().await?,
    }))
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub removed: Vec<String>,
    pub count: usize,
}

pub async fn cleanup_cameras(State(state): State<AppState>) -> ApiResult<Json<CleanupResponse>> {
    let removed = state.registry.cleanup().await?;
    Ok(Json(CleanupResponse {
        count: removed.len(),
        removed,
    }))
}

#[derive(Debug, Serialize)]
pub struct ReloadFailure {
    pub id: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub reloaded: Vec<String>,
    pub failed: Vec<ReloadFailure>,
    pub count: usize,
}

/// Restart every enabled camera
pub async fn reload_cameras(State(state): State<AppState>) -> ApiResult<Json<ReloadResponse>> {
    let mut reloaded = Vec::new();
    let mut failed = Vec::new();
    for camera in state.supervisor.reload().await? {
        match camera.status {
            CameraStatus::Running => reloaded.push(camera.config.id),
            _ => failed.push(ReloadFailure {
                error: camera
                    .last_error
                    .unwrap_or_else(|| format!("camera is {}", camera.status)),
                id: camera.config.id,
            }),
        }
    }
    Ok(Json(ReloadResponse {
        count: reloaded.len(),
        reloaded,
        failed,
    }))
}

pub async fn delete_camera(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.supervisor.delete(&id).await {
        Ok(()) => Json(CameraStateResponse {
            id,
            status: "deleted".to_string(),
            last_error: None,
        })
        .into_response(),
        Err(e) if matches!(domain_error(&e), Some(Error::NotFound(_))) => not_found(&id),
        Err(e) => ApiError::from(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::rest::testing::{body_json, test_app};
    use crate::media::imaging::encode_jpeg;
    use crate::media::testing::Step;
    use image::RgbImage;

    fn jpeg() -> Vec<u8> {
        encode_jpeg(&RgbImage::new(160, 160), 90).unwrap()
    }

    #[tokio::test]
    async fn start_status_stop_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        app.opener.push_repeating(Vec::new(), RgbImage::new(320, 240));

        let form = MultipartForm::default()
            .with_field("id", "cam-1")
            .with_field("url", "rtsp://10.0.0.5/stream1")
            .with_field("mode", "single")
            .with_field("threshold", "0.6")
            .with_field("fps", "3")
            .with_file("known", "alice.jpg", jpeg());
        let started = start_from_form(&app.state, form).await.unwrap();
        assert_eq!(started.id, "cam-1");
        assert_eq!(started.status, "running");

        let status = camera_status(State(app.state.clone()), Path("cam-1".to_string())).await;
        assert_eq!(status.status(), StatusCode::OK);
        let status = body_json(status).await;
        assert_eq!(status["status"], "running");
        assert!(status.get("matches_count").is_some());

        let stopped = stop_camera(
            State(app.state.clone()),
            Some(Json(StopRequest {
                id: Some("cam-1".to_string()),
            })),
        )
        .await;
        assert_eq!(body_json(stopped).await["status"], "stopped");

        let camera = app.state.registry.get("cam-1").await.unwrap();
        assert_eq!(camera.status, CameraStatus::Stopped);
        assert!(!camera.enabled);
        app.state.jobs.shutdown().await;
    }

    #[tokio::test]
    async fn start_validates_the_form() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;

        let err = start_from_form(&app.state, MultipartForm::default()).await.unwrap_err();
        assert_eq!(err.status, 400);

        let form = MultipartForm::default()
            .with_field("url", "rtsp://10.0.0.5/stream1")
            .with_field("threshold", "1.5");
        assert_eq!(start_from_form(&app.state, form).await.unwrap_err().status, 400);

        let form = MultipartForm::default()
            .with_field("url", "rtsp://10.0.0.5/stream1")
            .with_field("mode", "single");
        assert_eq!(start_from_form(&app.state, form).await.unwrap_err().status, 400);

        let form = MultipartForm::default().with_field("url", "not a url");
        assert_eq!(start_from_form(&app.state, form).await.unwrap_err().status, 400);
        app.state.jobs.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_camera_starts_in_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        app.opener
            .push_failure(Error::Connection("connection refused".to_string()));

        let form = MultipartForm::default()
            .with_field("id", "cam-2")
            .with_field("url", "rtsp://10.0.0.9/live");
        let started = start_from_form(&app.state, form).await.unwrap();

        assert_eq!(started.status, "error");
        assert!(started.last_error.unwrap().contains("connection refused"));
        app.state.jobs.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_cameras_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;

        let response = camera_status(State(app.state.clone()), Path("nope".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["status"], "not_found");

        let response = stop_camera(
            State(app.state.clone()),
            Some(Json(StopRequest {
                id: Some("nope".to_string()),
            })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = stop_camera(State(app.state.clone()), None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = camera_events(State(app.state.clone()), Path("nope".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = delete_camera(State(app.state.clone()), Path("nope".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        app.state.jobs.shutdown().await;
    }

    #[tokio::test]
    async fn snapshot_is_empty_until_a_frame_arrives() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        app.opener.push(vec![Step::Idle]);

        let form = MultipartForm::default()
            .with_field("id", "cam-3")
            .with_field("url", "rtsp://10.0.0.3/live");
        start_from_form(&app.state, form).await.unwrap();

        let response = camera_snapshot(State(app.state.clone()), Path("cam-3".to_string())).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        app.state
            .snapshots
            .put("cam-3", Bytes::from(jpeg()), crate::db::now_millis());
        let response = camera_snapshot(State(app.state.clone()), Path("cam-3".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");

        app.state.supervisor.stop("cam-3").await.unwrap();
        app.state.jobs.shutdown().await;
    }

    #[tokio::test]
    async fn delete_stops_then_removes() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        app.opener.push_repeating(Vec::new(), RgbImage::new(320, 240));

        let form = MultipartForm::default()
            .with_field("id", "cam-4")
            .with_field("url", "rtsp://10.0.0.4/live");
        start_from_form(&app.state, form).await.unwrap();

        let response = delete_camera(State(app.state.clone()), Path("cam-4".to_string())).await;
        assert_eq!(body_json(response).await["status"], "deleted");

        let Json(listing) = list_cameras(State(app.state.clone())).await.unwrap();
        assert!(listing.cameras.is_empty());
        app.state.jobs.shutdown().await;
    }

    #[tokio::test]
    async fn cleanup_removes_cameras_without_a_source() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(dir.path()).await;
        app.state
            .registry
            .register(CameraRegistration {
                id: Some("demo".to_string()),
                url: "demo-camera".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        app.state
            .registry
            .register(CameraRegistration {
                id: Some("door".to_string()),
                url: "rtsp://10.0.0.8/live".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let Json(cleanup) = cleanup_cameras(State(app.state.clone())).await.unwrap();

        assert_eq!(cleanup.removed, vec!["demo".to_string()]);
        assert_eq!(cleanup.count, 1);
        app.state.jobs.shutdown().await;
    }
}
