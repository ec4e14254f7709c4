use crate::config::ApiConfig;
use crate::db;
use crate::error::Error;
use crate::ingest::IngestSupervisor;
use crate::jobs::JobManager;
use crate::messaging::EventBroadcaster;
use crate::recognition::DetectionEngine;
use crate::services::{CameraRegistry, RuntimeSettings, WatchlistService};
use crate::store::{EventStore, SnapshotCache, UploadStore};
use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::info;
use serde::Serialize;
use sqlx::SqlitePool;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

pub mod camera_controller;
pub mod event_controller;
pub mod form;
pub mod job_controller;
pub mod recognition_controller;
pub mod watchlist_controller;

// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db_pool: Arc<SqlitePool>,
    pub registry: Arc<CameraRegistry>,
    pub supervisor: Arc<IngestSupervisor>,
    pub snapshots: Arc<SnapshotCache>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub store: EventStore,
    pub uploads: UploadStore,
    pub settings: Arc<RuntimeSettings>,
    pub watchlist: Arc<WatchlistService>,
    pub engine: DetectionEngine,
    pub jobs: Arc<JobManager>,
    /// Match threshold for requests that do not carry one
    pub default_threshold: f32,
    pub keep_alive: Duration,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    pub status: u16,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            message: message.into(),
            status: StatusCode::BAD_REQUEST.as_u16(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError {
            message: message.into(),
            status: StatusCode::NOT_FOUND.as_u16(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match err {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InUse(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            message: err.to_string(),
            status: status.as_u16(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(err) = crate::error::domain_error(&err) {
            return err.clone().into();
        }

        ApiError {
            message: err.to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
        }
    }
}

/// Implement IntoResponse for ApiError
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(self);
        (status, body).into_response()
    }
}

pub struct RestApi {
    config: ApiConfig,
    state: AppState,
}

impl RestApi {
    pub fn new(config: &ApiConfig, state: AppState) -> Self {
        Self {
            config: config.clone(),
            state,
        }
    }

    /// All API routes plus the data directory under `/data`
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .allow_credentials(false)
            .max_age(Duration::from_secs(3600));

        Router::new()
            .merge(camera_controller::create_router())
            .merge(event_controller::create_router())
            .merge(job_controller::create_router())
            .merge(recognition_controller::create_router())
            .merge(watchlist_controller::create_router())
            .route("/api/health", get(health))
            .with_state(self.state.clone())
            .nest_service("/data", ServeDir::new(self.state.uploads.data_dir()))
            .layer(DefaultBodyLimit::max(self.config.max_upload_mb * 1024 * 1024))
            .layer(cors)
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let app = self.router();

        let addr = self.config.address.clone() + ":" + &self.config.port.to_string();
        let addr: SocketAddr = addr.parse()?;
        info!("API server listening on {}", addr);

        let listener = TcpListener::bind(addr).await?;

        axum::Server::from_tcp(listener.into_std()?)?
            .serve(app.into_make_service())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: bool,
    pub running_cameras: usize,
}

async fn health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let database = db::health_check(&state.db_pool).await?;
    Ok(Json(HealthResponse {
        status: if database { "ok" } else { "degraded" },
        database,
        running_cameras: state.supervisor.running_workers().await,
    }))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_status_codes() {
        let cases = [
            (Error::Validation("bad".into()), 400),
            (Error::NotFound("gone".into()), 404),
            (Error::InUse("busy".into()), 409),
            (Error::Database("down".into()), 500),
            (Error::Connection("refused".into()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }

        let wrapped = anyhow::Error::from(Error::NotFound("camera cam-1".into()))
            .context("loading camera");
        let api = ApiError::from(wrapped);
        assert_eq!(api.status, 404);
        assert_eq!(api.message, "Not found: camera cam-1");
    }

    #[tokio::test]
    async fn health_reports_database() {
        let dir = tempfile::tempdir().unwrap();
        let app = testing::test_app(dir.path()).await;

        let Json(health) = health(State(app.state.clone())).await.unwrap();

        assert_eq!(health.status, "ok");
        assert!(health.database);
        assert_eq!(health.running_cameras, 0);
        app.state.jobs.shutdown().await;
    }
}
