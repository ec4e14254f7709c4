use crate::config::IngestConfig;
use crate::db::models::camera_models::{Camera, CameraConfig, CameraStatus, MatchMode, Transport};
use crate::db::repositories::cameras::CamerasRepository;
use crate::error::Error;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::Mutex;
use uuid::Uuid;

const SOURCE_SCHEMES: &[&str] = &["rtsp", "rtsps", "http", "https", "file"];

/// Registration request; unset fields take configured defaults
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CameraRegistration {
    pub id: Option<String>,
    pub url: String,
    pub name: Option<String>,
    pub mode: Option<MatchMode>,
    pub threshold: Option<f32>,
    pub fps: Option<f64>,
    pub transport: Option<Transport>,
    pub timeout_ms: Option<u64>,
    pub known_relpath: Option<String>,
}

/// Counters that change with every processed frame, never persisted
#[derive(Debug, Clone, Default)]
struct LiveStats {
    last_seen: Option<DateTime<Utc>>,
    last_confidence: Option<f32>,
    matches_count: u64,
}

/// Whether a URL can be handed to the decoder at all
pub fn is_valid_source_url(raw: &str) -> bool {
    match url::Url::parse(raw.trim()) {
        Ok(url) => {
            SOURCE_SCHEMES.contains(&url.scheme()) && (url.scheme() == "file" || url.has_host())
        }
        Err(_) => false,
    }
}

/// Persistent camera definitions plus their live status.
///
/// Status changes go through [`CameraRegistry::transition`], which checks
/// them against the camera state machine while holding a lock, so two
/// callers never both move a camera out of the same state.
pub struct CameraRegistry {
    repo: CamerasRepository,
    defaults: IngestConfig,
    default_threshold: f32,
    transitions: Mutex<()>,
    stats: RwLock<HashMap<String, LiveStats>>,
}

impl CameraRegistry {
    pub fn new(repo: CamerasRepository, defaults: IngestConfig, default_threshold: f32) -> Self {
        Self {
            repo,
            defaults,
            default_threshold,
            transitions: Mutex::new(()),
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Forget worker states left by a previous process; returns the
    /// cameras that should be restarted.
    pub async fn boot(&self) -> Result<Vec<Camera>> {
        let reset = self.repo.reset_active_statuses().await?;
        if reset > 0 {
            info!("Reset {} cameras left active by a previous run", reset);
        }
        self.enabled_cameras().await
    }

    pub async fn register(&self, request: CameraRegistration) -> Result<Camera> {
        let url = request.url.trim().to_string();
        if url.is_empty() {
            return Err(Error::Validation("Camera url is required".to_string()).into());
        }

        let mode = request.mode.unwrap_or(MatchMode::Watchlist);
        let threshold = request.threshold.unwrap_or(self.default_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::Validation(format!(
                "Threshold must be between 0 and 1, got {}",
                threshold
            ))
            .into());
        }
        let fps = request.fps.unwrap_or(self.defaults.default_fps);
        if !(fps > 0.0) {
            return Err(Error::Validation(format!("fps must be positive, got {}", fps)).into());
        }
        let timeout_ms = request.timeout_ms.unwrap_or(self.defaults.default_timeout_ms);
        if timeout_ms == 0 {
            return Err(Error::Validation("timeout_ms must be positive".to_string()).into());
        }
        let transport = match request.transport {
            Some(transport) => transport,
            None => self.defaults.default_transport.parse()?,
        };

        let id = request
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(new_camera_id);

        let known_relpath = match request.known_relpath {
            Some(relpath) => Some(relpath),
            // keep the reference image of an existing single-mode camera
            None => self
                .repo
                .get_by_id(&id)
                .await?
                .and_then(|camera| camera.config.known_relpath),
        };
        if mode == MatchMode::Single && known_relpath.is_none() {
            return Err(
                Error::Validation("Single mode requires a known face image".to_string()).into(),
            );
        }

        let config = CameraConfig {
            name: request
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| id.clone()),
            id,
            url,
            mode,
            threshold,
            fps,
            transport,
            timeout_ms,
            known_relpath,
        };

        let camera = self.repo.upsert(&config).await?;
        info!("Registered camera {} ({})", camera.id(), camera.config.name);
        Ok(self.with_stats(camera))
    }

    pub async fn get(&self, id: &str) -> Result<Camera> {
        let camera = self
            .repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Camera {} not found", id)))?;
        Ok(self.with_stats(camera))
    }

    pub async fn list(&self) -> Result<Vec<Camera>> {
        Ok(self
            .repo
            .get_all()
            .await?
            .into_iter()
            .map(|camera| self.with_stats(camera))
            .collect())
    }

    pub async fn enabled_cameras(&self) -> Result<Vec<Camera>> {
        self.repo.get_enabled().await
    }

    /// Remove a camera. Fails with `InUse` while its worker is active.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.transitions.lock().await;
        let camera = self.get(id).await?;
        if camera.status.is_active() {
            return Err(Error::InUse(format!(
                "Camera {} is {}; stop it first",
                id, camera.status
            ))
            .into());
        }

        self.repo.delete(id).await?;
        self.stats_mut().remove(id);
        info!("Deleted camera {}", id);
        Ok(())
    }

    /// Delete idle cameras whose URL cannot be a video source
    pub async fn cleanup(&self) -> Result<Vec<String>> {
        let _guard = self.transitions.lock().await;
        let mut removed = Vec::new();

        for camera in self.repo.get_all().await? {
            if camera.status.is_active() || is_valid_source_url(&camera.config.url) {
                continue;
            }
            if self.repo.delete(camera.id()).await? {
                self.stats_mut().remove(camera.id());
                removed.push(camera.config.id);
            }
        }

        if !removed.is_empty() {
            info!("Removed {} invalid cameras: {:?}", removed.len(), removed);
        }
        Ok(removed)
    }

    /// Move a camera to `next`. Staying in the same state is a no-op.
    pub async fn transition(
        &self,
        id: &str,
        next: CameraStatus,
        last_error: Option<String>,
    ) -> Result<Camera> {
        let _guard = self.transitions.lock().await;
        self.transition_locked(id, next, last_error).await
    }

    /// Move a camera to `Starting` unless it is already active. Returns
    /// `None` when another start got there first.
    pub async fn begin_start(&self, id: &str) -> Result<Option<Camera>> {
        let _guard = self.transitions.lock().await;
        let camera = self.get(id).await?;
        if camera.status.is_active() {
            return Ok(None);
        }

        self.stats_mut().insert(id.to_string(), LiveStats::default());
        self.transition_locked(id, CameraStatus::Starting, None)
            .await
            .map(Some)
    }

    async fn transition_locked(
        &self,
        id: &str,
        next: CameraStatus,
        last_error: Option<String>,
    ) -> Result<Camera> {
        let camera = self.get(id).await?;
        if camera.status == next && last_error.is_none() {
            return Ok(camera);
        }
        if camera.status != next && !camera.status.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "Camera {} cannot go from {} to {}",
                id, camera.status, next
            ))
            .into());
        }

        // an error message only survives in the error state
        let last_error = match next {
            CameraStatus::Error => last_error.or(camera.last_error),
            CameraStatus::Stopped => camera.last_error,
            _ => last_error,
        };
        self.repo
            .update_status(id, next, last_error.as_deref())
            .await?;
        if next == CameraStatus::Error {
            warn!(
                "Camera {} failed: {}",
                id,
                last_error.as_deref().unwrap_or("unknown error")
            );
        } else {
            info!("Camera {} is {}", id, next);
        }
        self.get(id).await
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.repo.set_enabled(id, enabled).await?;
        Ok(())
    }

    /// Note that a frame was analysed
    pub fn record_frame(&self, id: &str) {
        self.stats_mut().entry(id.to_string()).or_default().last_seen = Some(Utc::now());
    }

    /// Note the best similarity of a frame and how many events it produced
    pub fn record_detections(&self, id: &str, best_similarity: Option<f32>, events: u64) {
        let mut stats = self.stats_mut();
        let entry = stats.entry(id.to_string()).or_default();
        if best_similarity.is_some() {
            entry.last_confidence = best_similarity;
        }
        entry.matches_count += events;
    }

    fn with_stats(&self, mut camera: Camera) -> Camera {
        let stats = match self.stats.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(live) = stats.get(camera.id()) {
            camera.last_seen = live.last_seen;
            camera.last_confidence = live.last_confidence;
            camera.matches_count = live.matches_count;
        }
        camera
    }

    fn stats_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, LiveStats>> {
        match self.stats.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn new_camera_id() -> String {
    format!("cam-{}", &Uuid::new_v4().simple().to_string()[..8])
}
