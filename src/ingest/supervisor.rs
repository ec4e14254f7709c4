use super::worker::{self, DecodeLimits, MatchSource, FRAME_QUEUE};
use super::IngestContext;
use crate::db::models::camera_models::{Camera, CameraConfig, CameraStatus, MatchMode};
use crate::error::Error;
use crate::media::imaging::{self, resolve_relpath};
use crate::media::{AbortHandle, FrameSource, FrameThrottle, SourceTarget};
use anyhow::Result;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Extra time `start` waits on top of the camera's own connect timeout
const OPEN_MARGIN: Duration = Duration::from_secs(2);

struct WorkerHandle {
    cancel: CancellationToken,
    abort: AbortHandle,
    task: JoinHandle<()>,
}

type WorkerSlot = Arc<Mutex<Option<WorkerHandle>>>;

/// Starts and stops camera workers.
///
/// Every camera has a slot holding at most one worker. Start and stop lock
/// the slot for their whole duration, so concurrent calls for the same
/// camera serialise while different cameras proceed independently.
pub struct IngestSupervisor {
    ctx: IngestContext,
    slots: Mutex<HashMap<String, WorkerSlot>>,
}

impl IngestSupervisor {
    pub fn new(ctx: IngestContext) -> Self {
        Self {
            ctx,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Restart cameras that were enabled when the process last exited
    pub async fn restore(&self) -> Result<usize> {
        let cameras = self.ctx.registry.boot().await?;
        if !self.ctx.config.restart_on_boot {
            return Ok(0);
        }

        let mut running = 0;
        for camera in cameras {
            match self.start(camera.id()).await {
                Ok(camera) if camera.status == CameraStatus::Running => running += 1,
                Ok(camera) => warn!(
                    "Camera {} did not restart: {}",
                    camera.id(),
                    camera.last_error.as_deref().unwrap_or("unknown error")
                ),
                Err(e) => error!("Failed to restart camera {}: {}", camera.id(), e),
            }
        }
        info!("Restarted {} cameras", running);
        Ok(running)
    }

    /// Start the camera's worker. Returns once it is running or has failed;
    /// connection failures are reported through the camera's status, not
    /// as an error. Starting a running camera changes nothing.
    pub async fn start(&self, id: &str) -> Result<Camera> {
        let slot = self.slot(id).await;
        let mut guard = slot.lock().await;

        if let Some(handle) = guard.take() {
            let current = self.ctx.registry.get(id).await?;
            if current.status.is_active() && !handle.task.is_finished() {
                debug!("Camera {} is already running", id);
                *guard = Some(handle);
                return Ok(current);
            }
            // the previous worker failed; let it finish its cleanup first
            handle.cancel.cancel();
            (handle.abort)();
            let grace = Duration::from_millis(self.ctx.config.stop_grace_ms);
            if tokio::time::timeout(grace, handle.task).await.is_err() {
                warn!("Previous worker of camera {} did not finish", id);
            }
        }

        let camera = match self.ctx.registry.begin_start(id).await? {
            Some(camera) => camera,
            None => return self.ctx.registry.get(id).await,
        };
        self.ctx.registry.set_enabled(id, true).await?;

        match self.prepare(&camera.config).await {
            Ok((matcher, source)) => {
                self.ctx.broadcaster.open(id).await;
                self.ctx
                    .registry
                    .transition(id, CameraStatus::Running, None)
                    .await?;
                match self.spawn(camera.config, matcher, source) {
                    Ok(handle) => *guard = Some(handle),
                    Err(e) => {
                        self.ctx.broadcaster.close(id).await;
                        self.ctx
                            .registry
                            .transition(id, CameraStatus::Error, Some(e.to_string()))
                            .await?;
                    }
                }
            }
            Err(e) => {
                self.ctx
                    .registry
                    .transition(id, CameraStatus::Error, Some(e.to_string()))
                    .await?;
            }
        }

        self.ctx.registry.get(id).await
    }

    /// Stop the camera's worker and keep it from restarting at boot.
    /// Stopping a stopped camera changes nothing.
    pub async fn stop(&self, id: &str) -> Result<Camera> {
        self.stop_worker(id, true).await
    }

    /// Stop and remove a camera
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.stop_worker(id, true).await?;
        self.ctx.registry.delete(id).await?;
        self.slots.lock().await.remove(id);
        Ok(())
    }

    /// Stop every worker, leaving the cameras enabled for the next boot
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.slots.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop_worker(&id, false).await {
                warn!("Failed to stop camera {}: {}", id, e);
            }
        }
    }

    /// Restart every enabled camera with its stored configuration
    pub async fn reload(&self) -> Result<Vec<Camera>> {
        let mut restarted = Vec::new();
        for camera in self.ctx.registry.enabled_cameras().await? {
            self.stop_worker(camera.id(), false).await?;
            restarted.push(self.start(camera.id()).await?);
        }
        info!("Reloaded {} cameras", restarted.len());
        Ok(restarted)
    }

    pub async fn status(&self, id: &str) -> Result<Camera> {
        self.ctx.registry.get(id).await
    }

    /// Number of live workers
    pub async fn running_workers(&self) -> usize {
        let slots: Vec<WorkerSlot> = self.slots.lock().await.values().cloned().collect();
        let mut running = 0;
        for slot in slots {
            if let Some(handle) = slot.lock().await.as_ref() {
                if !handle.task.is_finished() {
                    running += 1;
                }
            }
        }
        running
    }

    async fn slot(&self, id: &str) -> WorkerSlot {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(id.to_string()).or_default())
    }

    async fn stop_worker(&self, id: &str, disable: bool) -> Result<Camera> {
        self.ctx.registry.get(id).await?;
        let slot = self.slot(id).await;
        let mut guard = slot.lock().await;

        if let Some(handle) = guard.take() {
            if let Err(e) = self
                .ctx
                .registry
                .transition(id, CameraStatus::Stopping, None)
                .await
            {
                debug!("Camera {} not marked stopping: {}", id, e);
            }

            handle.cancel.cancel();
            let grace = Duration::from_millis(self.ctx.config.stop_grace_ms);
            let mut task = handle.task;
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!(
                    "Worker of camera {} did not stop within {} ms, aborting",
                    id,
                    grace.as_millis()
                );
                task.abort();
            }
            (handle.abort)();
        }

        self.ctx.snapshots.clear(id);
        self.ctx.broadcaster.close(id).await;

        let camera = self.ctx.registry.get(id).await?;
        if matches!(camera.status, CameraStatus::Starting | CameraStatus::Running) {
            self.ctx
                .registry
                .transition(id, CameraStatus::Stopping, None)
                .await?;
        }
        if camera.status != CameraStatus::Stopped {
            self.ctx
                .registry
                .transition(id, CameraStatus::Stopped, None)
                .await?;
        }
        if disable {
            self.ctx.registry.set_enabled(id, false).await?;
        }
        drop(guard);

        self.ctx.registry.get(id).await
    }

    /// Resolve what faces are matched against, then connect
    async fn prepare(&self, camera: &CameraConfig) -> Result<(MatchSource, Box<dyn FrameSource>)> {
        let matcher = match camera.mode {
            MatchMode::Watchlist => MatchSource::Watchlist,
            MatchMode::Single => MatchSource::Single(Arc::new(self.known_embedding(camera).await?)),
        };

        let target = source_target(camera)?;
        let opener = Arc::clone(&self.ctx.opener);
        let wait = Duration::from_millis(camera.timeout_ms) + OPEN_MARGIN;
        let open = tokio::task::spawn_blocking(move || opener.open(&target));

        let source = match tokio::time::timeout(wait, open).await {
            Ok(joined) => joined
                .map_err(|e| Error::Internal(format!("Source opener panicked: {}", e)))??,
            Err(_) => {
                return Err(Error::Connection(format!(
                    "No frame within {} ms",
                    camera.timeout_ms
                ))
                .into())
            }
        };

        Ok((matcher, source))
    }

    async fn known_embedding(&self, camera: &CameraConfig) -> Result<Vec<f32>> {
        let relpath = camera
            .known_relpath
            .clone()
            .ok_or_else(|| Error::Validation("Single mode requires a known face image".to_string()))?;
        let path = resolve_relpath(self.ctx.store.data_dir(), &relpath)?;
        let engine = self.ctx.engine.clone();

        let embedding = tokio::task::spawn_blocking(move || -> Result<Vec<f32>, Error> {
            let image = imaging::load_image(&path)?;
            engine
                .best_face(&image)?
                .map(|face| face.embedding)
                .ok_or_else(|| Error::Validation("No face found in known image".to_string()))
        })
        .await
        .map_err(|e| Error::Internal(format!("Reference image task panicked: {}", e)))??;

        Ok(embedding)
    }

    fn spawn(
        &self,
        camera: CameraConfig,
        matcher: MatchSource,
        source: Box<dyn FrameSource>,
    ) -> Result<WorkerHandle> {
        let cancel = CancellationToken::new();
        let abort = source.abort_handle();
        let throttle = FrameThrottle::new(source.info().fps, camera.fps);
        let limits = DecodeLimits {
            max_decode_errors: self.ctx.config.max_consecutive_decode_errors.max(1),
            stall_timeout: Duration::from_millis(camera.timeout_ms),
        };
        let (tx, rx) = mpsc::channel(FRAME_QUEUE);

        worker::spawn_decoder(
            camera.id.clone(),
            source,
            throttle,
            limits,
            tx,
            cancel.clone(),
        )
        .map_err(|e| Error::Internal(format!("Failed to start decode thread: {}", e)))?;

        let task = tokio::spawn(worker::run_worker(
            self.ctx.clone(),
            camera,
            matcher,
            rx,
            cancel.clone(),
        ));

        Ok(WorkerHandle {
            cancel,
            abort,
            task,
        })
    }
}

/// Decoder input for a camera URL; `file://` URLs read local videos
fn source_target(camera: &CameraConfig) -> Result<SourceTarget, Error> {
    if camera.url.starts_with("file://") {
        let path: PathBuf = url::Url::parse(&camera.url)
            .ok()
            .and_then(|url| url.to_file_path().ok())
            .ok_or_else(|| Error::Validation(format!("Invalid file url: {}", camera.url)))?;
        return Ok(SourceTarget::File(path));
    }
    Ok(SourceTarget::Rtsp {
        url: camera.url.clone(),
        transport: camera.transport,
        timeout_ms: camera.timeout_ms,
    })
}
