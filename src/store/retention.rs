use crate::config::RetentionConfig;
use crate::db::now_millis;
use crate::db::repositories::events::{EventFiles, EventsRepository};
use crate::media::imaging::resolve_relpath;
use crate::services::settings::RuntimeSettings;
use anyhow::Result;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;

const HOUR_MS: i64 = 3_600_000;

/// Rows handled per statement; SQLite caps bound variables at 32766
const SWEEP_BATCH: u32 = 500;

/// What one sweep removed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub matched_events: u64,
    pub unmatched_events: u64,
    pub matched_full_frames: u64,
    pub unmatched_full_frames: u64,
}

/// Retention sweep for detection events and their image files
pub struct RetentionService {
    config: RetentionConfig,
    events_repo: EventsRepository,
    data_dir: PathBuf,
    settings: Arc<RuntimeSettings>,
}

impl RetentionService {
    pub fn new(
        config: RetentionConfig,
        events_repo: EventsRepository,
        data_dir: &Path,
        settings: Arc<RuntimeSettings>,
    ) -> Self {
        Self {
            config,
            events_repo,
            data_dir: data_dir.to_path_buf(),
            settings,
        }
    }

    /// Start the sweep in the background
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            info!("Event retention is disabled");
            return Ok(());
        }

        info!(
            "Starting event retention with interval of {} seconds",
            self.config.check_interval_secs
        );

        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(self.config.check_interval_secs.max(1)));

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Event retention stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.run_cleanup(now_millis()).await {
                            error!("Error running event retention: {}", e);
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Apply the four retention rules as of `now` (epoch millis)
    pub async fn run_cleanup(&self, now: i64) -> Result<RetentionReport> {
        let rules = self.settings.retention();
        let mut report = RetentionReport::default();

        // Whole events first, so their frames are not handled twice
        report.matched_events = self.cleanup_events(true, rules.matched_event_hours, now).await?;
        report.unmatched_events = self
            .cleanup_events(false, rules.unmatched_event_hours, now)
            .await?;
        report.matched_full_frames = self
            .cleanup_full_frames(true, rules.matched_full_frame_hours, now)
            .await?;
        report.unmatched_full_frames = self
            .cleanup_full_frames(false, rules.unmatched_full_frame_hours, now)
            .await?;

        if report != RetentionReport::default() {
            info!("Event retention removed {:?}", report);
        }
        Ok(report)
    }

    /// Delete events older than `hours`, with their thumbnails and frames
    async fn cleanup_events(&self, matched: bool, hours: u32, now: i64) -> Result<u64> {
        if hours == 0 {
            return Ok(0);
        }
        let cutoff = now - hours as i64 * HOUR_MS;
        let mut removed = 0;

        loop {
            let batch = self.events_repo.expired(matched, cutoff, SWEEP_BATCH).await?;
            if batch.is_empty() {
                break;
            }

            // Rows go before files so a failed delete never leaves dangling paths
            let ids: Vec<i64> = batch.iter().map(|f| f.id).collect();
            removed += self.events_repo.delete_by_ids(&ids).await?;
            for files in &batch {
                self.remove_file(&files.thumb_relpath).await;
                if let Some(full) = &files.full_image_path {
                    self.remove_file(full).await;
                }
            }

            if batch.len() < SWEEP_BATCH as usize {
                break;
            }
        }

        if removed > 0 {
            info!("Removed {} expired {} events", removed, label(matched));
        }
        Ok(removed)
    }

    /// Remove full frames older than `hours` but keep the events
    async fn cleanup_full_frames(&self, matched: bool, hours: u32, now: i64) -> Result<u64> {
        if hours == 0 {
            return Ok(0);
        }
        let cutoff = now - hours as i64 * HOUR_MS;
        let mut cleared = 0;

        loop {
            let batch: Vec<EventFiles> = self
                .events_repo
                .expired_full_frames(matched, cutoff, SWEEP_BATCH)
                .await?;
            if batch.is_empty() {
                break;
            }

            let ids: Vec<i64> = batch.iter().map(|f| f.id).collect();
            cleared += self.events_repo.clear_full_images(&ids).await?;
            for files in &batch {
                if let Some(full) = &files.full_image_path {
                    self.remove_file(full).await;
                }
            }

            if batch.len() < SWEEP_BATCH as usize {
                break;
            }
        }

        Ok(cleared)
    }

    async fn remove_file(&self, relpath: &str) {
        let path = match resolve_relpath(&self.data_dir, relpath) {
            Ok(path) => path,
            Err(e) => {
                warn!("Skipping stored path {}: {}", relpath, e);
                return;
            }
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
        }
    }
}

fn label(matched: bool) -> &'static str {
    if matched {
        "matched"
    } else {
        "unmatched"
    }
}
