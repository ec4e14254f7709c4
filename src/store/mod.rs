//! Detection events, their images, and the per-camera snapshot cache.

use crate::config::StorageConfig;
use crate::db::models::event_models::{
    classify, DetectionEvent, EventFilter, EventPage, NewEvent, SortField,
};
use crate::db::repositories::events::EventsRepository;
use crate::error::Error;
use crate::media::imaging::{self, resolve_relpath};
use crate::recognition::{BBox, FaceCandidate, Verdict};
use crate::services::settings::RuntimeSettings;
use anyhow::Result;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod retention;
pub mod snapshots;
pub mod uploads;

pub use retention::RetentionService;
pub use snapshots::{Snapshot, SnapshotCache};
pub use uploads::UploadStore;

/// One analysed face, ready to be recorded
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub camera_id: String,
    /// Epoch millis
    pub ts: i64,
    pub frame_number: Option<i64>,
    pub candidate: FaceCandidate,
    pub verdict: Verdict,
    pub processing_time_ms: f64,
}

/// Parameters of the high/low quality listings
#[derive(Debug, Clone, Default)]
pub struct QualityListing {
    /// Defaults to the global quality threshold
    pub threshold: Option<f32>,
    pub matched: Option<bool>,
    pub camera_id: Option<String>,
    pub limit: u32,
}

#[derive(Clone)]
pub struct EventStore {
    repo: EventsRepository,
    data_dir: PathBuf,
    save_full_frames: bool,
    settings: Arc<RuntimeSettings>,
}

impl EventStore {
    pub fn new(
        repo: EventsRepository,
        storage: &StorageConfig,
        settings: Arc<RuntimeSettings>,
    ) -> Self {
        Self {
            repo,
            data_dir: storage.data_dir.clone(),
            save_full_frames: storage.save_full_frames,
            settings,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn quality_threshold(&self) -> f32 {
        self.settings.quality_threshold()
    }

    /// Write the thumbnail (and full frame when enabled), then append the
    /// event row. Images are encoded on a blocking thread.
    pub async fn record(
        &self,
        frame: Arc<RgbImage>,
        observation: FaceObservation,
    ) -> Result<DetectionEvent> {
        let data_dir = self.data_dir.clone();
        let bbox = observation.candidate.bbox;
        let prefix = uploads::safe_name(&observation.camera_id);
        let save_full = self.save_full_frames;
        let frame_size = (frame.width(), frame.height());

        let (thumb_relpath, full_image_path) =
            tokio::task::spawn_blocking(move || -> Result<(String, Option<String>), Error> {
                let thumb = imaging::save_thumbnail(&data_dir, &frame, &bbox, &prefix)?;
                let full = if save_full {
                    Some(imaging::save_full_frame(&data_dir, &frame, &prefix)?)
                } else {
                    None
                };
                Ok((thumb, full))
            })
            .await
            .map_err(|e| Error::Internal(format!("Image writer panicked: {}", e)))??;

        let FaceObservation {
            camera_id,
            ts,
            frame_number,
            candidate,
            verdict,
            processing_time_ms,
        } = observation;
        let (event_type, alert_level) = classify(verdict.matched, verdict.similarity);
        let quality_threshold = self.settings.quality_threshold();

        let event = NewEvent {
            camera_id,
            ts,
            confidence: verdict.similarity,
            bbox: candidate.bbox,
            thumb_relpath,
            full_image_path,
            matched: verdict.matched,
            person_id: verdict.person_id,
            person_name: verdict.person_name,
            quality_score: candidate.quality.score,
            is_low_quality: candidate.quality.is_low(quality_threshold),
            frame_number,
            sharpness: Some(candidate.quality.sharpness_score as f64),
            brightness: Some(candidate.quality.brightness as f64),
            event_type,
            alert_level,
            processing_time_ms: Some(processing_time_ms),
            age_estimate: candidate.age.map(|a| a.round() as i64),
            gender: candidate.gender,
            frame_size: Some(frame_size),
        };

        let id = self.repo.create(&event).await?;
        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> Result<DetectionEvent> {
        self.repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Event {} not found", id)).into())
    }

    pub async fn query(&self, filter: &EventFilter, page: u32, limit: u32) -> Result<EventPage> {
        self.repo.search(filter, page, limit).await
    }

    /// Newest events, optionally narrowed to one camera or match class
    pub async fn list(
        &self,
        limit: u32,
        matched: Option<bool>,
        camera_id: Option<String>,
    ) -> Result<Vec<DetectionEvent>> {
        let filter = EventFilter {
            matched,
            camera_ids: camera_id.into_iter().collect(),
            ..EventFilter::newest_first()
        };
        Ok(self.repo.search(&filter, 1, limit).await?.events)
    }

    /// Events scoring at least (`high`) or below the threshold; returns the
    /// threshold that was applied.
    pub async fn by_quality(
        &self,
        high: bool,
        listing: QualityListing,
    ) -> Result<(Vec<DetectionEvent>, f32)> {
        let threshold = listing
            .threshold
            .unwrap_or_else(|| self.settings.quality_threshold());
        let mut filter = EventFilter {
            matched: listing.matched,
            camera_ids: listing.camera_id.into_iter().collect(),
            ..EventFilter::newest_first()
        };
        if high {
            filter.quality_min = Some(threshold);
            filter.sort_by = SortField::QualityScore;
        } else {
            filter.quality_below = Some(threshold);
        }

        let events = self.repo.search(&filter, 1, listing.limit).await?.events;
        Ok((events, threshold))
    }

    /// JPEG of the stored full frame (the thumbnail when there is none)
    /// with the face outlined.
    pub async fn full_image(&self, id: i64) -> Result<Vec<u8>> {
        let event = self.get(id).await?;
        let data_dir = self.data_dir.clone();

        let jpeg = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, Error> {
            if let Some(relpath) = event.full_image_path.as_deref() {
                let path = resolve_relpath(&data_dir, relpath)?;
                if path.exists() {
                    let mut image = imaging::load_image(&path)?;
                    let bbox = match (event.frame_width, event.frame_height) {
                        (Some(w), Some(h)) => imaging::scale_bbox(
                            &event.bbox,
                            (w as u32, h as u32),
                            (image.width(), image.height()),
                        ),
                        _ => event.bbox,
                    };
                    imaging::draw_box(&mut image, &bbox, event.matched);
                    return imaging::encode_jpeg(&image, imaging::FULL_FRAME_QUALITY);
                }
            }

            // The thumbnail is already the face crop; frame it whole.
            let path = resolve_relpath(&data_dir, &event.thumb_relpath)?;
            if !path.exists() {
                return Err(Error::NotFound(format!("Image of event {} not found", event.id)));
            }
            let mut image = imaging::load_image(&path)?;
            let whole = BBox::new(0, 0, image.width() as i32, image.height() as i32);
            imaging::draw_box(&mut image, &whole, event.matched);
            imaging::encode_jpeg(&image, imaging::THUMB_QUALITY)
        })
        .await
        .map_err(|e| Error::Internal(format!("Image renderer panicked: {}", e)))??;

        Ok(jpeg)
    }
}

/// Stores backed by an in-memory database and a temporary data dir
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::{RecognitionConfig, RetentionConfig};
    use crate::db::repositories::settings::SettingsRepository;
    use sqlx::SqlitePool;

    pub async fn store_with(pool: Arc<SqlitePool>, dir: &Path) -> (EventStore, Arc<RuntimeSettings>) {
        let settings = Arc::new(
            RuntimeSettings::load(
                SettingsRepository::new(pool.clone()),
                &RecognitionConfig::default(),
                &RetentionConfig::default(),
            )
            .await
            .unwrap(),
        );
        let storage = StorageConfig {
            data_dir: dir.to_path_buf(),
            uploads_dir: dir.join("uploads"),
            save_full_frames: true,
        };
        (
            EventStore::new(EventsRepository::new(pool), &storage, settings.clone()),
            settings,
        )
    }
}
