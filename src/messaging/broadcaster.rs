use crate::db::models::event_models::{classify, DetectionEvent};
use crate::recognition::BBox;
use crate::store::FaceObservation;
use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Live detection pushed to SSE subscribers as an `rtsp_match` event
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MatchPayload {
    /// Camera id
    pub id: String,
    /// None when the face fell inside the camera's event cooldown
    pub event_id: Option<i64>,
    pub frame: Option<i64>,
    /// Epoch millis
    pub timestamp: i64,
    pub bbox: BBox,
    pub matched: bool,
    pub is_match: bool,
    pub person_id: Option<i64>,
    pub person_name: String,
    pub confidence: f32,
    pub similarity_score: f32,
    pub recognition_threshold: f32,
    pub quality_score: f32,
    pub is_low_quality: bool,
    pub face_width: Option<i64>,
    pub face_height: Option<i64>,
    pub event_type: String,
    pub alert_level: String,
    pub thumb_relpath: Option<String>,
    pub processing_time_ms: Option<f64>,
}

impl MatchPayload {
    pub fn from_event(event: &DetectionEvent, threshold: f32) -> Self {
        Self {
            id: event.camera_id.clone(),
            event_id: Some(event.id),
            frame: event.frame_number,
            timestamp: event.ts,
            bbox: event.bbox,
            matched: event.matched,
            is_match: event.matched,
            person_id: event.person_id,
            person_name: match (&event.person_name, event.matched) {
                (Some(name), true) => name.clone(),
                _ => "Unknown".to_string(),
            },
            confidence: event.confidence,
            similarity_score: event.confidence,
            recognition_threshold: threshold,
            quality_score: event.quality_score,
            is_low_quality: event.is_low_quality,
            face_width: event.face_width,
            face_height: event.face_height,
            event_type: event.event_type.clone(),
            alert_level: event.alert_level.clone(),
            thumb_relpath: Some(event.thumb_relpath.clone()),
            processing_time_ms: event.processing_time_ms,
        }
    }

    /// Live match that was not stored
    pub fn from_observation(
        observation: &FaceObservation,
        threshold: f32,
        quality_threshold: f32,
    ) -> Self {
        let FaceObservation {
            candidate, verdict, ..
        } = observation;
        let (event_type, alert_level) = classify(verdict.matched, verdict.similarity);
        Self {
            id: observation.camera_id.clone(),
            event_id: None,
            frame: observation.frame_number,
            timestamp: observation.ts,
            bbox: candidate.bbox,
            matched: verdict.matched,
            is_match: verdict.matched,
            person_id: verdict.person_id,
            person_name: match (&verdict.person_name, verdict.matched) {
                (Some(name), true) => name.clone(),
                _ => "Unknown".to_string(),
            },
            confidence: verdict.similarity,
            similarity_score: verdict.similarity,
            recognition_threshold: threshold,
            quality_score: candidate.quality.score,
            is_low_quality: candidate.quality.is_low(quality_threshold),
            face_width: Some(candidate.bbox.width() as i64),
            face_height: Some(candidate.bbox.height() as i64),
            event_type: event_type.as_str().to_string(),
            alert_level: alert_level.as_str().to_string(),
            thumb_relpath: None,
            processing_time_ms: Some(observation.processing_time_ms),
        }
    }
}

pub type MatchReceiver = broadcast::Receiver<Arc<MatchPayload>>;

/// Per-camera fan-out of live detections.
///
/// Each running camera owns one broadcast channel. Publishing never waits
/// on subscribers; one that falls more than `capacity` events behind loses
/// the oldest ones. Closing a camera drops its sender, which ends every
/// open subscription.
pub struct EventBroadcaster {
    capacity: usize,
    channels: RwLock<HashMap<String, broadcast::Sender<Arc<MatchPayload>>>>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Create the camera's channel if it does not exist yet
    pub async fn open(&self, camera_id: &str) {
        let mut channels = self.channels.write().await;
        if !channels.contains_key(camera_id) {
            let (tx, _) = broadcast::channel(self.capacity);
            channels.insert(camera_id.to_string(), tx);
            debug!("Opened event channel for camera {}", camera_id);
        }
    }

    /// `None` when the camera has no open channel
    pub async fn subscribe(&self, camera_id: &str) -> Option<MatchReceiver> {
        self.channels
            .read()
            .await
            .get(camera_id)
            .map(|tx| tx.subscribe())
    }

    /// Deliver to every current subscriber; returns how many there were.
    pub async fn publish(&self, camera_id: &str, payload: MatchPayload) -> usize {
        match self.channels.read().await.get(camera_id) {
            // send only fails when nobody is listening
            Some(tx) => tx.send(Arc::new(payload)).unwrap_or(0),
            None => 0,
        }
    }

    pub async fn close(&self, camera_id: &str) {
        if self.channels.write().await.remove(camera_id).is_some() {
            info!("Closed event channel for camera {}", camera_id);
        }
    }

    pub async fn subscriber_count(&self, camera_id: &str) -> usize {
        self.channels
            .read()
            .await
            .get(camera_id)
            .map_or(0, |tx| tx.receiver_count())
    }
}
