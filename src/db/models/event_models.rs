use crate::db::models::camera_models::millis_to_datetime;
use crate::recognition::BBox;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row as stored in the `events` table
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub id: i64,
    pub camera_id: String,
    pub ts: i64,
    pub confidence: f64,
    pub bbox: String,
    pub thumb_relpath: String,
    pub full_image_path: Option<String>,
    pub matched: bool,
    pub person_id: Option<i64>,
    pub person_name: Option<String>,
    pub quality_score: f64,
    pub is_low_quality: bool,
    pub frame_number: Option<i64>,
    pub face_width: Option<i64>,
    pub face_height: Option<i64>,
    pub face_size: Option<i64>,
    pub sharpness: Option<f64>,
    pub brightness: Option<f64>,
    pub event_type: String,
    pub alert_level: String,
    pub processing_time_ms: Option<f64>,
    pub age_estimate: Option<i64>,
    pub gender: Option<String>,
    pub frame_width: Option<i64>,
    pub frame_height: Option<i64>,
}

/// A recorded face detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub id: i64,
    pub camera_id: String,
    /// Milliseconds since the epoch
    pub ts: i64,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    pub bbox: BBox,
    pub thumb_relpath: String,
    pub thumb_url: String,
    pub full_image_path: Option<String>,
    pub matched: bool,
    pub person_id: Option<i64>,
    pub person_name: Option<String>,
    pub quality_score: f32,
    pub is_low_quality: bool,
    pub frame_number: Option<i64>,
    pub face_width: Option<i64>,
    pub face_height: Option<i64>,
    pub face_size: Option<i64>,
    pub sharpness: Option<f64>,
    pub brightness: Option<f64>,
    pub event_type: String,
    pub alert_level: String,
    pub processing_time_ms: Option<f64>,
    pub age_estimate: Option<i64>,
    pub gender: Option<String>,
    /// Size of the analysed frame the bbox refers to
    pub frame_width: Option<i64>,
    pub frame_height: Option<i64>,
}

impl From<EventRow> for DetectionEvent {
    fn from(row: EventRow) -> Self {
        let bbox = serde_json::from_str(&row.bbox).unwrap_or_default();
        DetectionEvent {
            id: row.id,
            timestamp: millis_to_datetime(row.ts),
            ts: row.ts,
            confidence: row.confidence as f32,
            bbox,
            thumb_url: format!("/data/{}", row.thumb_relpath),
            thumb_relpath: row.thumb_relpath,
            full_image_path: row.full_image_path,
            matched: row.matched,
            person_id: row.person_id,
            person_name: row.person_name,
            quality_score: row.quality_score as f32,
            is_low_quality: row.is_low_quality,
            frame_number: row.frame_number,
            face_width: row.face_width,
            face_height: row.face_height,
            face_size: row.face_size,
            sharpness: row.sharpness,
            brightness: row.brightness,
            event_type: row.event_type,
            alert_level: row.alert_level,
            processing_time_ms: row.processing_time_ms,
            age_estimate: row.age_estimate,
            gender: row.gender,
            frame_width: row.frame_width,
            frame_height: row.frame_height,
            camera_id: row.camera_id,
        }
    }
}

/// Everything needed to append an event; images are already on disk.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub camera_id: String,
    pub ts: i64,
    pub confidence: f32,
    pub bbox: BBox,
    pub thumb_relpath: String,
    pub full_image_path: Option<String>,
    pub matched: bool,
    pub person_id: Option<i64>,
    pub person_name: Option<String>,
    pub quality_score: f32,
    pub is_low_quality: bool,
    pub frame_number: Option<i64>,
    pub sharpness: Option<f64>,
    pub brightness: Option<f64>,
    pub event_type: EventType,
    pub alert_level: AlertLevel,
    pub processing_time_ms: Option<f64>,
    pub age_estimate: Option<i64>,
    pub gender: Option<String>,
    /// Width and height of the analysed frame
    pub frame_size: Option<(u32, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Recognized,
    Unknown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Recognized => "recognized",
            EventType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Medium,
    Low,
    Info,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Medium => "medium",
            AlertLevel::Low => "low",
            AlertLevel::Info => "info",
        }
    }
}

/// Strong matches raise a medium alert, weaker matches a low one.
pub fn classify(matched: bool, similarity: f32) -> (EventType, AlertLevel) {
    if !matched {
        (EventType::Unknown, AlertLevel::Info)
    } else if similarity >= 0.8 {
        (EventType::Recognized, AlertLevel::Medium)
    } else {
        (EventType::Recognized, AlertLevel::Low)
    }
}

/// Columns events can be ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Timestamp,
    Confidence,
    QualityScore,
    FaceSize,
}

impl SortField {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timestamp" | "ts" => Some(SortField::Timestamp),
            "confidence" => Some(SortField::Confidence),
            "quality_score" | "quality" => Some(SortField::QualityScore),
            "face_size" => Some(SortField::FaceSize),
            _ => None,
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            SortField::Timestamp => "ts",
            SortField::Confidence => "confidence",
            SortField::QualityScore => "quality_score",
            SortField::FaceSize => "face_size",
        }
    }
}

/// Combination of filters accepted by event queries. Empty vectors and
/// `None` mean "no constraint".
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventFilter {
    pub camera_ids: Vec<String>,
    /// Inclusive lower bound, epoch millis
    pub start_ts: Option<i64>,
    /// Inclusive upper bound, epoch millis
    pub end_ts: Option<i64>,
    pub matched: Option<bool>,
    pub confidence_min: Option<f32>,
    pub confidence_max: Option<f32>,
    pub quality_min: Option<f32>,
    /// Exclusive upper bound
    pub quality_below: Option<f32>,
    pub exclude_low_quality: bool,
    pub min_face_size: Option<i64>,
    pub person_name: Option<String>,
    pub age_min: Option<i64>,
    pub age_max: Option<i64>,
    pub gender: Option<String>,
    pub alert_levels: Vec<String>,
    pub event_types: Vec<String>,
    pub sort_by: SortField,
    pub descending: bool,
}

impl EventFilter {
    pub fn newest_first() -> Self {
        Self {
            descending: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub total_count: i64,
    pub page: u32,
    pub limit: u32,
    pub has_next: bool,
    pub has_previous: bool,
    pub total_pages: u32,
}

impl Pagination {
    pub fn new(total_count: i64, page: u32, limit: u32) -> Self {
        let limit = limit.max(1);
        let total_pages = ((total_count.max(0) as u64 + limit as u64 - 1) / limit as u64) as u32;
        Self {
            total_count,
            page,
            limit,
            has_next: page < total_pages,
            has_previous: page > 1,
            total_pages,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventPage {
    pub events: Vec<DetectionEvent>,
    pub pagination: Pagination,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_levels_follow_similarity() {
        assert_eq!(classify(true, 0.85), (EventType::Recognized, AlertLevel::Medium));
        assert_eq!(classify(true, 0.65), (EventType::Recognized, AlertLevel::Low));
        assert_eq!(classify(false, 0.95), (EventType::Unknown, AlertLevel::Info));
    }

    #[test]
    fn pagination_bounds() {
        let p = Pagination::new(45, 1, 20);
        assert_eq!(p.total_pages, 3);
        assert!(p.has_next);
        assert!(!p.has_previous);

        let last = Pagination::new(45, 3, 20);
        assert!(!last.has_next);
        assert!(last.has_previous);

        let empty = Pagination::new(0, 1, 20);
        assert_eq!(empty.total_pages, 0);
        assert!(!empty.has_next);
    }
}
