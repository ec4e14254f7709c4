use crate::db::models::event_models::{
    DetectionEvent, EventFilter, EventPage, EventRow, NewEvent, Pagination,
};
use crate::error::Error;
use anyhow::Result;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::sync::Arc;

const EVENT_COLUMNS: &str = "id, camera_id, ts, confidence, bbox, thumb_relpath, full_image_path, \
     matched, person_id, person_name, quality_score, is_low_quality, frame_number, face_width, \
     face_height, face_size, sharpness, brightness, event_type, alert_level, processing_time_ms, \
     age_estimate, gender, frame_width, frame_height";

/// Files attached to an event, collected before the row is removed
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventFiles {
    pub id: i64,
    pub thumb_relpath: String,
    pub full_image_path: Option<String>,
}

/// Events repository for handling event operations
#[derive(Clone)]
pub struct EventsRepository {
    pool: Arc<SqlitePool>,
}

impl EventsRepository {
    /// Create a new events repository
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Append an event, returning its id
    pub async fn create(&self, event: &NewEvent) -> Result<i64> {
        let bbox = serde_json::to_string(&event.bbox)?;

        let result = sqlx::query(
            r#"
            INSERT INTO events (
                camera_id, ts, confidence, bbox, thumb_relpath, full_image_path, matched,
                person_id, person_name, quality_score, is_low_quality, frame_number,
                face_width, face_height, face_size, sharpness, brightness, event_type,
                alert_level, processing_time_ms, age_estimate, gender, frame_width, frame_height
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.camera_id)
        .bind(event.ts)
        .bind(event.confidence as f64)
        .bind(bbox)
        .bind(&event.thumb_relpath)
        .bind(&event.full_image_path)
        .bind(event.matched)
        .bind(event.person_id)
        .bind(&event.person_name)
        .bind(event.quality_score as f64)
        .bind(event.is_low_quality)
        .bind(event.frame_number)
        .bind(event.bbox.width() as i64)
        .bind(event.bbox.height() as i64)
        .bind(event.bbox.width().min(event.bbox.height()) as i64)
        .bind(event.sharpness)
        .bind(event.brightness)
        .bind(event.event_type.as_str())
        .bind(event.alert_level.as_str())
        .bind(event.processing_time_ms)
        .bind(event.age_estimate)
        .bind(&event.gender)
        .bind(event.frame_size.map(|(w, _)| w as i64))
        .bind(event.frame_size.map(|(_, h)| h as i64))
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create event: {}", e)))?;

        Ok(result.last_insert_rowid())
    }

    /// Get event by ID
    pub async fn get_by_id(&self, id: i64) -> Result<Option<DetectionEvent>> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {} FROM events WHERE id = ?",
            EVENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get event by ID: {}", e)))?;

        Ok(row.map(DetectionEvent::from))
    }

    /// One page of events matching `filter`. Pages start at 1.
    pub async fn search(&self, filter: &EventFilter, page: u32, limit: u32) -> Result<EventPage> {
        let page = page.max(1);
        let limit = limit.clamp(1, 1000);

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM events WHERE 1=1");
        push_filters(&mut count, filter);
        let total_count: i64 = count
            .build_query_scalar::<i64>()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to count events: {}", e)))?;

        let mut select = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM events WHERE 1=1",
            EVENT_COLUMNS
        ));
        push_filters(&mut select, filter);

        // id breaks ties so pages never overlap
        let direction = if filter.descending { "DESC" } else { "ASC" };
        select.push(format!(
            " ORDER BY {} {}, id {}",
            filter.sort_by.column(),
            direction,
            direction
        ));
        select.push(" LIMIT ");
        select.push_bind(limit as i64);
        select.push(" OFFSET ");
        select.push_bind((page as i64 - 1) * limit as i64);

        let rows = select
            .build_query_as::<EventRow>()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to search events: {}", e)))?;

        Ok(EventPage {
            events: rows.into_iter().map(DetectionEvent::from).collect(),
            pagination: Pagination::new(total_count, page, limit),
        })
    }

    /// Up to `limit` events of one match class recorded before `cutoff_ts`, oldest id first
    pub async fn expired(&self, matched: bool, cutoff_ts: i64, limit: u32) -> Result<Vec<EventFiles>> {
        let rows = sqlx::query_as::<_, EventFiles>(
            "SELECT id, thumb_relpath, full_image_path FROM events \
             WHERE matched = ? AND ts < ? ORDER BY id LIMIT ?",
        )
        .bind(matched)
        .bind(cutoff_ts)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list expired events: {}", e)))?;

        Ok(rows)
    }

    /// Events of one match class older than `cutoff_ts` that still hold a full frame
    pub async fn expired_full_frames(
        &self,
        matched: bool,
        cutoff_ts: i64,
        limit: u32,
    ) -> Result<Vec<EventFiles>> {
        let rows = sqlx::query_as::<_, EventFiles>(
            "SELECT id, thumb_relpath, full_image_path FROM events \
             WHERE matched = ? AND ts < ? AND full_image_path IS NOT NULL ORDER BY id LIMIT ?",
        )
        .bind(matched)
        .bind(cutoff_ts)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list expired full frames: {}", e)))?;

        Ok(rows)
    }

    /// Callers keep `ids` well under SQLite's bound variable limit
    pub async fn delete_by_ids(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM events WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = query
            .build()
            .execute(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to delete events: {}", e)))?;

        Ok(result.rows_affected())
    }

    pub async fn clear_full_images(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut query =
            QueryBuilder::<Sqlite>::new("UPDATE events SET full_image_path = NULL WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = query
            .build()
            .execute(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to clear full images: {}", e)))?;

        Ok(result.rows_affected())
    }
}

fn push_filters(query: &mut QueryBuilder<'_, Sqlite>, filter: &EventFilter) {
    if !filter.camera_ids.is_empty() {
        query.push(" AND camera_id IN (");
        let mut separated = query.separated(", ");
        for id in &filter.camera_ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");
    }
    if let Some(start) = filter.start_ts {
        query.push(" AND ts >= ").push_bind(start);
    }
    if let Some(end) = filter.end_ts {
        query.push(" AND ts <= ").push_bind(end);
    }
    if let Some(matched) = filter.matched {
        query.push(" AND matched = ").push_bind(matched);
    }
    if let Some(min) = filter.confidence_min {
        query.push(" AND confidence >= ").push_bind(min as f64);
    }
    if let Some(max) = filter.confidence_max {
        query.push(" AND confidence <= ").push_bind(max as f64);
    }
    if let Some(min) = filter.quality_min {
        query.push(" AND quality_score >= ").push_bind(min as f64);
    }
    if let Some(below) = filter.quality_below {
        query.push(" AND quality_score < ").push_bind(below as f64);
    }
    if filter.exclude_low_quality {
        query.push(" AND is_low_quality = 0");
    }
    if let Some(size) = filter.min_face_size {
        query.push(" AND face_size >= ").push_bind(size);
    }
    if let Some(name) = filter.person_name.as_ref().filter(|n| !n.is_empty()) {
        query
            .push(" AND person_name LIKE '%' || ")
            .push_bind(name.clone())
            .push(" || '%'");
    }
    if let Some(min) = filter.age_min {
        query.push(" AND age_estimate >= ").push_bind(min);
    }
    if let Some(max) = filter.age_max {
        query.push(" AND age_estimate <= ").push_bind(max);
    }
    if let Some(gender) = filter.gender.as_ref().filter(|g| !g.is_empty()) {
        query.push(" AND gender = ").push_bind(gender.clone());
    }
    if !filter.alert_levels.is_empty() {
        query.push(" AND alert_level IN (");
        let mut separated = query.separated(", ");
        for level in &filter.alert_levels {
            separated.push_bind(level.clone());
        }
        separated.push_unseparated(")");
    }
    if !filter.event_types.is_empty() {
        query.push(" AND event_type IN (");
        let mut separated = query.separated(", ");
        for kind in &filter.event_types {
            separated.push_bind(kind.clone());
        }
        separated.push_unseparated(")");
    }
}
