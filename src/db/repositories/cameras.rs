use crate::db::models::camera_models::{Camera, CameraConfig, CameraRow, CameraStatus};
use crate::db::now_millis;
use crate::error::Error;
use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::debug;

const CAMERA_COLUMNS: &str = "id, name, url, mode, threshold, fps, transport, timeout_ms, \
     known_relpath, status, last_error, enabled, created_at, updated_at";

/// Cameras repository for handling camera operations
#[derive(Clone)]
pub struct CamerasRepository {
    pool: Arc<SqlitePool>,
}

impl CamerasRepository {
    /// Create a new cameras repository
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Insert a camera or replace the configuration of an existing one.
    /// Status and error fields of an existing camera are kept.
    pub async fn upsert(&self, config: &CameraConfig) -> Result<Camera> {
        let now = now_millis();

        sqlx::query(
            r#"
            INSERT INTO cameras (
                id, name, url, mode, threshold, fps, transport, timeout_ms, known_relpath,
                status, enabled, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'stopped', 0, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                url = excluded.url,
                mode = excluded.mode,
                threshold = excluded.threshold,
                fps = excluded.fps,
                transport = excluded.transport,
                timeout_ms = excluded.timeout_ms,
                known_relpath = excluded.known_relpath,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&config.id)
        .bind(&config.name)
        .bind(&config.url)
        .bind(config.mode.as_str())
        .bind(config.threshold as f64)
        .bind(config.fps)
        .bind(config.transport.as_str())
        .bind(config.timeout_ms as i64)
        .bind(&config.known_relpath)
        .bind(now)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to save camera: {}", e)))?;

        debug!("Saved camera {}", config.id);

        self.get_by_id(&config.id)
            .await?
            .ok_or_else(|| Error::Database(format!("Camera {} vanished after save", config.id)).into())
    }

    /// Get camera by ID
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Camera>> {
        let row = sqlx::query_as::<_, CameraRow>(&format!(
            "SELECT {} FROM cameras WHERE id = ?",
            CAMERA_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get camera by ID: {}", e)))?;

        Ok(row.map(Camera::try_from).transpose()?)
    }

    /// Get all cameras, oldest first
    pub async fn get_all(&self) -> Result<Vec<Camera>> {
        let rows = sqlx::query_as::<_, CameraRow>(&format!(
            "SELECT {} FROM cameras ORDER BY created_at, id",
            CAMERA_COLUMNS
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get cameras: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(Camera::try_from)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Cameras flagged to run again after a restart
    pub async fn get_enabled(&self) -> Result<Vec<Camera>> {
        let rows = sqlx::query_as::<_, CameraRow>(&format!(
            "SELECT {} FROM cameras WHERE enabled = 1 ORDER BY created_at, id",
            CAMERA_COLUMNS
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get enabled cameras: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(Camera::try_from)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Persist a status change
    pub async fn update_status(
        &self,
        id: &str,
        status: CameraStatus,
        last_error: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE cameras SET status = ?, last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(last_error)
        .bind(now_millis())
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to update camera status: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE cameras SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(now_millis())
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to update camera: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    /// Statuses left behind by a previous process describe workers that no
    /// longer exist.
    pub async fn reset_active_statuses(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE cameras SET status = 'stopped', updated_at = ? \
             WHERE status IN ('starting', 'running', 'stopping')",
        )
        .bind(now_millis())
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to reset camera statuses: {}", e)))?;

        Ok(result.rows_affected())
    }

    /// Delete a camera
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cameras WHERE id = ?")
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to delete camera: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::camera_models::{MatchMode, Transport};
    use crate::db::test_pool;

    fn config(id: &str) -> CameraConfig {
        CameraConfig {
            id: id.to_string(),
            name: "Lobby".to_string(),
            url: "rtsp://10.0.0.5/stream1".to_string(),
            mode: MatchMode::Watchlist,
            threshold: 0.6,
            fps: 3.0,
            transport: Transport::Tcp,
            timeout_ms: 5000,
            known_relpath: None,
        }
    }

    #[tokio::test]
    async fn upsert_keeps_status() {
        let repo = CamerasRepository::new(Arc::new(test_pool().await));
        repo.upsert(&config("cam-1")).await.unwrap();
        repo.update_status("cam-1", CameraStatus::Error, Some("timeout"))
            .await
            .unwrap();

        let mut changed = config("cam-1");
        changed.name = "Entrance".to_string();
        changed.transport = Transport::Udp;
        let camera = repo.upsert(&changed).await.unwrap();

        assert_eq!(camera.config.name, "Entrance");
        assert_eq!(camera.config.transport, Transport::Udp);
        assert_eq!(camera.status, CameraStatus::Error);
        assert_eq!(camera.last_error.as_deref(), Some("timeout"));
        assert_eq!(repo.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reset_and_enabled() {
        let repo = CamerasRepository::new(Arc::new(test_pool().await));
        repo.upsert(&config("cam-1")).await.unwrap();
        repo.upsert(&config("cam-2")).await.unwrap();
        repo.update_status("cam-1", CameraStatus::Running, None)
            .await
            .unwrap();
        repo.set_enabled("cam-1", true).await.unwrap();

        assert_eq!(repo.reset_active_statuses().await.unwrap(), 1);
        let enabled = repo.get_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id(), "cam-1");
        assert_eq!(enabled[0].status, CameraStatus::Stopped);

        assert!(repo.delete("cam-2").await.unwrap());
        assert!(!repo.delete("cam-2").await.unwrap());
    }
}
