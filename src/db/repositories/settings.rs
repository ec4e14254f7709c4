use crate::db::now_millis;
use crate::error::Error;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Key/value store for runtime-adjustable settings, values kept as JSON
#[derive(Clone)]
pub struct SettingsRepository {
    pool: Arc<SqlitePool>,
}

impl SettingsRepository {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to read setting {}: {}", key, e)))?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(Error::from)?)),
            None => Ok(None),
        }
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value).map_err(Error::from)?;
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(encoded)
        .bind(now_millis())
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to write setting {}: {}", key, e)))?;

        Ok(())
    }
}
