use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

/// Migration files in application order. Every statement is idempotent so
/// the full set is replayed on each boot.
const MIGRATIONS: &[(&str, &str)] = &[
    ("001_create_cameras.sql", include_str!("sql/001_create_cameras.sql")),
    ("002_create_watchlist.sql", include_str!("sql/002_create_watchlist.sql")),
    ("003_create_events.sql", include_str!("sql/003_create_events.sql")),
    ("004_create_jobs.sql", include_str!("sql/004_create_jobs.sql")),
    ("005_create_settings.sql", include_str!("sql/005_create_settings.sql")),
    // Indexes go after every table exists
    ("add_indexes.sql", include_str!("sql/add_indexes.sql")),
];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for (name, sql) in MIGRATIONS {
        execute_migration(pool, name, sql).await?;
        info!("Applied migration: {}", name);
    }

    Ok(())
}

async fn execute_migration(pool: &SqlitePool, name: &str, sql: &str) -> Result<()> {
    sqlx::raw_sql(sql)
        .execute(pool)
        .await
        .map_err(|e| anyhow::anyhow!("Migration {} failed: {}", name, e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn migrations_are_replayable() {
        let pool = test_pool().await;
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        for table in ["cameras", "events", "jobs", "person_images", "persons", "settings"] {
            assert!(tables.iter().any(|t| t == table), "missing table {}", table);
        }
    }
}
