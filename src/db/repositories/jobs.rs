use crate::db::models::job_models::{JobRecord, JobRow, JobType};
use crate::db::now_millis;
use crate::error::Error;
use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;

const JOB_COLUMNS: &str =
    "id, job_type, status, progress, payload, result, error, created_at, updated_at";

/// Job records. The SQL guards make progress non-decreasing and let a job
/// reach a terminal status exactly once, whoever calls.
#[derive(Clone)]
pub struct JobsRepository {
    pool: Arc<SqlitePool>,
}

impl JobsRepository {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        id: &str,
        job_type: JobType,
        payload: &serde_json::Value,
    ) -> Result<JobRecord> {
        let now = now_millis();
        sqlx::query(
            "INSERT INTO jobs (id, job_type, status, progress, payload, created_at, updated_at) \
             VALUES (?, ?, 'queued', 0, ?, ?, ?)",
        )
        .bind(id)
        .bind(job_type.as_str())
        .bind(payload.to_string())
        .bind(now)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create job: {}", e)))?;

        self.get(id)
            .await?
            .ok_or_else(|| Error::Database(format!("Job {} vanished after insert", id)).into())
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE id = ?",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get job: {}", e)))?;

        Ok(row.map(JobRecord::try_from).transpose()?)
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs ORDER BY created_at DESC, id DESC LIMIT ?",
            JOB_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list jobs: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(JobRecord::try_from)
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// queued -> running
    pub async fn mark_running(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'running', updated_at = ? WHERE id = ? AND status = 'queued'",
        )
        .bind(now_millis())
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to start job: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    /// Raise progress; lower values are ignored
    pub async fn update_progress(&self, id: &str, progress: f64) -> Result<bool> {
        let progress = progress.clamp(0.0, 1.0);
        let result = sqlx::query(
            "UPDATE jobs SET progress = MAX(progress, ?), updated_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(progress)
        .bind(now_millis())
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to update job progress: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn complete(&self, id: &str, result: &serde_json::Value) -> Result<bool> {
        let outcome = sqlx::query(
            "UPDATE jobs SET status = 'done', progress = 1.0, result = ?, error = NULL, updated_at = ? \
             WHERE id = ? AND status IN ('queued', 'running')",
        )
        .bind(result.to_string())
        .bind(now_millis())
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to complete job: {}", e)))?;

        Ok(outcome.rows_affected() > 0)
    }

    pub async fn fail(&self, id: &str, message: &str) -> Result<bool> {
        let outcome = sqlx::query(
            "UPDATE jobs SET status = 'error', result = NULL, error = ?, updated_at = ? \
             WHERE id = ? AND status IN ('queued', 'running')",
        )
        .bind(message)
        .bind(now_millis())
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to fail job: {}", e)))?;

        Ok(outcome.rows_affected() > 0)
    }

    /// Fail every job a previous process left unfinished
    pub async fn fail_unfinished(&self, message: &str) -> Result<u64> {
        let outcome = sqlx::query(
            "UPDATE jobs SET status = 'error', error = ?, updated_at = ? \
             WHERE status IN ('queued', 'running')",
        )
        .bind(message)
        .bind(now_millis())
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to fail unfinished jobs: {}", e)))?;

        Ok(outcome.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::job_models::JobStatus;
    use crate::db::test_pool;
    use serde_json::json;

    #[tokio::test]
    async fn progress_never_decreases() {
        let repo = JobsRepository::new(Arc::new(test_pool().await));
        repo.create("job-1", JobType::PicToVideo, &json!({"video": "v.mp4"}))
            .await
            .unwrap();

        // not running yet
        assert!(!repo.update_progress("job-1", 0.3).await.unwrap());
        assert!(repo.mark_running("job-1").await.unwrap());
        assert!(!repo.mark_running("job-1").await.unwrap());

        repo.update_progress("job-1", 0.5).await.unwrap();
        repo.update_progress("job-1", 0.2).await.unwrap();
        let job = repo.get("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!((job.progress - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn terminal_status_is_final() {
        let repo = JobsRepository::new(Arc::new(test_pool().await));
        repo.create("job-2", JobType::VideoAnalysis, &json!({})).await.unwrap();
        repo.mark_running("job-2").await.unwrap();

        assert!(repo.complete("job-2", &json!({"matches": []})).await.unwrap());
        assert!(!repo.fail("job-2", "late failure").await.unwrap());
        assert!(!repo.complete("job-2", &json!({"matches": [1]})).await.unwrap());
        assert!(!repo.update_progress("job-2", 0.1).await.unwrap());

        let job = repo.get("job-2").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.progress, 1.0);
        assert_eq!(job.result, Some(json!({"matches": []})));
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn unfinished_jobs_fail_on_boot() {
        let repo = JobsRepository::new(Arc::new(test_pool().await));
        repo.create("a", JobType::RtspAnalysis, &json!({})).await.unwrap();
        repo.create("b", JobType::RtspAnalysis, &json!({})).await.unwrap();
        repo.mark_running("b").await.unwrap();
        repo.create("c", JobType::RtspAnalysis, &json!({})).await.unwrap();
        repo.fail("c", "boom").await.unwrap();

        assert_eq!(repo.fail_unfinished("interrupted").await.unwrap(), 2);
        let jobs = repo.list_recent(10).await.unwrap();
        assert!(jobs.iter().all(|j| j.status == JobStatus::Error));
        assert_eq!(repo.get("c").await.unwrap().unwrap().error.as_deref(), Some("boom"));
    }
}
