use super::analysis::{JobProgress, JobRunner};
use super::JobRequest;
use crate::db::models::job_models::JobRecord;
use crate::db::repositories::jobs::JobsRepository;
use crate::error::Error;
use anyhow::Result;
use log::{debug, error, info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const INTERRUPTED: &str = "interrupted by restart";

struct QueuedJob {
    id: String,
    request: JobRequest,
}

/// Queue of analysis jobs served by a fixed pool of workers.
///
/// Submission writes a `queued` row and returns at once. Progress only
/// moves forward and the terminal write is guarded in SQL, so each job ends
/// exactly once, as `done` with its whole result or `error` with a message.
pub struct JobManager {
    repo: JobsRepository,
    queue: mpsc::UnboundedSender<QueuedJob>,
    cancel: CancellationToken,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl JobManager {
    /// Spawn `workers` job workers
    pub fn start(repo: JobsRepository, runner: Arc<JobRunner>, workers: usize) -> Arc<Self> {
        let (queue, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        let cancel = CancellationToken::new();

        let handles = (0..workers.max(1))
            .map(|n| {
                tokio::spawn(worker_loop(
                    n,
                    repo.clone(),
                    Arc::clone(&runner),
                    Arc::clone(&rx),
                    cancel.clone(),
                ))
            })
            .collect();
        info!("Started {} job workers", workers.max(1));

        Arc::new(Self {
            repo,
            queue,
            cancel,
            workers: std::sync::Mutex::new(handles),
        })
    }

    /// Fail jobs a previous process left unfinished
    pub async fn recover(&self) -> Result<u64> {
        let failed = self.repo.fail_unfinished(INTERRUPTED).await?;
        if failed > 0 {
            warn!("Marked {} unfinished jobs as failed", failed);
        }
        Ok(failed)
    }

    pub async fn submit(&self, request: JobRequest) -> Result<JobRecord> {
        let id = request.new_id();
        let payload = serde_json::to_value(&request).map_err(Error::from)?;
        let record = self.repo.create(&id, request.job_type(), &payload).await?;

        self.queue
            .send(QueuedJob {
                id: id.clone(),
                request,
            })
            .map_err(|_| Error::Job("Job queue is closed".to_string()))?;

        info!("Queued {} job {}", record.job_type.as_str(), id);
        Ok(record)
    }

    pub async fn status(&self, id: &str) -> Result<JobRecord> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Job {} not found", id)).into())
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<JobRecord>> {
        self.repo.list_recent(limit).await
    }

    /// Cancel running jobs and wait for the workers to exit
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Job worker ended abnormally: {}", e);
            }
        }
        info!("Job workers stopped");
    }
}

async fn worker_loop(
    n: usize,
    repo: JobsRepository,
    runner: Arc<JobRunner>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob>>>,
    cancel: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else { break };

        debug!("Job worker {} picked up {}", n, job.id);
        if let Err(e) = run_job(&repo, &runner, job, cancel.clone()).await {
            error!("Job worker {} failed to record a job outcome: {}", n, e);
        }
    }
    debug!("Job worker {} exited", n);
}

async fn run_job(
    repo: &JobsRepository,
    runner: &Arc<JobRunner>,
    job: QueuedJob,
    cancel: CancellationToken,
) -> Result<()> {
    if !repo.mark_running(&job.id).await? {
        debug!("Job {} is no longer queued", job.id);
        return Ok(());
    }

    let handle = Handle::current();
    let progress_repo = repo.clone();
    let progress_id = job.id.clone();
    let report = Box::new(move |fraction: f64| {
        if let Err(e) = handle.block_on(progress_repo.update_progress(&progress_id, fraction)) {
            warn!("Failed to update progress of job {}: {}", progress_id, e);
        }
    });

    let outputs = runner.job_dir(&job.id);
    let runner = Arc::clone(runner);
    let id = job.id.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let progress = JobProgress::new(report, cancel);
        runner.run(&id, &job.request, &progress)
    })
    .await;

    match outcome {
        Ok(Ok(result)) => {
            repo.complete(&job.id, &result).await?;
            info!("Job {} done", job.id);
        }
        Ok(Err(e)) => {
            discard_outputs(&outputs).await;
            repo.fail(&job.id, &e.to_string()).await?;
            warn!("Job {} failed: {}", job.id, e);
        }
        Err(e) => {
            discard_outputs(&outputs).await;
            repo.fail(&job.id, &format!("Job panicked: {}", e)).await?;
            error!("Job {} panicked: {}", job.id, e);
        }
    }
    Ok(())
}

/// Images of a failed job; nothing refers to them
async fn discard_outputs(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed outputs in {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", dir.display(), e),
    }
}
