use crate::digest::check_update;
use crate::jobs::{JobId, JobRepository, JobStatus, UpdateJob};
use crate::recreate::{RecreateOutcome, RecreationEngine};
use crate::runtime::ContainerRuntime;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

pub const MISSING_IMAGE: &str = "missing target image";

/// Published whenever a job reaches a terminal state.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub container: String,
    pub status: JobStatus,
    pub message: Option<String>,
}

enum JobOutcome {
    Success(serde_json::Value),
    Failed(String),
}

/// Drains queued jobs one at a time. At most one drain runs per worker.
pub struct Worker<R: ContainerRuntime, S: JobRepository> {
    id: String,
    runtime: Arc<R>,
    store: Arc<S>,
    engine: Arc<RecreationEngine<R>>,
    draining: AtomicBool,
    // set by a kick that arrived while a drain was running
    rerun: AtomicBool,
    events: broadcast::Sender<JobEvent>,
}

impl<R: ContainerRuntime, S: JobRepository> Worker<R, S> {
    pub fn new(
        id: impl Into<String>,
        runtime: Arc<R>,
        store: Arc<S>,
        engine: Arc<RecreationEngine<R>>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            id: id.into(),
            runtime,
            store,
            engine,
            draining: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Start draining in the background. Returns `false` when a drain is
    /// already in progress; that drain picks up the new work before it ends.
    pub fn kick(self: &Arc<Self>) -> bool {
        self.rerun.store(true, Ordering::SeqCst);
        if !self.acquire() {
            debug!("{}: drain already in progress", self.id);
            return false;
        }
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            worker.drain_acquired().await;
        });
        true
    }

    /// Drain in the current task. `None` when another drain holds the worker.
    pub async fn drain(&self) -> Option<usize> {
        if !self.acquire() {
            return None;
        }
        Some(self.drain_acquired().await)
    }

    fn acquire(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    async fn drain_acquired(&self) -> usize {
        let mut processed = 0;
        loop {
            self.rerun.store(false, Ordering::SeqCst);
            processed += self.claim_and_run_all().await;
            self.draining.store(false, Ordering::SeqCst);
            if !self.rerun.load(Ordering::SeqCst) || !self.acquire() {
                break;
            }
        }
        if processed > 0 {
            info!("{}: processed {processed} jobs", self.id);
        }
        processed
    }

    async fn claim_and_run_all(&self) -> usize {
        let mut processed = 0;
        loop {
            let job = match self.store.claim_next_queued(&self.id).await {
                Ok(Some(job)) => job,
                Ok(None) => return processed,
                Err(e) => {
                    error!("{}: failed to claim next job: {e}", self.id);
                    return processed;
                }
            };
            info!("{}: running job {} for {}", self.id, job.id, job.container);
            let outcome = self.run(&job).await;
            self.finish(&job, outcome).await;
            processed += 1;
        }
    }

    async fn run(&self, job: &UpdateJob) -> JobOutcome {
        let Some(image) = job.image.as_deref() else {
            return JobOutcome::Failed(MISSING_IMAGE.to_string());
        };

        // a different target reference is always a change
        if !job.force {
            match check_update(&*self.runtime, &job.container).await {
                Ok(check) if check.image == image && !check.has_update => {
                    info!("{}: no update for {}, skipping", job.id, job.container);
                    return JobOutcome::Success(json!({
                        "skipped": "no_update",
                        "reason": check.reason,
                    }));
                }
                Ok(_) => {}
                Err(e) => return JobOutcome::Failed(format!("update check failed: {e}")),
            }
        }

        if job.pull
            && let Err(e) = self.runtime.pull_image(image).await
        {
            return JobOutcome::Failed(format!("pull of {image} failed: {e}"));
        }

        match self.engine.recreate(&job.container, image).await {
            Ok(outcome @ RecreateOutcome::Success { .. }) => {
                JobOutcome::Success(serde_json::to_value(&outcome).unwrap_or_default())
            }
            Ok(RecreateOutcome::RolledBack { error, .. }) => {
                JobOutcome::Failed(format!("rolled_back: {error}"))
            }
            Err(e) => JobOutcome::Failed(e.to_string()),
        }
    }

    async fn finish(&self, job: &UpdateJob, outcome: JobOutcome) {
        let (status, message, stored) = match &outcome {
            JobOutcome::Success(result) => (
                JobStatus::Success,
                None,
                self.store.mark_success(&job.id, result).await,
            ),
            JobOutcome::Failed(message) => {
                warn!("{}: job {} failed: {message}", self.id, job.id);
                (
                    JobStatus::Failed,
                    Some(message.clone()),
                    self.store.mark_failed(&job.id, message).await,
                )
            }
        };
        if let Err(e) = stored {
            error!("{}: failed to record outcome of job {}: {e}", self.id, job.id);
        }
        // nobody listening is fine
        let _ = self.events.send(JobEvent {
            job_id: job.id.clone(),
            container: job.container.clone(),
            status,
            message,
        });
    }
}
