use crate::digest::{UpdateCheckResult, check_update};
use crate::error::SentinelError;
use crate::jobs::{
    EnqueueItem, EnqueueOutcome, JobFilter, JobId, JobPage, JobRepository, UpdateJob,
};
use crate::recreate::{RecreateOptions, RecreateOutcome, RecreationEngine};
use crate::runtime::{ContainerInfo, ContainerRuntime};
use crate::scan::{ScanReport, ScanRequest, Scanner};
use crate::scheduler::Scheduler;
use crate::scheduler::models::{
    DEFAULT_LABEL_KEY, ScanMode, SchedulerConfig, SchedulerConfigPatch,
};
use crate::scheduler::ports::SchedulerConfigRepository;
use crate::scheduler::validate_cron;
use crate::worker::{JobEvent, Worker};
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub struct SentinelOptions {
    pub worker_id: String,
    pub label_key: String,
    pub recreate: RecreateOptions,
}

impl Default for SentinelOptions {
    fn default() -> Self {
        Self {
            worker_id: format!("docksentinel-{}", std::process::id()),
            label_key: DEFAULT_LABEL_KEY.to_string(),
            recreate: RecreateOptions::default(),
        }
    }
}

/// The operations offered to an API layer, wired over one runtime and one
/// store.
pub struct Sentinel<R, S>
where
    R: ContainerRuntime,
    S: JobRepository + SchedulerConfigRepository,
{
    runtime: Arc<R>,
    store: Arc<S>,
    engine: Arc<RecreationEngine<R>>,
    scanner: Arc<Scanner<R, S>>,
    worker: Arc<Worker<R, S>>,
    scheduler: Scheduler<R, S>,
    label_key: String,
}

impl<R, S> Sentinel<R, S>
where
    R: ContainerRuntime,
    S: JobRepository + SchedulerConfigRepository,
{
    pub fn new(runtime: R, store: S, options: SentinelOptions) -> Self {
        let runtime = Arc::new(runtime);
        let store = Arc::new(store);
        let engine = Arc::new(RecreationEngine::new(
            Arc::clone(&runtime),
            options.recreate,
        ));
        let scanner = Arc::new(Scanner::new(Arc::clone(&runtime), Arc::clone(&store)));
        let worker = Arc::new(Worker::new(
            options.worker_id,
            Arc::clone(&runtime),
            Arc::clone(&store),
            Arc::clone(&engine),
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&scanner),
            Arc::clone(&store),
            Arc::clone(&worker),
        );
        Self {
            runtime,
            store,
            engine,
            scanner,
            worker,
            scheduler,
            label_key: options.label_key,
        }
    }

    /// Requeue jobs a crashed process left running.
    pub async fn recover(&self, stale_after: Duration) -> Result<u64, SentinelError> {
        Ok(self.store.reset_stale_running(stale_after).await?)
    }

    /// Install the persisted schedule and drain whatever is queued.
    pub async fn start(&self) -> Result<(), SentinelError> {
        let config = self.store.get_scheduler_config().await?;
        self.scheduler.apply(&config)?;
        self.worker.kick();
        info!("docksentinel started as {}", self.worker.id());
        Ok(())
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    pub async fn list_containers(&self) -> Result<Vec<ContainerInfo>, SentinelError> {
        let containers = self.runtime.list_containers().await?;
        Ok(containers.into_iter().map(ContainerInfo::from).collect())
    }

    pub async fn check_update(&self, container: &str) -> Result<UpdateCheckResult, SentinelError> {
        Ok(check_update(&*self.runtime, container).await?)
    }

    /// Recreate right away, outside the job queue.
    pub async fn recreate(
        &self,
        container: &str,
        image: &str,
    ) -> Result<RecreateOutcome, SentinelError> {
        Ok(self.engine.recreate(container, image).await?)
    }

    pub async fn enqueue(&self, items: &[EnqueueItem]) -> Result<EnqueueOutcome, SentinelError> {
        let outcome = self.store.enqueue_many(items).await?;
        if !outcome.queued.is_empty() {
            self.worker.kick();
        }
        Ok(outcome)
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage, SentinelError> {
        Ok(self.store.list_jobs(filter).await?)
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Option<UpdateJob>, SentinelError> {
        Ok(self.store.get_job(id).await?)
    }

    pub async fn get_scheduler_config(&self) -> Result<SchedulerConfig, SentinelError> {
        Ok(self.store.get_scheduler_config().await?)
    }

    /// Validate, persist and re-apply the schedule.
    pub async fn patch_scheduler_config(
        &self,
        patch: SchedulerConfigPatch,
    ) -> Result<SchedulerConfig, SentinelError> {
        let mut config = self.store.get_scheduler_config().await?;
        config.apply(patch);
        validate_cron(&config.cron_expr)?;
        self.store.save_scheduler_config(&config).await?;
        self.scheduler.apply(&config)?;
        Ok(config)
    }

    /// One scan outside the schedule. `label_key` overrides the configured
    /// auto update label.
    pub async fn scan_and_enqueue(
        &self,
        mode: ScanMode,
        label_key: Option<&str>,
    ) -> Result<ScanReport, SentinelError> {
        let request = ScanRequest::new(mode, label_key.unwrap_or(&self.label_key));
        let report = self.scanner.scan(&request).await?;
        if report
            .enqueue
            .as_ref()
            .is_some_and(|outcome| !outcome.queued.is_empty())
        {
            self.worker.kick();
        }
        Ok(report)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.worker.subscribe()
    }

    pub fn scheduler_active(&self) -> bool {
        self.scheduler.is_active()
    }

    /// Wait until the queue has been drained by this process.
    pub async fn drain_queue(&self) -> usize {
        loop {
            if let Some(processed) = self.worker.drain().await {
                return processed;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }
}
