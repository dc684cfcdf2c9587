//! Cron driven scans. The configuration is a singleton row; applying it
//! replaces whatever timer task ran before.
pub mod models;
pub mod ports;

use crate::jobs::JobRepository;
use crate::runtime::ContainerRuntime;
use crate::scan::{ScanRequest, Scanner};
use crate::worker::Worker;
use chrono::{DateTime, Utc};
use croner::Cron;
use log::{debug, error, info};
use models::SchedulerConfig;
use ports::SchedulerConfigRepository;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

const RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("cron expression `{expr}` must have 5 fields, found {fields}")]
    FieldCount { expr: String, fields: usize },
    #[error("invalid cron expression `{expr}`: {reason}")]
    InvalidCron { expr: String, reason: String },
}

/// Accepts standard five field expressions only.
pub fn validate_cron(expr: &str) -> Result<(), SchedulerError> {
    parse_cron(expr).map(|_| ())
}

fn parse_cron(expr: &str) -> Result<Cron, SchedulerError> {
    let expr = expr.trim();
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(SchedulerError::FieldCount {
            expr: expr.to_string(),
            fields,
        });
    }
    let invalid = |reason: String| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        reason,
    };
    let cron = Cron::new(expr).parse().map_err(|e| invalid(e.to_string()))?;
    cron.find_next_occurrence(&Utc::now(), false)
        .map_err(|e| invalid(format!("never fires: {e}")))?;
    Ok(cron)
}

/// How long to wait before the next scheduled scan. `None` when the
/// expression yields no further occurrence.
fn next_fire(cron: &Cron, now: DateTime<Utc>) -> Option<Duration> {
    match cron.find_next_occurrence(&now, false) {
        Ok(next) => {
            debug!("next scheduled scan at {next}");
            Some((next - now).to_std().unwrap_or_default())
        }
        Err(e) => {
            error!(
                "no next occurrence for schedule, retrying in {}s: {e}",
                RETRY_AFTER.as_secs()
            );
            None
        }
    }
}

pub struct Scheduler<R: ContainerRuntime, S: JobRepository + SchedulerConfigRepository> {
    scanner: Arc<Scanner<R, S>>,
    store: Arc<S>,
    worker: Arc<Worker<R, S>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<R: ContainerRuntime, S: JobRepository + SchedulerConfigRepository> Scheduler<R, S> {
    pub fn new(scanner: Arc<Scanner<R, S>>, store: Arc<S>, worker: Arc<Worker<R, S>>) -> Self {
        Self {
            scanner,
            store,
            worker,
            task: Mutex::new(None),
        }
    }

    /// Tear down the running timer and, when enabled, install a new one.
    pub fn apply(&self, config: &SchedulerConfig) -> Result<(), SchedulerError> {
        let cron = if config.enabled {
            Some(parse_cron(&config.cron_expr)?)
        } else {
            None
        };

        let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = task.take() {
            debug!("stopping previous schedule");
            previous.abort();
        }
        let Some(cron) = cron else {
            info!("Scheduler disabled");
            return Ok(());
        };

        info!("Scheduling {} scans at `{}`", config.mode, config.cron_expr);
        let scanner = Arc::clone(&self.scanner);
        let store = Arc::clone(&self.store);
        let worker = Arc::clone(&self.worker);
        *task = Some(tokio::spawn(run_schedule(cron, scanner, store, worker)));
        Ok(())
    }

    /// Run one scheduled scan right away with the persisted configuration.
    pub async fn trigger(&self) {
        tick(&self.scanner, &self.store, &self.worker).await;
    }

    pub fn is_active(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    pub fn shutdown(&self) {
        let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }
}

impl<R: ContainerRuntime, S: JobRepository + SchedulerConfigRepository> Drop for Scheduler<R, S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_schedule<R, S>(
    cron: Cron,
    scanner: Arc<Scanner<R, S>>,
    store: Arc<S>,
    worker: Arc<Worker<R, S>>,
) where
    R: ContainerRuntime,
    S: JobRepository + SchedulerConfigRepository,
{
    loop {
        match next_fire(&cron, Utc::now()) {
            Some(wait) => {
                tokio::time::sleep(wait).await;
                tick(&scanner, &store, &worker).await;
            }
            None => tokio::time::sleep(RETRY_AFTER).await,
        }
    }
}

/// One scheduled run. Errors are logged, the schedule stays installed.
async fn tick<R, S>(scanner: &Scanner<R, S>, store: &S, worker: &Arc<Worker<R, S>>)
where
    R: ContainerRuntime,
    S: JobRepository + SchedulerConfigRepository,
{
    let config = match store.get_scheduler_config().await {
        Ok(config) => config,
        Err(e) => {
            error!("scheduled scan skipped, cannot load configuration: {e}");
            return;
        }
    };
    match scanner.scan(&ScanRequest::from(&config)).await {
        Ok(report) => {
            info!(
                "scheduled scan checked {} containers, {} with updates",
                report.results.len(),
                report.updates_available()
            );
            if report
                .enqueue
                .as_ref()
                .is_some_and(|outcome| !outcome.queued.is_empty())
            {
                worker.kick();
            }
        }
        Err(e) => error!("scheduled scan failed: {e}"),
    }
    if let Err(e) = store.record_scheduler_run(Utc::now()).await {
        error!("failed to record scheduler run: {e}");
    }
}
