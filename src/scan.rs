use crate::digest::{UpdateCheckResult, check_update};
use crate::error::SentinelError;
use crate::jobs::{EnqueueItem, EnqueueOutcome, JobRepository};
use crate::runtime::{ContainerInfo, ContainerRuntime};
use crate::scheduler::models::{
    DEFAULT_LABEL_KEY, DEFAULT_SCAN_LABEL_KEY, ScanMode, ScanScope, SchedulerConfig,
};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;

/// Label values that switch a container off, compared case-insensitively.
const DISABLED_VALUES: [&str; 4] = ["false", "0", "no", "off"];

pub fn label_disables(value: &str) -> bool {
    let value = value.trim().to_ascii_lowercase();
    DISABLED_VALUES.contains(&value.as_str())
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub mode: ScanMode,
    pub scope: ScanScope,
    pub scan_label_key: String,
    pub update_label_key: String,
}

impl ScanRequest {
    /// Scan everything, gating auto update on `update_label_key`.
    pub fn new(mode: ScanMode, update_label_key: impl Into<String>) -> Self {
        Self {
            mode,
            scope: ScanScope::All,
            scan_label_key: DEFAULT_SCAN_LABEL_KEY.to_string(),
            update_label_key: update_label_key.into(),
        }
    }
}

impl Default for ScanRequest {
    fn default() -> Self {
        Self::new(ScanMode::ScanOnly, DEFAULT_LABEL_KEY)
    }
}

impl From<&SchedulerConfig> for ScanRequest {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            mode: config.mode,
            scope: config.scope,
            scan_label_key: config.scan_label_key.clone(),
            update_label_key: config.update_label_key.clone(),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ScanEntry {
    pub container: ContainerInfo,
    pub auto_update: bool,
    pub check: UpdateCheckResult,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub mode: ScanMode,
    pub results: Vec<ScanEntry>,
    pub enqueue: Option<EnqueueOutcome>,
}

impl ScanReport {
    pub fn updates_available(&self) -> usize {
        self.results.iter().filter(|entry| entry.check.has_update).count()
    }
}

fn in_scope(request: &ScanRequest, container: &ContainerInfo) -> bool {
    let label = container.labels.get(&request.scan_label_key);
    match request.scope {
        ScanScope::All => !label.is_some_and(|value| label_disables(value)),
        ScanScope::Labeled => label.is_some_and(|value| !label_disables(value)),
    }
}

pub struct Scanner<R: ContainerRuntime, S: JobRepository> {
    runtime: Arc<R>,
    store: Arc<S>,
}

impl<R: ContainerRuntime, S: JobRepository> Scanner<R, S> {
    pub fn new(runtime: Arc<R>, store: Arc<S>) -> Self {
        Self { runtime, store }
    }

    /// Check every container. A failing check is recorded on its own entry
    /// and never aborts the scan; only listing the containers can fail.
    pub async fn scan(&self, request: &ScanRequest) -> Result<ScanReport, SentinelError> {
        let containers = self.runtime.list_containers().await?;
        info!(
            "scanning {} containers ({}, scope {})",
            containers.len(),
            request.mode,
            request.scope.as_str()
        );

        let mut results = Vec::new();
        let mut items = Vec::new();
        for container in containers.into_iter().map(ContainerInfo::from) {
            if !in_scope(request, &container) {
                debug!("{} is out of scan scope", container.name);
                continue;
            }
            let auto_update = !container
                .labels
                .get(&request.update_label_key)
                .is_some_and(|value| label_disables(value));

            let check = match check_update(&*self.runtime, &container.id).await {
                Ok(check) => check,
                Err(e) => {
                    warn!("update check for {} failed: {e}", container.name);
                    UpdateCheckResult::failed(&container.name, &container.image, e.to_string())
                }
            };

            if check.has_update {
                info!("{} has an update for {}", check.container, check.image);
                if request.mode == ScanMode::ScanAndUpdate && auto_update {
                    items.push(EnqueueItem {
                        container: check.container.clone(),
                        image: Some(check.image.clone()),
                        force: false,
                        pull: true,
                    });
                } else if !auto_update {
                    debug!("{} has auto update disabled", check.container);
                }
            }

            results.push(ScanEntry {
                container,
                auto_update,
                check,
            });
        }

        let enqueue = match request.mode {
            ScanMode::ScanAndUpdate => Some(self.store.enqueue_many(&items).await?),
            ScanMode::ScanOnly => None,
        };

        Ok(ScanReport {
            mode: request.mode,
            results,
            enqueue,
        })
    }
}
