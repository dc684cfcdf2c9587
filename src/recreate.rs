//! Replace a container with one running a new image, keeping its
//! configuration and rolling back to the original when the replacement does
//! not come up.
use crate::runtime::{ContainerId, ContainerRuntime, RuntimeError};
use bollard::models::{
    ContainerConfig, ContainerCreateBody, ContainerInspectResponse, ContainerStateStatusEnum,
    EndpointSettings, HealthStatusEnum, HostConfig, NetworkingConfig,
};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep};

#[derive(Debug, Clone, PartialEq)]
pub struct RecreateOptions {
    /// Grace period handed to the runtime when stopping a container.
    pub stop_timeout: i32,
    pub health_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RecreateOptions {
    fn default() -> Self {
        Self {
            stop_timeout: 10,
            health_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    #[serde(rename = "healthy")]
    Healthy,
    #[serde(rename = "no-healthcheck")]
    NoHealthcheck,
}

impl Display for HealthOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthOutcome::Healthy => write!(f, "healthy"),
            HealthOutcome::NoHealthcheck => write!(f, "no-healthcheck"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HealthFailure {
    #[error("unhealthy")]
    Unhealthy,
    #[error("timeout")]
    Timeout,
    #[error("container stopped with status {0}")]
    Exited(String),
}

#[derive(Debug, Error)]
enum StepFailure {
    #[error("create failed: {0}")]
    Create(RuntimeError),
    #[error("start failed: {0}")]
    Start(RuntimeError),
    #[error("inspect failed: {0}")]
    Inspect(RuntimeError),
    #[error("health gate failed: {0}")]
    Health(HealthFailure),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecreateOutcome {
    Success {
        old: ContainerId,
        new: ContainerId,
        health: HealthOutcome,
    },
    RolledBack {
        old: ContainerId,
        attempted_image: String,
        error: String,
    },
}

/// Everything needed to create an equivalent container from another image.
#[derive(Debug, Clone)]
pub struct RecreatePlan {
    pub id: ContainerId,
    pub name: String,
    pub running: bool,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    pub networks: HashMap<String, EndpointSettings>,
}

impl RecreatePlan {
    pub fn from_inspect(details: ContainerInspectResponse) -> Self {
        let id = details.id.unwrap_or_default();
        let name = details
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();
        let running = details
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);
        let networks = details
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default();
        Self {
            id,
            name,
            running,
            config: details.config.unwrap_or_default(),
            host_config: details.host_config.unwrap_or_default(),
            networks,
        }
    }

    /// True when a host port is pinned. Ephemeral (`""`/`"0"`) bindings do
    /// not collide between the old and the new container.
    pub fn binds_host_ports(&self) -> bool {
        self.host_config
            .port_bindings
            .iter()
            .flat_map(|bindings| bindings.values())
            .flatten()
            .flatten()
            .filter_map(|binding| binding.host_port.as_deref())
            .any(|port| !port.is_empty() && port != "0")
    }

    pub fn create_body(&self, image: &str) -> ContainerCreateBody {
        let config = self.config.clone();
        ContainerCreateBody {
            image: Some(image.to_string()),
            env: config.env,
            labels: config.labels,
            exposed_ports: config.exposed_ports,
            user: config.user,
            working_dir: config.working_dir,
            attach_stderr: config.attach_stderr,
            attach_stdout: config.attach_stdout,
            tty: config.tty,
            open_stdin: config.open_stdin,
            stop_signal: config.stop_signal,
            stop_timeout: config.stop_timeout,
            healthcheck: config.healthcheck,
            host_config: Some(self.host_config.clone()),
            networking_config: self.networking_config(),
            ..Default::default()
        }
    }

    fn networking_config(&self) -> Option<NetworkingConfig> {
        let mode = self.host_config.network_mode.as_deref().unwrap_or_default();
        if self.networks.is_empty()
            || mode == "host"
            || mode == "none"
            || mode.starts_with("container:")
        {
            return None;
        }
        let short_id: String = self.id.chars().take(12).collect();
        let endpoints = self
            .networks
            .iter()
            .map(|(network, settings)| {
                // the runtime adds the short id alias of the new container itself
                let aliases = settings
                    .aliases
                    .as_ref()
                    .map(|aliases| {
                        aliases
                            .iter()
                            .filter(|alias| **alias != short_id)
                            .cloned()
                            .collect::<Vec<_>>()
                    })
                    .filter(|aliases| !aliases.is_empty() && network != "bridge");
                let endpoint = EndpointSettings {
                    aliases,
                    links: settings.links.clone(),
                    ipam_config: settings.ipam_config.clone(),
                    ..Default::default()
                };
                (network.clone(), endpoint)
            })
            .collect();
        Some(NetworkingConfig {
            endpoints_config: Some(endpoints),
        })
    }
}

pub fn backup_name(name: &str, now: DateTime<Utc>) -> String {
    format!("{name}-backup-{}", now.format("%Y%m%d%H%M%S%3f"))
}

enum Gate {
    Passed(HealthOutcome),
    Failed(HealthFailure),
    Pending,
}

fn health_gate(details: &ContainerInspectResponse) -> Gate {
    let Some(state) = details.state.as_ref() else {
        return Gate::Pending;
    };
    match state.health.as_ref().and_then(|health| health.status.as_ref()) {
        Some(HealthStatusEnum::HEALTHY) => return Gate::Passed(HealthOutcome::Healthy),
        Some(HealthStatusEnum::UNHEALTHY) => return Gate::Failed(HealthFailure::Unhealthy),
        Some(HealthStatusEnum::STARTING) => return Gate::Pending,
        _ => {}
    }
    if state.running == Some(true) {
        return Gate::Passed(HealthOutcome::NoHealthcheck);
    }
    match state.status {
        Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => {
            let status = state
                .exit_code
                .map(|code| format!("exit code {code}"))
                .unwrap_or_else(|| "unknown".to_string());
            Gate::Failed(HealthFailure::Exited(status))
        }
        _ => Gate::Pending,
    }
}

pub struct RecreationEngine<R: ContainerRuntime> {
    runtime: Arc<R>,
    options: RecreateOptions,
}

impl<R: ContainerRuntime> RecreationEngine<R> {
    pub fn new(runtime: Arc<R>, options: RecreateOptions) -> Self {
        Self { runtime, options }
    }

    pub fn options(&self) -> &RecreateOptions {
        &self.options
    }

    /// Recreate `container` from `image`.
    ///
    /// Health gate failures and runtime errors after the original was renamed
    /// end in [`RecreateOutcome::RolledBack`]. Errors before that point leave
    /// the original untouched and are returned.
    pub async fn recreate(
        &self,
        container: &str,
        image: &str,
    ) -> Result<RecreateOutcome, RuntimeError> {
        let details = self.runtime.inspect_container(container).await?;
        let plan = RecreatePlan::from_inspect(details);
        info!("Recreating {} ({}) with {image}", plan.name, plan.id);

        let stopped = plan.running && plan.binds_host_ports();
        if stopped {
            info!("{} binds host ports, stopping it first", plan.name);
            self.stop_quietly(&plan.id).await?;
        }

        let backup = backup_name(&plan.name, Utc::now());
        debug!("rename {} to {backup}", plan.name);
        if let Err(e) = self.runtime.rename_container(&plan.id, &backup).await {
            error!("Failed to rename {} to {backup}: {e}", plan.name);
            if stopped {
                let _ = self
                    .runtime
                    .start_container(&plan.id)
                    .await
                    .inspect_err(|e| error!("Failed to restart {}: {e}", plan.name));
            }
            return Err(e);
        }

        let new_id = match self
            .runtime
            .create_container(&plan.name, plan.create_body(image))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                return Ok(self
                    .roll_back(&plan, &backup, None, image, StepFailure::Create(e))
                    .await);
            }
        };
        debug!("Container created with ID: {new_id}");

        let gate = match self.runtime.start_container(&new_id).await {
            Ok(()) => {
                info!("Container {new_id} started, waiting for it to become healthy");
                self.wait_healthy(&new_id).await
            }
            Err(e) => Err(StepFailure::Start(e)),
        };

        match gate {
            Ok(health) => {
                self.commit(&plan, &backup).await;
                info!("{} now runs {image} ({health})", plan.name);
                Ok(RecreateOutcome::Success {
                    old: plan.id,
                    new: new_id,
                    health,
                })
            }
            Err(failure) => Ok(self
                .roll_back(&plan, &backup, Some(&new_id), image, failure)
                .await),
        }
    }

    async fn wait_healthy(&self, container: &str) -> Result<HealthOutcome, StepFailure> {
        let deadline = Instant::now() + self.options.health_timeout;
        loop {
            let details = self
                .runtime
                .inspect_container(container)
                .await
                .map_err(StepFailure::Inspect)?;
            match health_gate(&details) {
                Gate::Passed(outcome) => return Ok(outcome),
                Gate::Failed(failure) => return Err(StepFailure::Health(failure)),
                Gate::Pending => {}
            }
            if Instant::now() >= deadline {
                return Err(StepFailure::Health(HealthFailure::Timeout));
            }
            sleep(self.options.poll_interval).await;
        }
    }

    async fn commit(&self, plan: &RecreatePlan, backup: &str) {
        if let Err(e) = self.stop_quietly(&plan.id).await {
            warn!("Failed to stop backup {backup}: {e}");
        }
        match self.runtime.remove_container(&plan.id, true).await {
            Ok(()) => debug!("backup {backup} removed"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("Failed to remove backup {backup}: {e}"),
        }
    }

    async fn roll_back(
        &self,
        plan: &RecreatePlan,
        backup: &str,
        new_id: Option<&str>,
        image: &str,
        failure: StepFailure,
    ) -> RecreateOutcome {
        warn!(
            "Replacement for {} failed ({failure}), rolling back to previous version",
            plan.name
        );
        if let Some(new_id) = new_id {
            match self.runtime.remove_container(new_id, true).await {
                Ok(()) => debug!("removed failed container {new_id}"),
                Err(e) if e.is_not_found() => {}
                Err(e) => error!("Failed to remove failed container {new_id}: {e}"),
            }
        }
        if let Err(e) = self.runtime.rename_container(&plan.id, &plan.name).await {
            error!("Failed to rename {backup} back to {}: {e}", plan.name);
        }
        match self.runtime.start_container(&plan.id).await {
            Ok(()) => info!("Rollback complete, {} restarted", plan.name),
            Err(e) if e.is_idempotent_noop() => {
                info!("Rollback complete, {} still running", plan.name)
            }
            Err(e) => error!("Failed to restart {} after rollback: {e}", plan.name),
        }
        RecreateOutcome::RolledBack {
            old: plan.id.clone(),
            attempted_image: image.to_string(),
            error: failure.to_string(),
        }
    }

    async fn stop_quietly(&self, container: &str) -> Result<(), RuntimeError> {
        match self
            .runtime
            .stop_container(container, self.options.stop_timeout)
            .await
        {
            Err(e) if e.is_idempotent_noop() => {
                debug!("{container} already stopped");
                Ok(())
            }
            other => other,
        }
    }
}
