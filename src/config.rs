use crate::recreate::RecreateOptions;
use crate::scheduler::models::DEFAULT_LABEL_KEY;
use crate::service::SentinelOptions;
use figment2::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "docksentinel.toml";
pub const ENV_PREFIX: &str = "DOCKSENTINEL_";

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RecreateSettings {
    pub stop_timeout: i32,
    /// Seconds a new container gets to report healthy.
    pub health_timeout: u64,
    pub poll_interval_ms: u64,
}

impl Default for RecreateSettings {
    fn default() -> Self {
        Self {
            stop_timeout: 10,
            health_timeout: 60,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WorkerSettings {
    /// Seconds after which a running job counts as abandoned.
    pub stale_after: u64,
    pub claim_attempts: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            stale_after: 900,
            claim_attempts: 5,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    pub worker_id: Option<String>,
    pub label_key: String,
    pub docker_gid: Option<u32>,
    pub recreate: RecreateSettings,
    pub worker: WorkerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://docksentinel.db".to_string(),
            worker_id: None,
            label_key: DEFAULT_LABEL_KEY.to_string(),
            docker_gid: None,
            recreate: RecreateSettings::default(),
            worker: WorkerSettings::default(),
        }
    }
}

impl Config {
    pub fn worker_id(&self) -> String {
        self.worker_id.clone().unwrap_or_else(|| {
            let host = std::env::var("HOSTNAME")
                .ok()
                .filter(|host| !host.is_empty())
                .unwrap_or_else(|| std::process::id().to_string());
            format!("docksentinel-{host}")
        })
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.worker.stale_after)
    }

    pub fn recreate_options(&self) -> RecreateOptions {
        RecreateOptions {
            stop_timeout: self.recreate.stop_timeout,
            health_timeout: Duration::from_secs(self.recreate.health_timeout),
            poll_interval: Duration::from_millis(self.recreate.poll_interval_ms),
        }
    }

    pub fn sentinel_options(&self) -> SentinelOptions {
        SentinelOptions {
            worker_id: self.worker_id(),
            label_key: self.label_key.clone(),
            recreate: self.recreate_options(),
        }
    }
}

/// Defaults, then the TOML file if it exists, then `DOCKSENTINEL_*`
/// variables with `__` separating nested keys.
pub fn load_config(config_path: &Path) -> Result<Config, figment2::Error> {
    Figment::new()
        .merge(Toml::file(config_path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
}
