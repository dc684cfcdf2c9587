use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub const DEFAULT_LABEL_KEY: &str = "docksentinel.update";
pub const DEFAULT_SCAN_LABEL_KEY: &str = "docksentinel.scan";
pub const DEFAULT_CRON: &str = "0 3 * * *";

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    ScanOnly,
    ScanAndUpdate,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::ScanOnly => "scan_only",
            ScanMode::ScanAndUpdate => "scan_and_update",
        }
    }
}

impl Display for ScanMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ScanMode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scan_only" => Ok(ScanMode::ScanOnly),
            "scan_and_update" => Ok(ScanMode::ScanAndUpdate),
            other => Err(StoreError::InvalidValue {
                field: "mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Which containers a scheduled scan looks at.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanScope {
    /// Every container not opted out through the scan label.
    All,
    /// Only containers carrying the scan label with an enabling value.
    Labeled,
}

impl ScanScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanScope::All => "all",
            ScanScope::Labeled => "labeled",
        }
    }
}

impl FromStr for ScanScope {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(ScanScope::All),
            "labeled" => Ok(ScanScope::Labeled),
            other => Err(StoreError::InvalidValue {
                field: "scope",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub cron_expr: String,
    pub mode: ScanMode,
    pub scope: ScanScope,
    pub scan_label_key: String,
    pub update_label_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            enabled: false,
            cron_expr: DEFAULT_CRON.to_string(),
            mode: ScanMode::ScanOnly,
            scope: ScanScope::All,
            scan_label_key: DEFAULT_SCAN_LABEL_KEY.to_string(),
            update_label_key: DEFAULT_LABEL_KEY.to_string(),
            created_at: now,
            updated_at: now,
            last_run_at: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct SchedulerConfigPatch {
    pub enabled: Option<bool>,
    pub cron_expr: Option<String>,
    pub mode: Option<ScanMode>,
    pub scope: Option<ScanScope>,
    pub scan_label_key: Option<String>,
    pub update_label_key: Option<String>,
}

impl SchedulerConfig {
    pub fn apply(&mut self, patch: SchedulerConfigPatch) {
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(cron_expr) = patch.cron_expr {
            self.cron_expr = cron_expr.trim().to_string();
        }
        if let Some(mode) = patch.mode {
            self.mode = mode;
        }
        if let Some(scope) = patch.scope {
            self.scope = scope;
        }
        if let Some(key) = patch.scan_label_key {
            self.scan_label_key = key;
        }
        if let Some(key) = patch.update_label_key {
            self.update_label_key = key;
        }
        self.updated_at = Utc::now();
    }
}
