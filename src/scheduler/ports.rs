use crate::error::StoreError;
use crate::scheduler::models::SchedulerConfig;
use chrono::{DateTime, Utc};

// Holds the singleton scheduler configuration
pub trait SchedulerConfigRepository: Send + Sync + 'static {
    /// The stored configuration, created with defaults when missing.
    fn get_scheduler_config(
        &self,
    ) -> impl Future<Output = Result<SchedulerConfig, StoreError>> + Send;

    fn save_scheduler_config(
        &self,
        config: &SchedulerConfig,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn record_scheduler_run(
        &self,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
