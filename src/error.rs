use crate::runtime::RuntimeError;
use crate::scheduler::SchedulerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("invalid stored value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum SentinelError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}
