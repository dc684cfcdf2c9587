pub mod models;
pub mod ports;

pub use models::{
    EnqueueItem, EnqueueOutcome, JobFilter, JobId, JobPage, JobStatus, QueuedJob, SkipReason,
    SkippedItem, UpdateJob,
};
pub use ports::JobRepository;
