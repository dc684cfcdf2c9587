use crate::error::StoreError;
use crate::jobs::models::{EnqueueItem, EnqueueOutcome, JobFilter, JobId, JobPage, UpdateJob};
use std::time::Duration;

// A job repository is the single source of truth for update jobs
pub trait JobRepository: Send + Sync + 'static {
    /// Insert a queued job per item unless the container already has a
    /// queued or running one.
    fn enqueue_many(
        &self,
        items: &[EnqueueItem],
    ) -> impl Future<Output = Result<EnqueueOutcome, StoreError>> + Send;

    /// Conditionally move one queued job to running. `false` means somebody
    /// else got there first.
    fn try_claim(
        &self,
        id: &JobId,
        worker: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn claim_next_queued(
        &self,
        worker: &str,
    ) -> impl Future<Output = Result<Option<UpdateJob>, StoreError>> + Send;

    fn mark_success(
        &self,
        id: &JobId,
        result: &serde_json::Value,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn mark_failed(
        &self,
        id: &JobId,
        message: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Requeue running jobs whose lock is older than `stale_after`.
    fn reset_stale_running(
        &self,
        stale_after: Duration,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    fn list_jobs(
        &self,
        filter: &JobFilter,
    ) -> impl Future<Output = Result<JobPage, StoreError>> + Send;

    fn get_job(
        &self,
        id: &JobId,
    ) -> impl Future<Output = Result<Option<UpdateJob>, StoreError>> + Send;
}
