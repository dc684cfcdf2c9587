use crate::error::StoreError;
use crate::jobs::models::{
    EnqueueItem, EnqueueOutcome, JobFilter, JobId, JobPage, JobStatus, QueuedJob, SkipReason,
    SkippedItem, UpdateJob,
};
use crate::jobs::ports::JobRepository;
use crate::scheduler::models::SchedulerConfig;
use crate::scheduler::ports::SchedulerConfigRepository;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use log::{debug, info, warn};
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, SqlitePool};
use std::time::Duration;

/// How often a claim is retried after losing the race for a job.
pub const CLAIM_ATTEMPTS: u32 = 5;

pub const STALE_RESET_MARKER: &str = "reset_stale_running";

const JOB_COLUMNS: &str = "id, status, container_name, image, force_update, pull_image, \
     created_at, started_at, finished_at, locked_at, locked_by, result, error";

#[derive(Debug, Clone)]
pub struct Sqlite {
    pool: SqlitePool,
    claim_attempts: u32,
}

impl Sqlite {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        info!("Connecting to database: {database_url}");
        if !sqlx::Sqlite::database_exists(database_url).await? {
            sqlx::Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePool::connect(database_url).await?;

        Ok(Self {
            pool,
            claim_attempts: CLAIM_ATTEMPTS,
        })
    }

    pub fn with_claim_attempts(mut self, attempts: u32) -> Self {
        self.claim_attempts = attempts.max(1);
        self
    }

    /// Run embedded database migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("Running database migrations");
        sqlx::migrate!().run(&self.pool).await?;
        Ok(())
    }

    async fn oldest_queued(&self) -> Result<Option<JobId>, StoreError> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT id FROM update_jobs
             WHERE status = 'queued' AND locked_by IS NULL
             ORDER BY created_at ASC, rowid ASC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(id.map(JobId))
    }

    async fn finish(
        &self,
        id: &JobId,
        status: JobStatus,
        result: Option<String>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let outcome = sqlx::query(
            "UPDATE update_jobs
             SET status = ?, finished_at = ?, locked_at = NULL, locked_by = NULL,
                 result = ?, error = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(db_time(Utc::now()))
        .bind(result)
        .bind(error)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        if outcome.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(id.to_string()));
        }
        Ok(())
    }
}

impl JobRepository for Sqlite {
    async fn enqueue_many(&self, items: &[EnqueueItem]) -> Result<EnqueueOutcome, StoreError> {
        let mut outcome = EnqueueOutcome::default();
        let mut tx = self.pool.begin().await?;
        for item in items {
            let id = JobId::generate();
            // the partial unique index rejects a second active job per container
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO update_jobs
                    (id, status, container_name, image, force_update, pull_image, created_at)
                 VALUES (?, 'queued', ?, ?, ?, ?, ?)",
            )
            .bind(id.as_str())
            .bind(item.container.as_str())
            .bind(item.image.as_deref())
            .bind(item.force)
            .bind(item.pull)
            .bind(db_time(Utc::now()))
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() == 0 {
                debug!("{} already has an active job", item.container);
                outcome.skipped.push(SkippedItem {
                    container: item.container.clone(),
                    reason: SkipReason::AlreadyQueued,
                });
            } else {
                info!("queued job {id} for {}", item.container);
                outcome.queued.push(QueuedJob {
                    id,
                    container: item.container.clone(),
                });
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn try_claim(&self, id: &JobId, worker: &str) -> Result<bool, StoreError> {
        let now = db_time(Utc::now());
        let claimed = sqlx::query(
            "UPDATE update_jobs
             SET status = 'running', locked_at = ?, locked_by = ?, started_at = ?
             WHERE id = ? AND status = 'queued' AND locked_by IS NULL",
        )
        .bind(&now)
        .bind(worker)
        .bind(&now)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(claimed.rows_affected() == 1)
    }

    async fn claim_next_queued(&self, worker: &str) -> Result<Option<UpdateJob>, StoreError> {
        for attempt in 1..=self.claim_attempts {
            let Some(id) = self.oldest_queued().await? else {
                return Ok(None);
            };
            if self.try_claim(&id, worker).await? {
                debug!("{worker} claimed job {id}");
                return self.get_job(&id).await;
            }
            debug!("lost claim on job {id} (attempt {attempt}/{})", self.claim_attempts);
        }
        warn!(
            "{worker} gave up claiming after {} contended attempts",
            self.claim_attempts
        );
        Ok(None)
    }

    async fn mark_success(&self, id: &JobId, result: &serde_json::Value) -> Result<(), StoreError> {
        let result = serde_json::to_string(result).map_err(|e| StoreError::InvalidValue {
            field: "result",
            value: e.to_string(),
        })?;
        self.finish(id, JobStatus::Success, Some(result), None).await
    }

    async fn mark_failed(&self, id: &JobId, message: &str) -> Result<(), StoreError> {
        self.finish(id, JobStatus::Failed, None, Some(message)).await
    }

    async fn reset_stale_running(&self, stale_after: Duration) -> Result<u64, StoreError> {
        let cutoff = TimeDelta::from_std(stale_after)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let reset = sqlx::query(
            "UPDATE update_jobs
             SET status = 'queued', locked_at = NULL, locked_by = NULL, started_at = NULL,
                 error = ?
             WHERE status = 'running' AND (locked_at IS NULL OR locked_at < ?)",
        )
        .bind(STALE_RESET_MARKER)
        .bind(db_time(cutoff))
        .execute(&self.pool)
        .await?;
        let count = reset.rows_affected();
        if count > 0 {
            warn!("requeued {count} stale running jobs");
        }
        Ok(count)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage, StoreError> {
        let limit = filter.limit();
        let offset = filter.offset();

        let mut count = QueryBuilder::new("SELECT COUNT(*) FROM update_jobs");
        push_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM update_jobs"));
        push_filter(&mut select, filter);
        select
            .push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(i64::from(offset));
        let rows = select.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JobPage {
            items,
            total,
            limit,
            offset,
        })
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<UpdateJob>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM update_jobs WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }
}

impl SchedulerConfigRepository for Sqlite {
    async fn get_scheduler_config(&self) -> Result<SchedulerConfig, StoreError> {
        let defaults = SchedulerConfig::default();
        sqlx::query(
            "INSERT OR IGNORE INTO scheduler_config
                (id, enabled, cron_expr, mode, scope, scan_label_key, update_label_key,
                 created_at, updated_at)
             VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(defaults.enabled)
        .bind(&defaults.cron_expr)
        .bind(defaults.mode.as_str())
        .bind(defaults.scope.as_str())
        .bind(&defaults.scan_label_key)
        .bind(&defaults.update_label_key)
        .bind(db_time(defaults.created_at))
        .bind(db_time(defaults.updated_at))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT enabled, cron_expr, mode, scope, scan_label_key, update_label_key,
                    created_at, updated_at, last_run_at
             FROM scheduler_config WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(SchedulerConfig {
            enabled: row.try_get("enabled")?,
            cron_expr: row.try_get("cron_expr")?,
            mode: row.try_get::<String, _>("mode")?.parse()?,
            scope: row.try_get::<String, _>("scope")?.parse()?,
            scan_label_key: row.try_get("scan_label_key")?,
            update_label_key: row.try_get("update_label_key")?,
            created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
            updated_at: parse_time(&row.try_get::<String, _>("updated_at")?)?,
            last_run_at: optional_time(row.try_get("last_run_at")?)?,
        })
    }

    async fn save_scheduler_config(&self, config: &SchedulerConfig) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO scheduler_config
                (id, enabled, cron_expr, mode, scope, scan_label_key, update_label_key,
                 created_at, updated_at, last_run_at)
             VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                enabled = excluded.enabled,
                cron_expr = excluded.cron_expr,
                mode = excluded.mode,
                scope = excluded.scope,
                scan_label_key = excluded.scan_label_key,
                update_label_key = excluded.update_label_key,
                updated_at = excluded.updated_at",
        )
        .bind(config.enabled)
        .bind(&config.cron_expr)
        .bind(config.mode.as_str())
        .bind(config.scope.as_str())
        .bind(&config.scan_label_key)
        .bind(&config.update_label_key)
        .bind(db_time(config.created_at))
        .bind(db_time(config.updated_at))
        .bind(config.last_run_at.map(db_time))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_scheduler_run(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE scheduler_config SET last_run_at = ? WHERE id = 1")
            .bind(db_time(at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn push_filter<'a>(builder: &mut QueryBuilder<'a, sqlx::Sqlite>, filter: &'a JobFilter) {
    let mut separator = " WHERE ";
    if let Some(status) = filter.status {
        builder
            .push(separator)
            .push("status = ")
            .push_bind(status.as_str());
        separator = " AND ";
    }
    if let Some(container) = &filter.container {
        builder
            .push(separator)
            .push("container_name = ")
            .push_bind(container.as_str());
    }
}

fn job_from_row(row: &SqliteRow) -> Result<UpdateJob, StoreError> {
    let result = row
        .try_get::<Option<String>, _>("result")?
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|_| StoreError::InvalidValue {
                field: "result",
                value: raw,
            })
        })
        .transpose()?;

    Ok(UpdateJob {
        id: JobId(row.try_get("id")?),
        status: row.try_get::<String, _>("status")?.parse()?,
        container: row.try_get("container_name")?,
        image: row.try_get("image")?,
        force: row.try_get("force_update")?,
        pull: row.try_get("pull_image")?,
        created_at: parse_time(&row.try_get::<String, _>("created_at")?)?,
        started_at: optional_time(row.try_get("started_at")?)?,
        finished_at: optional_time(row.try_get("finished_at")?)?,
        locked_at: optional_time(row.try_get("locked_at")?)?,
        locked_by: row.try_get("locked_by")?,
        result,
        error: row.try_get("error")?,
    })
}

/// Fixed width UTC text, so comparing the column as text orders by time.
fn db_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidValue {
            field: "timestamp",
            value: raw.to_string(),
        })
}

fn optional_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.as_deref().map(parse_time).transpose()
}
