use crate::config::DatabaseConfig;
use crate::job::{CompletedAttempt, Job, JobId, MigrationMarker, NewJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Inconsistent record state: {0}")]
    Inconsistent(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

trait DbContext<T> {
    fn db_context(self, context: &'static str) -> StoreResult<T>;
}

impl<T> DbContext<T> for Result<T, sqlx::Error> {
    fn db_context(self, context: &'static str) -> StoreResult<T> {
        self.map_err(|source| StoreError::Database { context, source })
    }
}

/// Durable job table.
///
/// Every state transition is a single conditional write, so the table itself
/// serializes concurrent callers across processes. A `None`/`false` result
/// means the guard did not match and nothing changed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a record unless one exists; either way return the stored row
    async fn insert_if_absent(&self, job: &NewJob) -> StoreResult<Job>;

    /// Insert a record; `None` when the id is already taken
    async fn try_insert(&self, job: &NewJob) -> StoreResult<Option<Job>>;

    /// Delete a record that no attempt has ever claimed
    async fn remove_unclaimed(&self, job_id: &JobId) -> StoreResult<bool>;

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<Job>>;

    /// Jobs owned by `owner_id`, newest first
    async fn list_by_owner(&self, owner_id: &str, limit: i64) -> StoreResult<Vec<Job>>;

    /// Claim the job for a new attempt. Succeeds from `created` or `failed`,
    /// or from `processing` when the holder started before `stale_before`.
    async fn begin_attempt(
        &self,
        job_id: &JobId,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<Option<Job>>;

    /// Commit both refs, only while `attempt` still holds the job
    async fn complete_attempt(
        &self,
        job_id: &JobId,
        attempt: i32,
        refs: &CompletedAttempt,
    ) -> StoreResult<Option<Job>>;

    /// Mark the attempt failed, only while `attempt` still holds the job
    async fn fail_attempt(&self, job_id: &JobId, attempt: i32, message: &str)
        -> StoreResult<bool>;

    /// Record a pending charge intent on an unpurchased job
    async fn record_charge_intent(
        &self,
        job_id: &JobId,
        intent_id: &str,
        amount: i64,
    ) -> StoreResult<bool>;

    /// Flip `purchased` false -> true; `None` when it was already true or the job is missing
    async fn mark_purchased(
        &self,
        job_id: &JobId,
        intent_id: &str,
        amount: i64,
    ) -> StoreResult<Option<Job>>;

    /// Move a pending intent back to unpurchased
    async fn mark_charge_failed(&self, job_id: &JobId, intent_id: &str) -> StoreResult<bool>;

    /// Current owner of each job that exists
    async fn owners_of(&self, job_ids: &[JobId]) -> StoreResult<Vec<(JobId, Option<String>)>>;

    /// Assign `owner_id` to the listed jobs that have no owner; returns the ids changed
    async fn claim_unowned(&self, job_ids: &[JobId], owner_id: &str) -> StoreResult<Vec<JobId>>;

    /// Move every job owned by `from_owner` to `to_owner`
    async fn reassign_owner(&self, from_owner: &str, to_owner: &str) -> StoreResult<u64>;

    async fn put_marker(&self, from_owner: &str, to_owner: &str) -> StoreResult<MigrationMarker>;

    async fn pending_markers(&self, to_owner: &str) -> StoreResult<Vec<MigrationMarker>>;

    async fn clear_marker(&self, marker: &MigrationMarker) -> StoreResult<bool>;

    async fn ping(&self) -> StoreResult<()>;
}

const JOB_COLUMNS: &str = "job_id, input_key, input_content_type, output_key, preview_key, \
     owner_id, state, error_message, attempts, processing_started_at, purchased, \
     charge_intent_id, charge_status, charge_amount, purchased_at, created_at, updated_at";

fn id_strings(job_ids: &[JobId]) -> Vec<String> {
    job_ids.iter().map(|id| id.as_str().to_string()).collect()
}

/// Job store for PostgreSQL
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    /// Create a new job store with connection pool
    pub async fn new(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .db_context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> StoreResult<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.job_id))]
    async fn insert_if_absent(&self, job: &NewJob) -> StoreResult<Job> {
        match self.try_insert(job).await? {
            Some(row) => Ok(row),
            // Lost the insert race; converge on the winner's row
            None => self.get(&job.job_id).await?.ok_or_else(|| {
                StoreError::Inconsistent(format!("job {} conflicted but is missing", job.job_id))
            }),
        }
    }

    async fn try_insert(&self, job: &NewJob) -> StoreResult<Option<Job>> {
        let inserted = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO jobs (job_id, input_key, input_content_type, owner_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (job_id) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(&job.job_id)
        .bind(&job.input_key)
        .bind(&job.input_content_type)
        .bind(&job.owner_id)
        .fetch_optional(&self.pool)
        .await
        .db_context("Failed to insert job")?;

        if inserted.is_some() {
            debug!(job_id = %job.job_id, "Job registered");
        }
        Ok(inserted)
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn remove_unclaimed(&self, job_id: &JobId) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE job_id = $1 AND state = 'created' AND attempts = 0",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .db_context("Failed to remove job")?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .db_context("Failed to query job")
    }

    async fn list_by_owner(&self, owner_id: &str, limit: i64) -> StoreResult<Vec<Job>> {
        sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE owner_id = $1
            ORDER BY created_at DESC, job_id
            LIMIT $2
            "#
        ))
        .bind(owner_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .db_context("Failed to list owner jobs")
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn begin_attempt(
        &self,
        job_id: &JobId,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<Option<Job>> {
        sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET state = 'processing',
                attempts = attempts + 1,
                error_message = NULL,
                processing_started_at = NOW(),
                updated_at = NOW()
            WHERE job_id = $1
              AND output_key IS NULL
              AND (state IN ('created', 'failed')
                   OR (state = 'processing' AND processing_started_at < $2))
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await
        .db_context("Failed to claim job")
    }

    #[instrument(skip(self, refs), fields(job_id = %job_id))]
    async fn complete_attempt(
        &self,
        job_id: &JobId,
        attempt: i32,
        refs: &CompletedAttempt,
    ) -> StoreResult<Option<Job>> {
        sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET state = 'output_ready',
                output_key = $3,
                preview_key = $4,
                error_message = NULL,
                processing_started_at = NULL,
                updated_at = NOW()
            WHERE job_id = $1
              AND attempts = $2
              AND state = 'processing'
              AND output_key IS NULL
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(attempt)
        .bind(&refs.output_key)
        .bind(&refs.preview_key)
        .fetch_optional(&self.pool)
        .await
        .db_context("Failed to complete job")
    }

    #[instrument(skip(self, message), fields(job_id = %job_id))]
    async fn fail_attempt(
        &self,
        job_id: &JobId,
        attempt: i32,
        message: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'failed',
                error_message = $3,
                processing_started_at = NULL,
                updated_at = NOW()
            WHERE job_id = $1 AND attempts = $2 AND state = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(attempt)
        .bind(message)
        .execute(&self.pool)
        .await
        .db_context("Failed to mark job failed")?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn record_charge_intent(
        &self,
        job_id: &JobId,
        intent_id: &str,
        amount: i64,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET charge_intent_id = $2,
                charge_status = 'pending',
                charge_amount = $3,
                updated_at = NOW()
            WHERE job_id = $1 AND purchased = FALSE
            "#,
        )
        .bind(job_id)
        .bind(intent_id)
        .bind(amount)
        .execute(&self.pool)
        .await
        .db_context("Failed to record charge intent")?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn mark_purchased(
        &self,
        job_id: &JobId,
        intent_id: &str,
        amount: i64,
    ) -> StoreResult<Option<Job>> {
        sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET purchased = TRUE,
                charge_intent_id = $2,
                charge_status = 'succeeded',
                charge_amount = $3,
                purchased_at = NOW(),
                updated_at = NOW()
            WHERE job_id = $1 AND purchased = FALSE
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(intent_id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await
        .db_context("Failed to mark job purchased")
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    async fn mark_charge_failed(&self, job_id: &JobId, intent_id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET charge_status = 'failed', updated_at = NOW()
            WHERE job_id = $1
              AND charge_intent_id = $2
              AND charge_status = 'pending'
              AND purchased = FALSE
            "#,
        )
        .bind(job_id)
        .bind(intent_id)
        .execute(&self.pool)
        .await
        .db_context("Failed to mark charge failed")?;

        Ok(result.rows_affected() == 1)
    }

    async fn owners_of(&self, job_ids: &[JobId]) -> StoreResult<Vec<(JobId, Option<String>)>> {
        sqlx::query_as::<_, (JobId, Option<String>)>(
            "SELECT job_id, owner_id FROM jobs WHERE job_id = ANY($1)",
        )
        .bind(id_strings(job_ids))
        .fetch_all(&self.pool)
        .await
        .db_context("Failed to query job owners")
    }

    #[instrument(skip(self, job_ids), fields(count = job_ids.len()))]
    async fn claim_unowned(&self, job_ids: &[JobId], owner_id: &str) -> StoreResult<Vec<JobId>> {
        sqlx::query_scalar::<_, JobId>(
            r#"
            UPDATE jobs
            SET owner_id = $1, updated_at = NOW()
            WHERE job_id = ANY($2) AND owner_id IS NULL
            RETURNING job_id
            "#,
        )
        .bind(owner_id)
        .bind(id_strings(job_ids))
        .fetch_all(&self.pool)
        .await
        .db_context("Failed to claim unowned jobs")
    }

    #[instrument(skip(self))]
    async fn reassign_owner(&self, from_owner: &str, to_owner: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET owner_id = $2, updated_at = NOW() WHERE owner_id = $1",
        )
        .bind(from_owner)
        .bind(to_owner)
        .execute(&self.pool)
        .await
        .db_context("Failed to reassign job owner")?;

        Ok(result.rows_affected())
    }

    async fn put_marker(&self, from_owner: &str, to_owner: &str) -> StoreResult<MigrationMarker> {
        sqlx::query_as::<_, MigrationMarker>(
            r#"
            INSERT INTO pending_migrations (from_owner, to_owner, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (from_owner)
            DO UPDATE SET to_owner = EXCLUDED.to_owner, created_at = EXCLUDED.created_at
            RETURNING from_owner, to_owner, created_at
            "#,
        )
        .bind(from_owner)
        .bind(to_owner)
        .fetch_one(&self.pool)
        .await
        .db_context("Failed to record pending migration")
    }

    async fn pending_markers(&self, to_owner: &str) -> StoreResult<Vec<MigrationMarker>> {
        sqlx::query_as::<_, MigrationMarker>(
            r#"
            SELECT from_owner, to_owner, created_at
            FROM pending_migrations
            WHERE to_owner = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(to_owner)
        .fetch_all(&self.pool)
        .await
        .db_context("Failed to query pending migrations")
    }

    async fn clear_marker(&self, marker: &MigrationMarker) -> StoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM pending_migrations WHERE from_owner = $1 AND to_owner = $2",
        )
        .bind(&marker.from_owner)
        .bind(&marker.to_owner)
        .execute(&self.pool)
        .await
        .db_context("Failed to clear pending migration")?;

        Ok(result.rows_affected() == 1)
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .db_context("Database ping failed")?;
        Ok(())
    }
}
