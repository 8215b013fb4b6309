//! Durable job store.
//!
//! The store owns the canonical job state; the broker is a disposable
//! delivery mechanism that can be rebuilt from these rows at any time.
//! Both workers and the recovery sweep write here, always keyed by job id.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::job::{Job, JobStatus};

/// Outcome of an insert that may collide on an idempotency key.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(Job),
    /// A job with the same idempotency key already exists.
    DuplicateKey(Job),
}

/// Storage operations for durable jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job row.
    ///
    /// Respects the idempotency-key uniqueness constraint: a conflicting
    /// insert returns the existing job instead of creating a duplicate.
    async fn insert(&self, job: Job) -> Result<InsertOutcome>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>>;

    /// Claim a job for execution: transition a claimable row to
    /// `Processing`, increment attempts, and stamp `started_at`.
    ///
    /// Returns `None` if the row is missing, already processing, or
    /// terminal, which makes duplicate broker deliveries harmless.
    async fn mark_processing(&self, id: Uuid) -> Result<Option<Job>>;

    async fn mark_completed(&self, id: Uuid, result: serde_json::Value) -> Result<()>;

    /// Record a failed attempt. Transitions to `Dead` when attempts are
    /// exhausted, `Failed` otherwise. Returns the updated row.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<Job>;

    /// Pending jobs whose delivery is overdue: created (or scheduled)
    /// before `cutoff` and never picked up.
    async fn stale_pending(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;

    /// Processing jobs whose worker is presumed crashed: started before
    /// `cutoff` and never finished.
    async fn stale_processing(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;
}

const JOB_COLUMNS: &str = r#"
    id, job_type, queue, payload, status, attempts, max_attempts, priority,
    scheduled_at, tenant_id, user_id, idempotency_key, result, error,
    created_at, started_at, completed_at, failed_at
"#;

/// Postgres-backed job store.
pub struct PostgresJobStore {
    db: PgPool,
}

impl PostgresJobStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: Job) -> Result<InsertOutcome> {
        let inserted = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO jobs (
                id, job_type, queue, payload, status, attempts, max_attempts, priority,
                scheduled_at, tenant_id, user_id, idempotency_key, result, error,
                created_at, started_at, completed_at, failed_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8,
                $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18
            )
            ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.queue)
        .bind(&job.payload)
        .bind(job.status)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.priority)
        .bind(job.scheduled_at)
        .bind(job.tenant_id)
        .bind(job.user_id)
        .bind(&job.idempotency_key)
        .bind(&job.result)
        .bind(&job.error)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.failed_at)
        .fetch_optional(&self.db)
        .await?;

        if let Some(row) = inserted {
            return Ok(InsertOutcome::Inserted(row));
        }

        // Insert was skipped by the conflict clause; surface the winner.
        let key = job
            .idempotency_key
            .as_deref()
            .ok_or_else(|| anyhow!("job insert returned no row without an idempotency key"))?;
        let existing = self
            .find_by_idempotency_key(key)
            .await?
            .ok_or_else(|| anyhow!("conflicting job for idempotency key {key} not found"))?;

        Ok(InsertOutcome::DuplicateKey(existing))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(job)
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE idempotency_key = $1 LIMIT 1"
        ))
        .bind(key)
        .fetch_optional(&self.db)
        .await?;

        Ok(job)
    }

    async fn mark_processing(&self, id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'processing',
                attempts = attempts + 1,
                started_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'failed')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(job)
    }

    async fn mark_completed(&self, id: Uuid, result: serde_json::Value) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                completed_at = NOW(),
                error = NULL,
                result = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(result)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = CASE
                    WHEN attempts >= max_attempts THEN 'dead'::job_status
                    ELSE 'failed'::job_status
                END,
                error = $2,
                failed_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(error)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| anyhow!("job {id} not found"))?;

        Ok(job)
    }

    async fn stale_pending(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'pending'
              AND COALESCE(scheduled_at, created_at) < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(jobs)
    }

    async fn stale_processing(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'processing'
              AND started_at < $1
            ORDER BY started_at ASC
            LIMIT $2
            "#
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(jobs)
    }
}

/// Shared helper applying the failure transition used by both store
/// implementations: `Dead` once attempts are exhausted, `Failed` otherwise.
pub(crate) fn apply_failure(job: &mut Job, error: &str, now: DateTime<Utc>) {
    job.status = if job.attempts >= job.max_attempts {
        JobStatus::Dead
    } else {
        JobStatus::Failed
    };
    job.error = Some(error.to_string());
    job.failed_at = Some(now);
}
