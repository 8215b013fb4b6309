//! Test doubles for the job subsystem.
//!
//! `MemoryJobStore` mirrors the Postgres store's transition rules so bus,
//! worker, and recovery tests run without a database. Ack recording
//! utilities let tests assert how a worker settled each broker delivery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::kernel::broker::{Acker, Delivery};

use super::job::{Job, JobStatus};
use super::queue::JobMessage;
use super::store::{apply_failure, InsertOutcome, JobStore};

/// In-memory job store for tests.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored jobs, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> Vec<Job> {
        self.jobs()
            .into_iter()
            .filter(|j| j.status == status)
            .collect()
    }

    /// Insert a row as-is, bypassing transition rules. For test setup only,
    /// e.g. forcing a `Processing` job with an old `started_at`.
    pub fn insert_raw(&self, job: Job) {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<InsertOutcome> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());

        if let Some(key) = &job.idempotency_key {
            if let Some(existing) = jobs
                .values()
                .find(|j| j.idempotency_key.as_deref() == Some(key.as_str()))
            {
                return Ok(InsertOutcome::DuplicateKey(existing.clone()));
            }
        }

        jobs.insert(job.id, job.clone());
        Ok(InsertOutcome::Inserted(job))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.get(id))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|j| j.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn mark_processing(&self, id: Uuid) -> Result<Option<Job>> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !job.status.is_claimable() {
            return Ok(None);
        }

        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.started_at = Some(Utc::now());
        Ok(Some(job.clone()))
    }

    async fn mark_completed(&self, id: Uuid, result: serde_json::Value) -> Result<()> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("job {id} not found"))?;

        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.error = None;
        job.result = Some(result);
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<Job> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("job {id} not found"))?;

        apply_failure(job, error, Utc::now());
        Ok(job.clone())
    }

    async fn stale_pending(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let mut stale: Vec<Job> = self
            .jobs()
            .into_iter()
            .filter(|j| {
                j.status == JobStatus::Pending
                    && j.scheduled_at.unwrap_or(j.created_at) < cutoff
            })
            .collect();
        stale.truncate(limit as usize);
        Ok(stale)
    }

    async fn stale_processing(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let mut stale: Vec<Job> = self
            .jobs()
            .into_iter()
            .filter(|j| {
                j.status == JobStatus::Processing
                    && j.started_at.is_some_and(|at| at < cutoff)
            })
            .collect();
        stale.truncate(limit as usize);
        Ok(stale)
    }
}

// ============================================================================
// Ack recording
// ============================================================================

/// How a worker settled a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    Naked(Option<Duration>),
    Terminated,
}

/// Shared log of settlement outcomes, one entry per settled delivery.
pub type AckLog = Arc<Mutex<Vec<AckOutcome>>>;

pub fn ack_log() -> AckLog {
    Arc::new(Mutex::new(Vec::new()))
}

struct RecordingAcker {
    log: AckLog,
}

#[async_trait]
impl Acker for RecordingAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(AckOutcome::Acked);
        Ok(())
    }

    async fn nak(self: Box<Self>, delay: Option<Duration>) -> Result<()> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(AckOutcome::Naked(delay));
        Ok(())
    }

    async fn term(self: Box<Self>) -> Result<()> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(AckOutcome::Terminated);
        Ok(())
    }
}

/// Build a delivery carrying a job's broker message, recording its
/// settlement into `log`.
pub fn delivery_for(job: &Job, delivered: i64, log: &AckLog) -> Delivery {
    let message = JobMessage::for_job(job)
        .to_bytes()
        .unwrap_or_else(|_| bytes::Bytes::new());
    Delivery::new(
        message,
        delivered,
        Box::new(RecordingAcker { log: Arc::clone(log) }),
    )
}

/// Build a delivery with an arbitrary payload, recording its settlement.
pub fn raw_delivery(payload: bytes::Bytes, log: &AckLog) -> Delivery {
    Delivery::new(payload, 1, Box::new(RecordingAcker { log: Arc::clone(log) }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_job() -> Job {
        Job::builder()
            .job_type("EMAIL")
            .queue("email")
            .payload(serde_json::json!({}))
            .build()
    }

    #[tokio::test]
    async fn mark_processing_claims_pending_jobs_once() {
        let store = MemoryJobStore::new();
        let job = pending_job();
        let id = job.id;
        store.insert_raw(job);

        let claimed = store.mark_processing(id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.started_at.is_some());

        // A duplicate delivery cannot claim the same row again.
        assert!(store.mark_processing(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_failed_dead_letters_when_attempts_exhausted() {
        let store = MemoryJobStore::new();
        let mut job = pending_job();
        job.max_attempts = 2;
        let id = job.id;
        store.insert_raw(job);

        store.mark_processing(id).await.unwrap();
        let first = store.mark_failed(id, "boom").await.unwrap();
        assert_eq!(first.status, JobStatus::Failed);
        assert!(first.failed_at.is_some());

        store.mark_processing(id).await.unwrap();
        let second = store.mark_failed(id, "boom again").await.unwrap();
        assert_eq!(second.status, JobStatus::Dead);
        assert_eq!(second.attempts, 2);
    }

    #[tokio::test]
    async fn failed_jobs_are_claimable_for_retry() {
        let store = MemoryJobStore::new();
        let job = pending_job();
        let id = job.id;
        store.insert_raw(job);

        store.mark_processing(id).await.unwrap();
        store.mark_failed(id, "transient").await.unwrap();

        let retried = store.mark_processing(id).await.unwrap().unwrap();
        assert_eq!(retried.attempts, 2);
        assert_eq!(retried.status, JobStatus::Processing);
    }
}
