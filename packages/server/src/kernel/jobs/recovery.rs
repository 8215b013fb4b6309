//! Recovery sweep: reconciles durable job rows against the broker.
//!
//! Two divergences are repaired on every pass:
//!
//! - `Pending` rows past the grace window have no live broker message
//!   (the broker was unreachable at enqueue time, or the job's scheduled
//!   delivery time has arrived). They are re-published keyed by job id,
//!   so the broker's dedup window absorbs any message that was in fact
//!   delivered.
//! - `Processing` rows past the stale threshold belong to a crashed
//!   worker. They are transitioned to `Failed` (or `Dead` when attempts
//!   are exhausted) so the normal retry path can pick them up.
//!
//! Without this component a broker outage at enqueue time would silently
//! lose work forever; this is what makes the dual write durable.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::kernel::broker::BrokerPublisher;

use super::job::JobStatus;
use super::queue::JobMessage;
use super::queues::QueueRegistry;
use super::store::JobStore;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How long a pending job may sit before it is considered unpublished.
    pub pending_grace: chrono::Duration,
    /// How long a processing job may run before its worker is presumed dead.
    pub stale_after: chrono::Duration,
    pub pending_batch: i64,
    pub stale_batch: i64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            pending_grace: chrono::Duration::minutes(5),
            stale_after: chrono::Duration::minutes(30),
            pending_batch: 100,
            stale_batch: 50,
        }
    }
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub marked_stale: usize,
}

pub struct RecoverySweep {
    store: Arc<dyn JobStore>,
    publisher: Arc<dyn BrokerPublisher>,
    queues: Arc<QueueRegistry>,
    config: SweepConfig,
}

impl RecoverySweep {
    pub fn new(
        store: Arc<dyn JobStore>,
        publisher: Arc<dyn BrokerPublisher>,
        queues: Arc<QueueRegistry>,
    ) -> Self {
        Self {
            store,
            publisher,
            queues,
            config: SweepConfig::default(),
        }
    }

    pub fn with_config(
        store: Arc<dyn JobStore>,
        publisher: Arc<dyn BrokerPublisher>,
        queues: Arc<QueueRegistry>,
        config: SweepConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            queues,
            config,
        }
    }

    /// Run one reconciliation pass.
    pub async fn run(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let now = Utc::now();

        let pending = self
            .store
            .stale_pending(now - self.config.pending_grace, self.config.pending_batch)
            .await?;

        for job in pending {
            let handle = self.queues.get(&job.queue);
            let message = JobMessage::for_job(&job).to_bytes()?;
            match self
                .publisher
                .publish(&handle.subject(), &job.id.to_string(), message)
                .await
            {
                Ok(()) => report.requeued += 1,
                Err(e) => {
                    // Broker still down; the row stays pending and the next
                    // pass retries.
                    warn!(job_id = %job.id, queue = %job.queue, error = %e, "failed to re-publish job");
                }
            }
        }

        let stale_error = format!(
            "marked stale by recovery sweep: exceeded {} min processing time",
            self.config.stale_after.num_minutes()
        );
        let stale = self
            .store
            .stale_processing(now - self.config.stale_after, self.config.stale_batch)
            .await?;

        for job in stale {
            match self.store.mark_failed(job.id, &stale_error).await {
                Ok(updated) => {
                    report.marked_stale += 1;
                    if updated.status == JobStatus::Dead {
                        error!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            attempts = updated.attempts,
                            "stale job dead lettered"
                        );
                    }
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "failed to mark stale job");
                }
            }
        }

        Ok(report)
    }
}

/// Run the sweep on a fixed interval until shutdown.
///
/// The sweep deliberately runs on its own timer rather than riding the
/// queue it repairs: it must keep running while the broker is down.
pub fn spawn_periodic(
    sweep: Arc<RecoverySweep>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // The first tick fires immediately; skip it.

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match sweep.run().await {
                        Ok(report) => {
                            if report.requeued > 0 || report.marked_stale > 0 {
                                info!(
                                    requeued = report.requeued,
                                    marked_stale = report.marked_stale,
                                    "recovery sweep repaired jobs"
                                );
                            }
                        }
                        Err(e) => error!(error = %e, "recovery sweep failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::broker::TestBroker;
    use crate::kernel::jobs::testing::MemoryJobStore;
    use crate::kernel::jobs::{Job, EMAIL_QUEUE};

    fn sweep_with(
        store: Arc<MemoryJobStore>,
        broker: Arc<TestBroker>,
    ) -> RecoverySweep {
        RecoverySweep::new(store, broker, Arc::new(QueueRegistry::standard()))
    }

    fn aged_pending_job(minutes_old: i64) -> Job {
        let mut job = Job::builder()
            .job_type("EMAIL")
            .queue(EMAIL_QUEUE)
            .payload(serde_json::json!({"to": "parent@example.com"}))
            .build();
        job.created_at = Utc::now() - chrono::Duration::minutes(minutes_old);
        job
    }

    #[tokio::test]
    async fn republishes_pending_jobs_past_the_grace_window() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(TestBroker::new());

        let overdue = aged_pending_job(10);
        let overdue_id = overdue.id;
        store.insert_raw(overdue);
        store.insert_raw(aged_pending_job(1)); // still within grace

        let report = sweep_with(store, broker.clone()).run().await.unwrap();

        assert_eq!(report, SweepReport { requeued: 1, marked_stale: 0 });
        let published = broker.messages_for_subject("jobs.email");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].msg_id, overdue_id.to_string());
    }

    #[tokio::test]
    async fn stale_processing_job_becomes_failed_when_attempts_remain() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(TestBroker::new());

        let mut job = aged_pending_job(40);
        job.status = JobStatus::Processing;
        job.attempts = 1;
        job.started_at = Some(Utc::now() - chrono::Duration::minutes(31));
        let id = job.id;
        store.insert_raw(job);

        let report = sweep_with(store.clone(), broker).run().await.unwrap();

        assert_eq!(report.marked_stale, 1);
        let stored = store.get(id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored
            .error
            .as_deref()
            .unwrap()
            .contains("marked stale by recovery sweep"));
    }

    #[tokio::test]
    async fn stale_processing_job_becomes_dead_when_attempts_exhausted() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(TestBroker::new());

        let mut job = aged_pending_job(40);
        job.status = JobStatus::Processing;
        job.attempts = 3;
        job.max_attempts = 3;
        job.started_at = Some(Utc::now() - chrono::Duration::minutes(31));
        let id = job.id;
        store.insert_raw(job);

        let report = sweep_with(store.clone(), broker).run().await.unwrap();

        assert_eq!(report.marked_stale, 1);
        assert_eq!(store.get(id).unwrap().status, JobStatus::Dead);
    }

    #[tokio::test]
    async fn recent_processing_jobs_are_left_alone() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(TestBroker::new());

        let mut job = aged_pending_job(1);
        job.status = JobStatus::Processing;
        job.started_at = Some(Utc::now() - chrono::Duration::minutes(5));
        let id = job.id;
        store.insert_raw(job);

        let report = sweep_with(store.clone(), broker).run().await.unwrap();

        assert_eq!(report, SweepReport::default());
        assert_eq!(store.get(id).unwrap().status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn future_scheduled_jobs_are_published_once_due() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(TestBroker::new());

        // Created long ago but scheduled for later still: not due.
        let mut waiting = aged_pending_job(60);
        waiting.scheduled_at = Some(Utc::now() + chrono::Duration::minutes(30));
        store.insert_raw(waiting);

        // Scheduled time has passed: due for publication.
        let mut due = aged_pending_job(60);
        due.scheduled_at = Some(Utc::now() - chrono::Duration::minutes(6));
        let due_id = due.id;
        store.insert_raw(due);

        let report = sweep_with(store, broker.clone()).run().await.unwrap();

        assert_eq!(report.requeued, 1);
        assert_eq!(
            broker.messages_for_subject("jobs.email")[0].msg_id,
            due_id.to_string()
        );
    }

    #[tokio::test]
    async fn broker_outage_during_sweep_leaves_jobs_pending() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(TestBroker::new());
        broker.set_failing(true);

        let job = aged_pending_job(10);
        let id = job.id;
        store.insert_raw(job);

        let sweep = sweep_with(store.clone(), broker.clone());
        let report = sweep.run().await.unwrap();
        assert_eq!(report.requeued, 0);
        assert_eq!(store.get(id).unwrap().status, JobStatus::Pending);

        // Broker comes back; the next pass repairs the job.
        broker.set_failing(false);
        let report = sweep.run().await.unwrap();
        assert_eq!(report.requeued, 1);
    }
}
