//! Generic per-queue worker harness.
//!
//! One `QueueWorker` runs per queue name. The harness is identical across
//! queues; only the [`JobProcessor`] differs. Per delivery:
//!
//! ```text
//! QueueWorker
//!     │
//!     ├─► parse JobMessage from the broker payload
//!     ├─► mark job Processing (attempts += 1, started_at stamped)
//!     ├─► JobProcessor::process(job)
//!     ├─► success: mark Completed, store result, ack
//!     └─► failure: mark Failed or Dead, then nak (policy backoff) or term
//! ```
//!
//! Failing the job back to the broker hands retry scheduling to the
//! broker's native redelivery; the row transition happens first so the
//! store stays authoritative even if the process dies mid-settlement.
//!
//! Concurrency is bounded per worker, and queues that front rate-limited
//! gateways (SMS, WhatsApp) additionally cap deliveries per time window.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::kernel::broker::{Delivery, QueueConsumer};

use super::job::{Job, JobStatus};
use super::queue::JobMessage;
use super::queues::{QueueHandle, RetryPolicy, SMS_QUEUE, SYSTEM_QUEUE, WHATSAPP_QUEUE};
use super::store::JobStore;

/// Executes the work for one queue's jobs.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Run the job, returning the result payload stored on completion.
    async fn process(&self, job: &Job) -> Result<serde_json::Value>;
}

/// Cap on deliveries per time window.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub max: u32,
    pub per: Duration,
}

/// Configuration for one queue worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub rate: Option<RateLimit>,
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            rate: None,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl WorkerConfig {
    /// Standard settings per queue: outbound gateway queues run narrow and
    /// rate-capped, the system queue runs single-file.
    pub fn for_queue(queue: &str) -> Self {
        match queue {
            SMS_QUEUE | WHATSAPP_QUEUE => Self {
                concurrency: 3,
                rate: Some(RateLimit {
                    max: 5,
                    per: Duration::from_secs(1),
                }),
                ..Default::default()
            },
            SYSTEM_QUEUE => Self {
                concurrency: 1,
                rate: None,
                ..Default::default()
            },
            _ => Self::default(),
        }
    }
}

/// Sliding-window throttle local to one worker instance.
struct Throttle {
    limit: RateLimit,
    state: Mutex<(Instant, u32)>,
}

impl Throttle {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            state: Mutex::new((Instant::now(), 0)),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let (window_start, count) = *state;
                let now = Instant::now();

                if now.duration_since(window_start) >= self.limit.per {
                    *state = (now, 1);
                    return;
                }
                if count < self.limit.max {
                    state.1 = count + 1;
                    return;
                }
                self.limit.per - now.duration_since(window_start)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Long-running worker processing one queue's deliveries.
pub struct QueueWorker {
    queue: QueueHandle,
    store: Arc<dyn JobStore>,
    processor: Arc<dyn JobProcessor>,
    config: WorkerConfig,
}

impl QueueWorker {
    pub fn new(
        queue: QueueHandle,
        store: Arc<dyn JobStore>,
        processor: Arc<dyn JobProcessor>,
    ) -> Self {
        let config = WorkerConfig::for_queue(&queue.name);
        Self {
            queue,
            store,
            processor,
            config,
        }
    }

    pub fn with_config(
        queue: QueueHandle,
        store: Arc<dyn JobStore>,
        processor: Arc<dyn JobProcessor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            processor,
            config,
        }
    }

    /// Run until the consumer closes or shutdown is requested, then wait
    /// for in-flight jobs to settle.
    pub async fn run(
        self,
        mut consumer: Box<dyn QueueConsumer>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!(
            queue = %self.queue.name,
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "queue worker starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let throttle = self.config.rate.map(Throttle::new).map(Arc::new);

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = consumer.next() => match next {
                    Ok(Some(delivery)) => delivery,
                    Ok(None) => break,
                    Err(e) => {
                        error!(queue = %self.queue.name, error = %e, "consumer error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
            };

            if let Some(throttle) = &throttle {
                throttle.acquire().await;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let store = Arc::clone(&self.store);
            let processor = Arc::clone(&self.processor);
            let policy = self.queue.policy;
            let queue_name = self.queue.name.clone();

            tokio::spawn(async move {
                handle_delivery(store, processor, policy, &queue_name, delivery).await;
                drop(permit);
            });
        }

        // Drain: wait until every spawned job has released its permit.
        let _ = semaphore
            .acquire_many(self.config.concurrency as u32)
            .await;

        info!(queue = %self.queue.name, worker_id = %self.config.worker_id, "queue worker stopped");
        Ok(())
    }
}

/// Process one broker delivery through the job lifecycle.
pub async fn handle_delivery(
    store: Arc<dyn JobStore>,
    processor: Arc<dyn JobProcessor>,
    policy: RetryPolicy,
    queue: &str,
    delivery: Delivery,
) {
    let message: JobMessage = match serde_json::from_slice(&delivery.payload) {
        Ok(message) => message,
        Err(e) => {
            warn!(queue, error = %e, "dropping undecodable delivery");
            if let Err(e) = delivery.term().await {
                warn!(queue, error = %e, "failed to terminate poison delivery");
            }
            return;
        }
    };

    let job = match store.mark_processing(message.job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            // Row is terminal or already claimed; this is a duplicate or
            // late delivery and can be settled without work.
            debug!(queue, job_id = %message.job_id, "delivery not claimable, acking");
            if let Err(e) = delivery.ack().await {
                warn!(queue, job_id = %message.job_id, error = %e, "ack failed");
            }
            return;
        }
        Err(e) => {
            error!(queue, job_id = %message.job_id, error = %e, "failed to claim job");
            if let Err(e) = delivery.nak(None).await {
                warn!(queue, job_id = %message.job_id, error = %e, "nak failed");
            }
            return;
        }
    };

    match processor.process(&job).await {
        Ok(result) => {
            debug!(queue, job_id = %job.id, job_type = %job.job_type, "job completed");
            if let Err(e) = store.mark_completed(job.id, result).await {
                error!(queue, job_id = %job.id, error = %e, "failed to mark job completed");
            }
            if let Err(e) = delivery.ack().await {
                warn!(queue, job_id = %job.id, error = %e, "ack failed");
            }
        }
        Err(err) => {
            warn!(
                queue,
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempts,
                error = %err,
                "job failed"
            );

            match store.mark_failed(job.id, &format!("{err:#}")).await {
                Ok(updated) if updated.status == JobStatus::Dead => {
                    error!(
                        queue,
                        job_id = %job.id,
                        job_type = %job.job_type,
                        attempts = updated.attempts,
                        "job dead lettered, retries exhausted"
                    );
                    if let Err(e) = delivery.term().await {
                        warn!(queue, job_id = %job.id, error = %e, "term failed");
                    }
                }
                Ok(updated) => {
                    let delay = policy.backoff.delay_for(updated.attempts);
                    if let Err(e) = delivery.nak(Some(delay)).await {
                        warn!(queue, job_id = %job.id, error = %e, "nak failed");
                    }
                }
                Err(e) => {
                    error!(queue, job_id = %job.id, error = %e, "failed to mark job failed");
                    if let Err(e) = delivery.nak(None).await {
                        warn!(queue, job_id = %job.id, error = %e, "nak failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::broker::TestConsumer;
    use crate::kernel::jobs::queues::{Backoff, QueueRegistry, EMAIL_QUEUE};
    use crate::kernel::jobs::testing::{ack_log, delivery_for, raw_delivery, AckOutcome, MemoryJobStore};
    use anyhow::anyhow;

    struct OkProcessor;

    #[async_trait]
    impl JobProcessor for OkProcessor {
        async fn process(&self, _job: &Job) -> Result<serde_json::Value> {
            Ok(serde_json::json!({"delivered": true}))
        }
    }

    struct FailingProcessor;

    #[async_trait]
    impl JobProcessor for FailingProcessor {
        async fn process(&self, _job: &Job) -> Result<serde_json::Value> {
            Err(anyhow!("gateway timeout"))
        }
    }

    fn pending_email_job(max_attempts: i32) -> Job {
        Job::builder()
            .job_type("EMAIL")
            .queue(EMAIL_QUEUE)
            .payload(serde_json::json!({"to": "parent@example.com"}))
            .max_attempts(max_attempts)
            .build()
    }

    fn email_policy() -> RetryPolicy {
        QueueRegistry::standard().policy_for(EMAIL_QUEUE)
    }

    #[tokio::test]
    async fn successful_delivery_completes_job_and_acks() {
        let store = Arc::new(MemoryJobStore::new());
        let job = pending_email_job(3);
        let id = job.id;
        store.insert_raw(job.clone());

        let log = ack_log();
        handle_delivery(
            store.clone(),
            Arc::new(OkProcessor),
            email_policy(),
            EMAIL_QUEUE,
            delivery_for(&job, 1, &log),
        )
        .await;

        let stored = store.get(id).unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempts, 1);
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.result, Some(serde_json::json!({"delivered": true})));
        assert_eq!(
            log.lock().unwrap_or_else(|e| e.into_inner()).as_slice(),
            &[AckOutcome::Acked]
        );
    }

    #[tokio::test]
    async fn failed_delivery_marks_failed_and_naks_with_backoff() {
        let store = Arc::new(MemoryJobStore::new());
        let job = pending_email_job(3);
        let id = job.id;
        store.insert_raw(job.clone());

        let log = ack_log();
        handle_delivery(
            store.clone(),
            Arc::new(FailingProcessor),
            email_policy(),
            EMAIL_QUEUE,
            delivery_for(&job, 1, &log),
        )
        .await;

        let stored = store.get(id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error.as_deref().unwrap().contains("gateway timeout"));
        assert!(stored.failed_at.is_some());

        // First failed attempt naks with the exponential base delay.
        assert_eq!(
            log.lock().unwrap_or_else(|e| e.into_inner()).as_slice(),
            &[AckOutcome::Naked(Some(Duration::from_secs(2)))]
        );
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_and_terminate() {
        let store = Arc::new(MemoryJobStore::new());
        let job = pending_email_job(2);
        let id = job.id;
        store.insert_raw(job.clone());

        let log = ack_log();
        for attempt in 1..=2 {
            handle_delivery(
                store.clone(),
                Arc::new(FailingProcessor),
                email_policy(),
                EMAIL_QUEUE,
                delivery_for(&job, attempt, &log),
            )
            .await;
        }

        let stored = store.get(id).unwrap();
        assert_eq!(stored.status, JobStatus::Dead);
        assert_eq!(stored.attempts, 2);

        let outcomes = log.lock().unwrap_or_else(|e| e.into_inner()).clone();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], AckOutcome::Naked(Some(_))));
        assert_eq!(outcomes[1], AckOutcome::Terminated);

        // A further delivery finds nothing claimable and just acks.
        handle_delivery(
            store.clone(),
            Arc::new(FailingProcessor),
            email_policy(),
            EMAIL_QUEUE,
            delivery_for(&job, 3, &log),
        )
        .await;
        assert_eq!(store.get(id).unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn undecodable_delivery_is_terminated() {
        let store = Arc::new(MemoryJobStore::new());
        let log = ack_log();

        handle_delivery(
            store,
            Arc::new(OkProcessor),
            email_policy(),
            EMAIL_QUEUE,
            raw_delivery(bytes::Bytes::from_static(b"not json"), &log),
        )
        .await;

        assert_eq!(
            log.lock().unwrap_or_else(|e| e.into_inner()).as_slice(),
            &[AckOutcome::Terminated]
        );
    }

    #[tokio::test]
    async fn worker_loop_drains_consumer_and_settles_all_jobs() {
        let store = Arc::new(MemoryJobStore::new());
        let log = ack_log();

        let mut deliveries = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let job = pending_email_job(3);
            ids.push(job.id);
            store.insert_raw(job.clone());
            deliveries.push(delivery_for(&job, 1, &log));
        }

        let registry = QueueRegistry::standard();
        let worker = QueueWorker::with_config(
            registry.get(EMAIL_QUEUE),
            store.clone(),
            Arc::new(OkProcessor),
            WorkerConfig {
                concurrency: 2,
                rate: None,
                worker_id: "worker-test".to_string(),
            },
        );

        worker
            .run(Box::new(TestConsumer::new(deliveries)), CancellationToken::new())
            .await
            .unwrap();

        for id in ids {
            assert_eq!(store.get(id).unwrap().status, JobStatus::Completed);
        }
        assert_eq!(log.lock().unwrap_or_else(|e| e.into_inner()).len(), 5);
    }

    #[tokio::test]
    async fn throttle_delays_deliveries_beyond_the_window_cap() {
        let throttle = Throttle::new(RateLimit {
            max: 2,
            per: Duration::from_millis(50),
        });

        let start = Instant::now();
        throttle.acquire().await;
        throttle.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(40));

        // Third acquisition must wait for the next window.
        throttle.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn gateway_queues_get_narrow_rate_limited_configs() {
        let sms = WorkerConfig::for_queue(SMS_QUEUE);
        assert_eq!(sms.concurrency, 3);
        assert!(sms.rate.is_some());

        let system = WorkerConfig::for_queue(SYSTEM_QUEUE);
        assert_eq!(system.concurrency, 1);

        let default = WorkerConfig::for_queue(EMAIL_QUEUE);
        assert_eq!(default.concurrency, 10);
        assert!(default.rate.is_none());
    }

    #[test]
    fn email_policy_backoff_sanity() {
        let policy = email_policy();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.backoff, Backoff::Exponential { base: Duration::from_secs(2) });
    }
}
