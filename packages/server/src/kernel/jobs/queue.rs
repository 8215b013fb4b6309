//! Dual-write enqueue.
//!
//! Creates the durable job row first, then best-effort publishes a broker
//! message carrying the job id. A publish failure is logged and swallowed:
//! the row stays `Pending` and the recovery sweep re-publishes it later.
//! The only failure that surfaces to the caller is the row insert itself,
//! because without it the work was never durably recorded.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::kernel::broker::BrokerPublisher;

use super::job::Job;
use super::queues::QueueRegistry;
use super::store::{InsertOutcome, JobStore};

/// Result of an enqueue that handles idempotency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// A new job was created.
    Created(Uuid),
    /// A job with this idempotency key already exists.
    Duplicate(Uuid),
}

impl EnqueueResult {
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Options for enqueueing a unit of work.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct EnqueueOptions {
    pub job_type: String,
    pub queue: String,
    pub payload: serde_json::Value,
    #[builder(default = 0)]
    pub priority: i32,
    /// Deliver no earlier than this instant.
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Deliver after this duration; shorthand for `scheduled_at`.
    #[builder(default, setter(strip_option))]
    pub delay: Option<Duration>,
    #[builder(default)]
    pub tenant_id: Option<Uuid>,
    #[builder(default)]
    pub user_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,
    /// Overrides the queue policy's attempt count when set.
    #[builder(default, setter(strip_option))]
    pub max_attempts: Option<i32>,
}

/// Broker message body for one job delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
}

impl JobMessage {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Durable enqueue front-end shared by the event bus, fan-out handlers,
/// and domain code.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    publisher: Arc<dyn BrokerPublisher>,
    queues: Arc<QueueRegistry>,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        publisher: Arc<dyn BrokerPublisher>,
        queues: Arc<QueueRegistry>,
    ) -> Self {
        Self {
            store,
            publisher,
            queues,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queues(&self) -> &Arc<QueueRegistry> {
        &self.queues
    }

    /// Enqueue a unit of work.
    pub async fn enqueue(&self, options: EnqueueOptions) -> Result<EnqueueResult> {
        if let Some(key) = &options.idempotency_key {
            if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
                debug!(
                    job_id = %existing.id,
                    idempotency_key = %key,
                    "enqueue collapsed onto existing job"
                );
                return Ok(EnqueueResult::Duplicate(existing.id));
            }
        }

        let handle = self.queues.get(&options.queue);
        let scheduled_at = match (options.scheduled_at, options.delay) {
            (Some(at), _) => Some(at),
            (None, Some(delay)) => {
                Some(Utc::now() + chrono::Duration::from_std(delay).context("invalid delay")?)
            }
            (None, None) => None,
        };

        let job = Job::builder()
            .job_type(options.job_type)
            .queue(options.queue)
            .payload(options.payload)
            .priority(options.priority)
            .max_attempts(options.max_attempts.unwrap_or(handle.policy.attempts))
            .scheduled_at(scheduled_at)
            .tenant_id(options.tenant_id)
            .user_id(options.user_id)
            .idempotency_key(options.idempotency_key)
            .build();

        // Step 1: the durable record. This must succeed or the whole call
        // fails; there is no unit of work without a row.
        let job = match self.store.insert(job).await? {
            InsertOutcome::Inserted(job) => job,
            InsertOutcome::DuplicateKey(existing) => {
                return Ok(EnqueueResult::Duplicate(existing.id));
            }
        };

        // Step 2: best-effort delivery. Jobs scheduled for the future are
        // not published here; the recovery sweep publishes them once due,
        // since the broker has no delayed publish.
        if job.is_due(Utc::now()) {
            let message = JobMessage::for_job(&job).to_bytes()?;
            if let Err(e) = self
                .publisher
                .publish(&handle.subject(), &job.id.to_string(), message)
                .await
            {
                warn!(
                    job_id = %job.id,
                    queue = %handle.name,
                    error = %e,
                    "broker publish failed, job saved as pending for recovery"
                );
            }
        }

        Ok(EnqueueResult::Created(job.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::broker::TestBroker;
    use crate::kernel::jobs::testing::MemoryJobStore;
    use crate::kernel::jobs::{JobStatus, EMAIL_QUEUE, FINANCE_QUEUE};

    fn queue_with(
        store: Arc<MemoryJobStore>,
        broker: Arc<TestBroker>,
    ) -> JobQueue {
        JobQueue::new(store, broker, Arc::new(QueueRegistry::standard()))
    }

    fn email_options() -> EnqueueOptions {
        EnqueueOptions::builder()
            .job_type("EMAIL")
            .queue(EMAIL_QUEUE)
            .payload(serde_json::json!({"to": "parent@example.com"}))
            .build()
    }

    #[tokio::test]
    async fn enqueue_writes_row_and_publishes_keyed_by_job_id() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(TestBroker::new());
        let queue = queue_with(store.clone(), broker.clone());

        let result = queue.enqueue(email_options()).await.unwrap();
        assert!(result.is_created());

        let jobs = store.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Pending);
        assert_eq!(jobs[0].max_attempts, 3);

        let published = broker.messages_for_subject("jobs.email");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].msg_id, result.job_id().to_string());

        let message: JobMessage = broker.deserialize_message(&published[0]).unwrap();
        assert_eq!(message.job_id, result.job_id());
        assert_eq!(message.job_type, "EMAIL");
    }

    #[tokio::test]
    async fn publish_failure_still_returns_job_id() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(TestBroker::new());
        broker.set_failing(true);
        let queue = queue_with(store.clone(), broker.clone());

        let result = queue.enqueue(email_options()).await.unwrap();

        assert!(result.is_created());
        assert_eq!(broker.publish_count(), 0);

        // The durable row survives as the recovery source of truth.
        let job = store.get(result.job_id()).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_collapses_to_one_job() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(TestBroker::new());
        let queue = queue_with(store.clone(), broker.clone());

        let options = || {
            EnqueueOptions::builder()
                .job_type("EMAIL")
                .queue(EMAIL_QUEUE)
                .payload(serde_json::json!({"to": "parent@example.com"}))
                .idempotency_key("evt-abc-notify")
                .build()
        };

        let first = queue.enqueue(options()).await.unwrap();
        let second = queue.enqueue(options()).await.unwrap();

        assert!(first.is_created());
        assert_eq!(second, EnqueueResult::Duplicate(first.job_id()));
        assert_eq!(store.jobs().len(), 1);
        assert_eq!(broker.publish_count(), 1);
    }

    #[tokio::test]
    async fn queue_policy_sets_default_max_attempts() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(TestBroker::new());
        let queue = queue_with(store.clone(), broker);

        let options = EnqueueOptions::builder()
            .job_type("POST_LEDGER_ENTRY")
            .queue(FINANCE_QUEUE)
            .payload(serde_json::json!({}))
            .build();
        let result = queue.enqueue(options).await.unwrap();

        assert_eq!(store.get(result.job_id()).unwrap().max_attempts, 2);
    }

    #[tokio::test]
    async fn future_scheduled_jobs_are_not_published_at_enqueue() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(TestBroker::new());
        let queue = queue_with(store.clone(), broker.clone());

        let options = EnqueueOptions::builder()
            .job_type("EMAIL")
            .queue(EMAIL_QUEUE)
            .payload(serde_json::json!({}))
            .delay(Duration::from_secs(600))
            .build();
        let result = queue.enqueue(options).await.unwrap();

        assert!(result.is_created());
        assert_eq!(broker.publish_count(), 0);
        assert!(store.get(result.job_id()).unwrap().scheduled_at.is_some());
    }
}
