//! Durable background-job infrastructure.
//!
//! - [`Job`] - the durable row, one per unit of queued work
//! - [`JobStore`] - storage trait with Postgres and in-memory impls
//! - [`JobQueue`] - dual-write enqueue (row first, broker best-effort)
//! - [`QueueRegistry`] - named queues with explicit retry policies
//! - [`QueueWorker`] - generic per-queue dispatch harness
//! - [`RecoverySweep`] - periodic store/broker reconciliation
//!
//! # Architecture
//!
//! ```text
//! enqueue(options)
//!     │
//!     ├─► insert Job row (must succeed)
//!     └─► publish JobMessage keyed by job id (best effort)
//!
//! QueueWorker (one per queue)
//!     │
//!     ├─► receive broker delivery
//!     ├─► mark Processing / run JobProcessor
//!     └─► mark Completed, or Failed/Dead and hand retry to the broker
//!
//! RecoverySweep (periodic)
//!     │
//!     ├─► re-publish overdue Pending rows
//!     └─► fail Processing rows whose worker is presumed crashed
//! ```
//!
//! Business logic stays in domain handlers; this module only provides the
//! infrastructure.

mod job;
mod queue;
mod queues;
pub mod recovery;
mod store;
pub mod testing;
mod worker;
pub mod workers;

pub use job::{Job, JobStatus};
pub use queue::{EnqueueOptions, EnqueueResult, JobMessage, JobQueue};
pub use queues::{
    Backoff, QueueHandle, QueueRegistry, RetryPolicy, BULK_SMS_QUEUE, EMAIL_QUEUE,
    EVENT_HANDLER_QUEUE, FINANCE_QUEUE, IMPORT_QUEUE, NOTIFICATION_QUEUE, PROMOTION_QUEUE,
    REMINDER_QUEUE, REPORT_QUEUE, SMS_QUEUE, SYSTEM_QUEUE, WHATSAPP_QUEUE,
};
pub use recovery::{spawn_periodic, RecoverySweep, SweepConfig, SweepReport};
pub use store::{InsertOutcome, JobStore, PostgresJobStore};
pub use worker::{handle_delivery, JobProcessor, QueueWorker, RateLimit, WorkerConfig};
