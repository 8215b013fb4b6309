//! Processors for the platform's queues.
//!
//! Each processor plugs into the generic [`QueueWorker`] harness; the
//! harness owns the job lifecycle, the processor owns the work.
//!
//! [`QueueWorker`]: super::QueueWorker

mod event_handler;
mod notification;
mod system;

pub use event_handler::EventHandlerProcessor;
pub use notification::{
    NotificationKind, NotificationProcessor, NotificationRequest, EMAIL_JOB, SMS_JOB,
    WHATSAPP_JOB,
};
pub use system::{SystemProcessor, RECOVERY_SWEEP_JOB};
