//! Named queues and their retry policies.
//!
//! Every queue resolves to a retry policy through an explicit table with a
//! required default entry, so a queue can never be used without a
//! resolvable policy. Handles are created lazily and memoized per name for
//! the process lifetime.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use crate::kernel::broker::queue_subject;

// Queue names. `queue` on a job row is the transport channel; `job_type`
// is the semantic kind carried over it.
pub const EVENT_HANDLER_QUEUE: &str = "event-handlers";
pub const EMAIL_QUEUE: &str = "email";
pub const SMS_QUEUE: &str = "sms";
pub const WHATSAPP_QUEUE: &str = "whatsapp";
pub const NOTIFICATION_QUEUE: &str = "notification";
pub const FINANCE_QUEUE: &str = "finance";
pub const REPORT_QUEUE: &str = "report";
pub const BULK_SMS_QUEUE: &str = "bulk-sms";
pub const IMPORT_QUEUE: &str = "import";
pub const REMINDER_QUEUE: &str = "reminder";
pub const PROMOTION_QUEUE: &str = "promotion";
pub const SYSTEM_QUEUE: &str = "system";

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Single-attempt queues; no redelivery delay applies.
    None,
    Fixed { delay: Duration },
    Exponential { base: Duration },
}

impl Backoff {
    /// Delay before the next delivery after `attempt` failed attempts.
    ///
    /// Exponential growth is capped at one hour.
    pub fn delay_for(&self, attempt: i32) -> Duration {
        const MAX_DELAY: Duration = Duration::from_secs(3600);

        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential { base } => {
                let exponent = attempt.saturating_sub(1).clamp(0, 30) as u32;
                base.saturating_mul(2u32.saturating_pow(exponent)).min(MAX_DELAY)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: i32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn new(attempts: i32, backoff: Backoff) -> Self {
        Self { attempts, backoff }
    }
}

/// A resolved queue: its name, broker subject, and retry policy.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    pub name: String,
    pub policy: RetryPolicy,
}

impl QueueHandle {
    pub fn subject(&self) -> String {
        queue_subject(&self.name)
    }
}

/// Explicit queue-to-policy table with a required default entry.
pub struct QueueRegistry {
    default: RetryPolicy,
    overrides: HashMap<String, RetryPolicy>,
    handles: RwLock<HashMap<String, QueueHandle>>,
}

impl QueueRegistry {
    /// Build a registry. The default policy is required by construction,
    /// so every queue name resolves.
    pub fn new(default: RetryPolicy, overrides: HashMap<String, RetryPolicy>) -> Self {
        Self {
            default,
            overrides,
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// The platform's standard policy table.
    ///
    /// Critical finance traffic retries quickly and gives up early; fee
    /// reminders tolerate more attempts; one-shot orchestration runs
    /// (promotion rollover) never retry automatically.
    pub fn standard() -> Self {
        let mut overrides = HashMap::new();
        overrides.insert(
            FINANCE_QUEUE.to_string(),
            RetryPolicy::new(2, Backoff::Fixed { delay: Duration::from_secs(5) }),
        );
        overrides.insert(
            REMINDER_QUEUE.to_string(),
            RetryPolicy::new(5, Backoff::Exponential { base: Duration::from_secs(3) }),
        );
        overrides.insert(
            PROMOTION_QUEUE.to_string(),
            RetryPolicy::new(1, Backoff::None),
        );
        overrides.insert(
            SYSTEM_QUEUE.to_string(),
            RetryPolicy::new(2, Backoff::Fixed { delay: Duration::from_secs(10) }),
        );

        Self::new(
            RetryPolicy::new(3, Backoff::Exponential { base: Duration::from_secs(2) }),
            overrides,
        )
    }

    /// The retry policy for a queue name.
    pub fn policy_for(&self, name: &str) -> RetryPolicy {
        self.overrides.get(name).copied().unwrap_or(self.default)
    }

    /// Look up (or lazily create) the handle for a queue.
    pub fn get(&self, name: &str) -> QueueHandle {
        if let Some(handle) = self
            .handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return handle.clone();
        }

        let handle = QueueHandle {
            name: name.to_string(),
            policy: self.policy_for(name),
        };
        self.handles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), handle.clone());
        handle
    }
}
