//! Durable job model.
//!
//! A `Job` row is the source of truth for one unit of queued work. The
//! broker only carries delivery messages keyed by the job id; everything
//! the operator needs to audit or recover lives on this row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobStatus {
    /// Whether this status permits a transition into `Processing`.
    ///
    /// `Failed` is claimable again because it is terminal per attempt, not
    /// terminal for the job: the broker redelivers while attempts remain.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed)
    }

    /// Whether no further automatic work will happen on this job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dead)
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,

    /// Semantic work kind, e.g. "EMAIL" or "EVENT_PaymentReconciled".
    pub job_type: String,
    /// Transport channel the job is delivered on.
    pub queue: String,
    /// Opaque to the store; interpreted by the worker for this queue.
    pub payload: serde_json::Value,

    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,
    #[builder(default = 0)]
    pub priority: i32,

    #[builder(default)]
    pub scheduled_at: Option<DateTime<Utc>>,

    // Audit scoping
    #[builder(default)]
    pub tenant_id: Option<Uuid>,
    #[builder(default)]
    pub user_id: Option<Uuid>,

    #[builder(default)]
    pub idempotency_key: Option<String>,

    // Outcome
    #[builder(default)]
    pub result: Option<serde_json::Value>,
    #[builder(default)]
    pub error: Option<String>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default)]
    pub failed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether the job is due for delivery right now.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            None => true,
            Some(at) => at <= now,
        }
    }

    /// Whether another attempt may run after a failure.
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder()
            .job_type("EMAIL")
            .queue("email")
            .payload(serde_json::json!({"to": "parent@example.com"}))
            .build()
    }

    #[test]
    fn new_job_starts_pending_with_zero_attempts() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
    }

    #[test]
    fn job_without_schedule_is_due_immediately() {
        let job = sample_job();
        assert!(job.is_due(Utc::now()));
    }

    #[test]
    fn scheduled_job_is_not_due_before_its_time() {
        let mut job = sample_job();
        job.scheduled_at = Some(Utc::now() + chrono::Duration::minutes(10));
        assert!(!job.is_due(Utc::now()));
        assert!(job.is_due(Utc::now() + chrono::Duration::minutes(11)));
    }

    #[test]
    fn pending_and_failed_are_claimable() {
        assert!(JobStatus::Pending.is_claimable());
        assert!(JobStatus::Failed.is_claimable());
        assert!(!JobStatus::Processing.is_claimable());
        assert!(!JobStatus::Completed.is_claimable());
        assert!(!JobStatus::Dead.is_claimable());
    }

    #[test]
    fn completed_and_dead_are_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Dead.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
    }

    #[test]
    fn status_serializes_in_contract_casing() {
        assert_eq!(
            serde_json::to_value(JobStatus::Pending).unwrap(),
            serde_json::json!("PENDING")
        );
        assert_eq!(
            serde_json::to_value(JobStatus::Dead).unwrap(),
            serde_json::json!("DEAD")
        );
    }
}
