//! Fan-out processor for the notification queue.
//!
//! A notification job does not deliver anything itself. It enqueues one
//! child job per delivery channel (email, SMS, WhatsApp) and completes
//! once the children are durably recorded. Each child carries its own
//! independent retry lifecycle on its own queue.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::kernel::jobs::{
    EnqueueOptions, Job, JobProcessor, JobQueue, EMAIL_QUEUE, SMS_QUEUE, WHATSAPP_QUEUE,
};

pub const EMAIL_JOB: &str = "EMAIL";
pub const SMS_JOB: &str = "SMS";
pub const WHATSAPP_JOB: &str = "WHATSAPP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Generated,
    Reminder,
    Paid,
}

/// Payload of a notification job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub kind: NotificationKind,
    pub student_name: String,
    pub invoice_no: String,
    pub amount_due: String,
    pub due_date: String,
    pub parent_email: Option<String>,
    pub parent_phone: Option<String>,
    #[serde(default)]
    pub whatsapp_opt_in: bool,
}

impl NotificationRequest {
    fn message(&self) -> String {
        match self.kind {
            NotificationKind::Generated => format!(
                "Dear Parent, invoice {} for {} has been generated. Amount: {}. Due: {}.",
                self.invoice_no, self.student_name, self.amount_due, self.due_date
            ),
            NotificationKind::Reminder => format!(
                "REMINDER: Fee for {} is due soon. Please pay {} by {} to avoid late fine.",
                self.student_name, self.amount_due, self.due_date
            ),
            NotificationKind::Paid => format!(
                "Payment received! Thank you for paying {} for {}. Your receipt is available online.",
                self.amount_due, self.student_name
            ),
        }
    }

    fn subject(&self) -> String {
        match self.kind {
            NotificationKind::Generated => "Fee Notification - Invoice Generated".to_string(),
            NotificationKind::Reminder => "Fee Notification - Payment Reminder".to_string(),
            NotificationKind::Paid => "Fee Notification - Payment Received".to_string(),
        }
    }
}

pub struct NotificationProcessor {
    jobs: Arc<JobQueue>,
}

impl NotificationProcessor {
    pub fn new(jobs: Arc<JobQueue>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl JobProcessor for NotificationProcessor {
    async fn process(&self, job: &Job) -> Result<serde_json::Value> {
        let request: NotificationRequest = serde_json::from_value(job.payload.clone())?;
        let message = request.message();
        let mut child_jobs: Vec<Uuid> = Vec::new();

        if let Some(email) = &request.parent_email {
            let result = self
                .jobs
                .enqueue(
                    EnqueueOptions::builder()
                        .job_type(EMAIL_JOB)
                        .queue(EMAIL_QUEUE)
                        .payload(json!({
                            "to": email,
                            "subject": request.subject(),
                            "body": message,
                        }))
                        .tenant_id(job.tenant_id)
                        .build(),
                )
                .await?;
            child_jobs.push(result.job_id());
        }

        if let Some(phone) = &request.parent_phone {
            let result = self
                .jobs
                .enqueue(
                    EnqueueOptions::builder()
                        .job_type(SMS_JOB)
                        .queue(SMS_QUEUE)
                        .payload(json!({"to": phone, "message": message}))
                        .tenant_id(job.tenant_id)
                        .build(),
                )
                .await?;
            child_jobs.push(result.job_id());

            if request.whatsapp_opt_in {
                let result = self
                    .jobs
                    .enqueue(
                        EnqueueOptions::builder()
                            .job_type(WHATSAPP_JOB)
                            .queue(WHATSAPP_QUEUE)
                            .payload(json!({"to": phone, "message": message}))
                            .tenant_id(job.tenant_id)
                            .build(),
                    )
                    .await?;
                child_jobs.push(result.job_id());
            }
        }

        Ok(json!({ "childJobs": child_jobs }))
    }
}
