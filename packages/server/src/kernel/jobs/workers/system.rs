//! Processor for the system maintenance queue.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::kernel::jobs::recovery::RecoverySweep;
use crate::kernel::jobs::{Job, JobProcessor};

pub const RECOVERY_SWEEP_JOB: &str = "RECOVERY_SWEEP";

/// Runs maintenance jobs. Currently the only kind is an on-demand recovery
/// sweep; the scheduled sweep runs on its own timer so it keeps working
/// while the broker is down.
pub struct SystemProcessor {
    sweep: Arc<RecoverySweep>,
}

impl SystemProcessor {
    pub fn new(sweep: Arc<RecoverySweep>) -> Self {
        Self { sweep }
    }
}

#[async_trait]
impl JobProcessor for SystemProcessor {
    async fn process(&self, job: &Job) -> Result<serde_json::Value> {
        match job.job_type.as_str() {
            RECOVERY_SWEEP_JOB => {
                let report = self.sweep.run().await?;
                Ok(json!({
                    "requeued": report.requeued,
                    "markedStale": report.marked_stale,
                }))
            }
            other => bail!("unknown system job type: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::broker::TestBroker;
    use crate::kernel::jobs::testing::MemoryJobStore;
    use crate::kernel::jobs::{QueueRegistry, SYSTEM_QUEUE};
    use chrono::Utc;

    fn system_job(job_type: &str) -> Job {
        Job::builder()
            .job_type(job_type)
            .queue(SYSTEM_QUEUE)
            .payload(serde_json::json!({}))
            .build()
    }

    #[tokio::test]
    async fn sweep_job_reports_repair_counts() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(TestBroker::new());

        let mut overdue = Job::builder()
            .job_type("EMAIL")
            .queue("email")
            .payload(serde_json::json!({}))
            .build();
        overdue.created_at = Utc::now() - chrono::Duration::minutes(10);
        store.insert_raw(overdue);

        let sweep = Arc::new(RecoverySweep::new(
            store,
            broker,
            Arc::new(QueueRegistry::standard()),
        ));
        let processor = SystemProcessor::new(sweep);

        let result = processor.process(&system_job(RECOVERY_SWEEP_JOB)).await.unwrap();
        assert_eq!(result["requeued"], 1);
        assert_eq!(result["markedStale"], 0);
    }

    #[tokio::test]
    async fn unknown_system_job_type_fails() {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(TestBroker::new());
        let sweep = Arc::new(RecoverySweep::new(
            store,
            broker,
            Arc::new(QueueRegistry::standard()),
        ));
        let processor = SystemProcessor::new(sweep);

        let err = processor.process(&system_job("DEFRAG")).await.unwrap_err();
        assert!(err.to_string().contains("unknown system job type"));
    }
}
