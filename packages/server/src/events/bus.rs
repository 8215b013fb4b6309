//! Event bus with sync/async dispatch, event persistence, and idempotent
//! async-handler enqueueing.
//!
//! Sync handlers run in-process, in the same request cycle as the emitting
//! operation. Async handlers are enqueued as durable jobs on the
//! event-handlers queue and executed by a worker.
//!
//! Dispatch never returns an error. A failure in the event-log write, in a
//! sync handler, or in an async-handler enqueue is caught, logged, and
//! collected into [`DispatchResult::errors`]; it must never fail the
//! business operation that emitted the event.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::kernel::jobs::{EnqueueOptions, JobQueue, EVENT_HANDLER_QUEUE};

use super::log::EventLog;
use super::registry::{HandlerKind, HandlerRegistration, HandlerRegistry};
use super::types::{DomainEvent, EventPayload};

/// Job type prefix for queued async handler invocations.
pub const EVENT_JOB_TYPE_PREFIX: &str = "EVENT_";

/// Delay before the single retry of a failed event-log write.
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Outcome of a single dispatch.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub event_id: Uuid,
    pub sync_handlers_run: usize,
    pub async_handlers_queued: usize,
    pub errors: Vec<String>,
}

/// Broker message body for a queued async handler invocation.
///
/// Carries everything the worker needs to reconstruct the event; the worker
/// never re-queries the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventJobPayload {
    pub event_id: Uuid,
    pub handler_name: String,
    pub tenant_id: Uuid,
    pub initiated_by: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
    pub event: EventPayload,
}

impl EventJobPayload {
    /// Rebuild the event this payload was derived from.
    pub fn into_event(self) -> DomainEvent {
        DomainEvent {
            event_id: self.event_id,
            occurred_at: self.occurred_at,
            tenant_id: self.tenant_id,
            initiated_by: self.initiated_by,
            payload: self.event,
        }
    }
}

/// Dispatches domain events to registered handlers.
pub struct EventBus {
    registry: Arc<HandlerRegistry>,
    log: Arc<dyn EventLog>,
    jobs: Arc<JobQueue>,
}

impl EventBus {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        log: Arc<dyn EventLog>,
        jobs: Arc<JobQueue>,
    ) -> Self {
        Self {
            registry,
            log,
            jobs,
        }
    }

    /// Construct and dispatch an event in one call.
    pub async fn emit(
        &self,
        tenant_id: Uuid,
        payload: impl Into<EventPayload>,
        initiated_by: Option<Uuid>,
    ) -> DispatchResult {
        let event = DomainEvent::new(tenant_id, payload.into(), initiated_by);
        self.dispatch(event).await
    }

    /// Dispatch an event to all registered handlers.
    ///
    /// 1. Persists the event to the log (best-effort, bounded retry).
    /// 2. Runs all sync handlers sequentially, collecting errors.
    /// 3. Enqueues all async handlers as durable jobs, collecting errors.
    pub async fn dispatch(&self, event: DomainEvent) -> DispatchResult {
        let mut result = DispatchResult {
            event_id: event.event_id,
            sync_handlers_run: 0,
            async_handlers_queued: 0,
            errors: Vec::new(),
        };

        self.persist_best_effort(&event).await;

        for reg in self.registry.handlers_for(event.event_type()) {
            match reg.kind {
                HandlerKind::Sync => match reg.invoke(event.clone()).await {
                    Ok(()) => result.sync_handlers_run += 1,
                    Err(e) => {
                        error!(
                            event_id = %event.event_id,
                            event_type = %event.event_type(),
                            handler = %reg.name,
                            error = %e,
                            "sync handler failed"
                        );
                        result.errors.push(format!("[sync:{}] {e:#}", reg.name));
                    }
                },
                HandlerKind::Async => match self.enqueue_async(&event, reg).await {
                    Ok(()) => result.async_handlers_queued += 1,
                    Err(e) => {
                        error!(
                            event_id = %event.event_id,
                            event_type = %event.event_type(),
                            handler = %reg.name,
                            error = %e,
                            "failed to enqueue async handler"
                        );
                        result.errors.push(format!("[async:{}] {e:#}", reg.name));
                    }
                },
            }
        }

        result
    }

    /// Write the event to the log with one retry. Failures are logged and
    /// swallowed; the audit write must never fail a dispatch.
    async fn persist_best_effort(&self, event: &DomainEvent) {
        if let Err(first) = self.log.append(event).await {
            warn!(
                event_id = %event.event_id,
                error = %first,
                "event log write failed, retrying once"
            );
            tokio::time::sleep(PERSIST_RETRY_DELAY).await;
            if let Err(second) = self.log.append(event).await {
                error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type(),
                    error = %second,
                    "event log write failed after retry, event not persisted"
                );
            }
        }
    }

    async fn enqueue_async(
        &self,
        event: &DomainEvent,
        reg: &Arc<HandlerRegistration>,
    ) -> Result<()> {
        let payload = EventJobPayload {
            event_id: event.event_id,
            handler_name: reg.name.clone(),
            tenant_id: event.tenant_id,
            initiated_by: event.initiated_by,
            occurred_at: event.occurred_at,
            event: event.payload.clone(),
        };

        let options = EnqueueOptions::builder()
            .job_type(format!("{EVENT_JOB_TYPE_PREFIX}{}", event.event_type()))
            .queue(EVENT_HANDLER_QUEUE)
            .payload(serde_json::to_value(&payload)?)
            .tenant_id(event.tenant_id)
            .user_id(event.initiated_by)
            .idempotency_key(format!("evt-{}-{}", event.event_id, reg.name))
            .build();

        self.jobs.enqueue(options).await?;
        Ok(())
    }
}
