//! Processor for the event-handlers queue.
//!
//! Executes queued async domain-event handlers. The broker message carries
//! the handler's registered name and a full copy of the event; the handler
//! function itself is resolved from the in-process registry at dequeue
//! time and the event is reconstructed from the message body, never from
//! the event log.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::events::{EventJobPayload, HandlerRegistry};
use crate::kernel::jobs::{Job, JobProcessor};

pub struct EventHandlerProcessor {
    registry: Arc<HandlerRegistry>,
}

impl EventHandlerProcessor {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl JobProcessor for EventHandlerProcessor {
    async fn process(&self, job: &Job) -> Result<serde_json::Value> {
        let payload: EventJobPayload = serde_json::from_value(job.payload.clone())?;
        let handler_name = payload.handler_name.clone();

        // An unknown name is fatal for this attempt; it surfaces as a
        // failed/dead job, not a bus-level error.
        let registration = self
            .registry
            .resolve(&handler_name)
            .ok_or_else(|| anyhow!("handler \"{handler_name}\" not found in registry"))?;

        let event = payload.into_event();
        let event_id = event.event_id;
        registration.invoke(event).await?;

        Ok(json!({
            "eventId": event_id,
            "handlerName": handler_name,
        }))
    }
}
