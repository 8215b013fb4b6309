//! Domain event infrastructure.
//!
//! Events are immutable, past-tense facts about something that happened in
//! the platform, scoped to a single tenant. They are dispatched through the
//! [`EventBus`], which runs synchronous handlers inline and enqueues
//! asynchronous handlers as durable jobs.

mod bus;
mod log;
mod registry;
mod types;

pub use bus::{DispatchResult, EventBus, EventJobPayload, EVENT_JOB_TYPE_PREFIX};
pub use log::{EventLog, MemoryEventLog, PostgresEventLog};
pub use registry::{
    HandlerKind, HandlerRegistration, HandlerRegistry, RegistryBuilder, RegistryError,
};
pub use types::*;
