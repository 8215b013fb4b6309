//! Handler registry for domain events.
//!
//! The registry maps event types to handlers and handler names to their
//! executable functions. It is built once at process start via
//! [`RegistryBuilder`] and is immutable afterwards, so concurrent reads
//! need no locking.
//!
//! Handler names are the unit of dispatch for queued async handlers: the
//! broker message carries the registered name, never a function pointer,
//! and the worker resolves it back through [`HandlerRegistry::resolve`].
//! Name collisions are rejected when the registry is built, not at dequeue
//! time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use thiserror::Error;

use super::types::{DomainEvent, EventKind};

/// Type-erased handler function.
type HandlerFn =
    Arc<dyn Fn(DomainEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Whether a handler runs inline with the emitting request or via the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Runs in the same request cycle. Reserved for invariants that must
    /// hold before the triggering operation returns.
    Sync,
    /// Enqueued as a durable job and executed by a worker.
    Async,
}

/// A single registered handler.
pub struct HandlerRegistration {
    pub event_type: &'static str,
    pub name: String,
    pub kind: HandlerKind,
    handler: HandlerFn,
}

impl HandlerRegistration {
    /// Invoke the handler with an event.
    pub fn invoke(&self, event: DomainEvent) -> BoxFuture<'static, Result<()>> {
        (self.handler)(event)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate handler name: {0}")]
    DuplicateHandlerName(String),
}

/// Collects handler registrations before the process starts serving.
#[derive(Default)]
pub struct RegistryBuilder {
    registrations: Vec<Arc<HandlerRegistration>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous handler for event type `K`.
    pub fn on_sync<K, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        K: EventKind + Clone + Send + Sync + 'static,
        F: Fn(DomainEvent, K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register::<K, F, Fut>(name, HandlerKind::Sync, handler)
    }

    /// Register an asynchronous handler for event type `K`.
    pub fn on_async<K, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        K: EventKind + Clone + Send + Sync + 'static,
        F: Fn(DomainEvent, K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register::<K, F, Fut>(name, HandlerKind::Async, handler)
    }

    fn register<K, F, Fut>(mut self, name: impl Into<String>, kind: HandlerKind, handler: F) -> Self
    where
        K: EventKind + Clone + Send + Sync + 'static,
        F: Fn(DomainEvent, K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let wrapped: HandlerFn = Arc::new(
            move |event: DomainEvent| -> BoxFuture<'static, Result<()>> {
                match K::extract(&event.payload).cloned() {
                    Some(payload) => Box::pin(handler(event, payload)),
                    None => Box::pin(async move {
                        Err(anyhow!("event payload does not match {}", K::EVENT_TYPE))
                    }),
                }
            },
        );

        self.registrations.push(Arc::new(HandlerRegistration {
            event_type: K::EVENT_TYPE,
            name: name.into(),
            kind,
            handler: wrapped,
        }));
        self
    }

    /// Finalize the registry, validating that every handler name is unique.
    pub fn build(self) -> Result<HandlerRegistry, RegistryError> {
        let mut by_name: HashMap<String, Arc<HandlerRegistration>> = HashMap::new();
        let mut by_type: HashMap<&'static str, Vec<Arc<HandlerRegistration>>> = HashMap::new();

        for reg in &self.registrations {
            if by_name
                .insert(reg.name.clone(), Arc::clone(reg))
                .is_some()
            {
                return Err(RegistryError::DuplicateHandlerName(reg.name.clone()));
            }
            by_type.entry(reg.event_type).or_default().push(Arc::clone(reg));
        }

        Ok(HandlerRegistry {
            registrations: self.registrations,
            by_name,
            by_type,
        })
    }
}

/// Immutable, process-wide handler registry.
pub struct HandlerRegistry {
    registrations: Vec<Arc<HandlerRegistration>>,
    by_name: HashMap<String, Arc<HandlerRegistration>>,
    by_type: HashMap<&'static str, Vec<Arc<HandlerRegistration>>>,
}

impl HandlerRegistry {
    /// All handlers for an event type, in registration order.
    pub fn handlers_for(&self, event_type: &str) -> &[Arc<HandlerRegistration>] {
        self.by_type
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Resolve a handler by its registered name.
    ///
    /// Used by the event-handler worker to execute queued async handlers.
    pub fn resolve(&self, name: &str) -> Option<&Arc<HandlerRegistration>> {
        self.by_name.get(name)
    }

    /// All registrations, for startup logging and introspection.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<HandlerRegistration>> {
        self.registrations.iter()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Counts of (sync, async) handlers, for the startup log line.
    pub fn counts(&self) -> (usize, usize) {
        let sync = self
            .registrations
            .iter()
            .filter(|r| r.kind == HandlerKind::Sync)
            .count();
        (sync, self.registrations.len() - sync)
    }
}
