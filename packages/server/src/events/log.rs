//! Append-only event log persistence.
//!
//! The event log is an audit trail, not a dispatch mechanism. Writes are
//! best-effort from the bus's perspective; the log must never block or fail
//! a dispatch.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::RwLock;

use super::types::DomainEvent;

/// Append-only sink for dispatched events.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: &DomainEvent) -> Result<()>;
}

/// Postgres-backed event log.
pub struct PostgresEventLog {
    db: PgPool,
}

impl PostgresEventLog {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EventLog for PostgresEventLog {
    async fn append(&self, event: &DomainEvent) -> Result<()> {
        // ON CONFLICT keeps the append idempotent: an event is persisted at
        // most once no matter how many times dispatch retries the write.
        sqlx::query(
            r#"
            INSERT INTO domain_events (id, event_type, tenant_id, initiated_by, payload, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.event_id)
        .bind(event.event_type())
        .bind(event.tenant_id)
        .bind(event.initiated_by)
        .bind(serde_json::to_value(&event.payload)?)
        .bind(event.occurred_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }
}

/// In-memory event log for tests.
#[derive(Default)]
pub struct MemoryEventLog {
    events: RwLock<Vec<DomainEvent>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: &DomainEvent) -> Result<()> {
        let mut events = self.events.write().unwrap_or_else(|e| e.into_inner());
        if !events.iter().any(|e| e.event_id == event.event_id) {
            events.push(event.clone());
        }
        Ok(())
    }
}
