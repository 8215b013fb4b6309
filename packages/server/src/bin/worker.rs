// Worker process: hosts one queue worker per queue plus the periodic
// recovery sweep.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ops_core::events::{
    EventBus, PaymentReconciled, PostgresEventLog, RegistryBuilder, StudentEnrolled,
};
use ops_core::kernel::broker::{
    ensure_jobs_stream, JetStreamPublisher, JetStreamQueueConsumer,
};
use ops_core::kernel::jobs::workers::{
    EventHandlerProcessor, NotificationProcessor, SystemProcessor,
};
use ops_core::kernel::jobs::{
    spawn_periodic, JobProcessor, JobQueue, PostgresJobStore, QueueRegistry, QueueWorker,
    RecoverySweep, EVENT_HANDLER_QUEUE, NOTIFICATION_QUEUE, SYSTEM_QUEUE,
};
use ops_core::Config;

/// Handlers that ship with the platform itself. Domain crates register
/// their own on top of these at startup.
fn register_platform_handlers(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .on_sync::<PaymentReconciled, _, _>("audit:PaymentReconciled", |event, payload| async move {
            tracing::info!(
                event_id = %event.event_id,
                tenant_id = %event.tenant_id,
                payment_id = %payload.payment_id,
                invoice_id = %payload.invoice_id,
                amount = payload.amount,
                "payment reconciled"
            );
            Ok(())
        })
        .on_sync::<StudentEnrolled, _, _>("audit:StudentEnrolled", |event, payload| async move {
            tracing::info!(
                event_id = %event.event_id,
                tenant_id = %event.tenant_id,
                enrollment_id = %payload.enrollment_id,
                student_id = %payload.student_id,
                "student enrolled"
            );
            Ok(())
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ops_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting operations worker");

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    tracing::info!("Connecting to NATS at {}...", config.nats_url);
    let nats = async_nats::connect(&config.nats_url)
        .await
        .context("Failed to connect to NATS")?;
    let jetstream = async_nats::jetstream::new(nats);
    ensure_jobs_stream(&jetstream).await?;

    // The registry is built once, validated, and shared read-only with the
    // bus and every worker.
    let registry = Arc::new(
        register_platform_handlers(RegistryBuilder::new())
            .build()
            .context("Handler registry validation failed")?,
    );
    let (sync_count, async_count) = registry.counts();
    tracing::info!(
        handlers = registry.len(),
        sync_handlers = sync_count,
        async_handlers = async_count,
        "Handler registry initialized"
    );

    let store = Arc::new(PostgresJobStore::new(pool.clone()));
    let publisher = Arc::new(JetStreamPublisher::new(jetstream.clone()));
    let queues = Arc::new(QueueRegistry::standard());
    let jobs = Arc::new(JobQueue::new(store.clone(), publisher.clone(), queues.clone()));

    // The bus is constructed here so sync handlers registered above can run
    // in any process that emits; the worker itself emits nothing today.
    let _bus = EventBus::new(
        registry.clone(),
        Arc::new(PostgresEventLog::new(pool.clone())),
        jobs.clone(),
    );

    let sweep = Arc::new(RecoverySweep::new(
        store.clone(),
        publisher.clone(),
        queues.clone(),
    ));

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    let worker_set: Vec<(&str, Arc<dyn JobProcessor>)> = vec![
        (
            EVENT_HANDLER_QUEUE,
            Arc::new(EventHandlerProcessor::new(registry.clone())),
        ),
        (
            NOTIFICATION_QUEUE,
            Arc::new(NotificationProcessor::new(jobs.clone())),
        ),
        (SYSTEM_QUEUE, Arc::new(SystemProcessor::new(sweep.clone()))),
    ];

    for (queue_name, processor) in worker_set {
        let handle = queues.get(queue_name);
        let consumer = JetStreamQueueConsumer::subscribe(
            &jetstream,
            queue_name,
            i64::from(handle.policy.attempts),
        )
        .await
        .with_context(|| format!("Failed to subscribe to queue {queue_name}"))?;

        let worker = QueueWorker::new(handle, store.clone(), processor);
        tasks.push(tokio::spawn(
            worker.run(Box::new(consumer), shutdown.child_token()),
        ));
    }

    let sweep_task = spawn_periodic(
        sweep,
        Duration::from_secs(config.sweep_interval_secs),
        shutdown.child_token(),
    );

    tracing::info!("Worker running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down...");
    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    let _ = sweep_task.await;
    tracing::info!("Worker stopped");

    Ok(())
}
