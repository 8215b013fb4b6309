// Atlas School Systems - Operations Core
//
// This crate provides the domain event bus and durable background-job
// subsystem for the multi-tenant operations platform. Business operations
// emit past-tense domain events; synchronous handlers run inline with the
// request, asynchronous handlers run via durable jobs backed by Postgres
// and delivered over NATS JetStream.

pub mod config;
pub mod events;
pub mod kernel;

pub use config::*;
