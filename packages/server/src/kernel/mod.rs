//! Kernel-level infrastructure: broker client abstraction and the durable
//! job subsystem. Business logic stays in domain crates; this module only
//! provides the plumbing they run on.

pub mod broker;
pub mod jobs;
