//! modeld-network: Job queue and request routing
//!
//! This crate provides the plumbing between clients and the worker:
//! - The job queue contract and an in-process queue
//! - Consistent-hash routing of entity names to workers

pub mod queue;
pub mod router;

pub use queue::{Job, JobFailure, JobFunc, JobQueue, JobReply, MemoryQueue, QueueClient};
pub use router::Router;
