//! modeld-scheduler: Request dispatch for modeld
//!
//! This crate sequences work on entities:
//! - Per-entity serialization of runs and admin operations
//! - Cache admission, eviction and batched write-back
//! - The job worker loop

pub mod dispatcher;
pub mod worker;

pub use dispatcher::{Dispatcher, FlushFailure, FlushReport, RunRequest, WorkerStatus};
pub use worker::{execute, process, serve};
