//! modeld-core: Core types for the modeld worker
//!
//! This crate provides the fundamental types used throughout modeld:
//! - Error taxonomy
//! - Worker configuration
//! - Per-entity lock table
//! - Entity names, resident handles and endpoints

pub mod config;
pub mod error;
pub mod locks;
pub mod model;

pub use config::*;
pub use error::*;
pub use locks::{EntityGuard, LockTable};
pub use model::*;
