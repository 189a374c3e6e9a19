//! modeld-api: REST API server for modeld
//!
//! This crate provides the HTTP surface of a worker:
//! - Model runs and snapshots
//! - Save, reset and save-delay administration
//! - Worker status

pub mod rest;

pub use rest::create_router;
