//! modeld-store: Snapshot storage and resident cache
//!
//! This crate provides model state persistence:
//! - Crash-safe, generation-rotated snapshots per entity
//! - Per-entity parameters and model kind records
//! - Bounded resident cache with write-back eviction

pub mod cache;
pub mod checkpoint;

pub use cache::{CacheLease, CacheStats, Checkout, Eviction, ResidentCache, ResidentInfo};
pub use checkpoint::{Generation, SnapshotMeta, SnapshotStore};
