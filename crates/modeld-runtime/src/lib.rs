//! modeld-runtime: Model contract and lifecycle
//!
//! This crate provides the pieces that turn a snapshot into a running model:
//! - The `Model` / `ModelKind` contract
//! - A startup lookup table of model kinds
//! - Built-in `counter` and `ewma` kinds
//! - The create/load/run/save lifecycle with auto-save

pub mod lifecycle;
pub mod models;
pub mod registry;
pub mod traits;

pub use lifecycle::{Lifecycle, ModelInstance, Phase, SavedModel};
pub use registry::ModelRegistry;
pub use traits::{Model, ModelKind};
