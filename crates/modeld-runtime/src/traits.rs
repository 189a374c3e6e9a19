//! Model contract

use modeld_core::ModeldResult;
use serde_json::Value;

/// A stateful computational unit for one entity.
///
/// Every `run` mutates the unit. Implementations must validate the input
/// before changing any state, so a failed call leaves the unit as it was.
pub trait Model: Send + Sync + 'static {
    /// Feed one input, returning the unit's output
    fn run(&mut self, input: Value) -> ModeldResult<Value>;

    /// Serializable state, accepted back by `ModelKind::restore`
    fn state(&self) -> ModeldResult<Value>;
}

/// Factory for one kind of model
pub trait ModelKind: Send + Sync + 'static {
    /// Registry key, also recorded in snapshots
    fn name(&self) -> &'static str;

    /// Parameters used when none are configured
    fn default_parameters(&self) -> Value;

    /// Build a fresh unit from parameters
    fn create(&self, params: &Value) -> ModeldResult<Box<dyn Model>>;

    /// Rebuild a unit from `Model::state` output
    fn restore(&self, state: Value) -> ModeldResult<Box<dyn Model>>;
}
