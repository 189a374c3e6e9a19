//! Built-in model kinds

mod counter;
mod ewma;

pub use counter::{Counter, CounterKind};
pub use ewma::{Ewma, EwmaKind};

use modeld_core::{ModeldError, ModeldResult};
use serde_json::Value;

/// Accept a bare number or `{"value": number}`
pub(crate) fn numeric_input(input: &Value) -> ModeldResult<f64> {
    let value = match input {
        Value::Object(map) => map.get("value").unwrap_or(&Value::Null),
        other => other,
    };
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| {
            ModeldError::ComputationFailure(format!("expected a finite number, got {}", input))
        })
}
