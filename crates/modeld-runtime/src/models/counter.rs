//! Run counter with a running sum

use modeld_core::{ModeldError, ModeldResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::numeric_input;
use crate::traits::{Model, ModelKind};

pub struct CounterKind;

impl ModelKind for CounterKind {
    fn name(&self) -> &'static str {
        "counter"
    }

    fn default_parameters(&self) -> Value {
        json!({ "start": 0 })
    }

    fn create(&self, params: &Value) -> ModeldResult<Box<dyn Model>> {
        let start = match params.get("start") {
            None | Some(Value::Null) => 0,
            Some(v) => v.as_u64().ok_or_else(|| {
                ModeldError::ConfigurationInvalid(format!(
                    "counter start must be a non-negative integer, got {}",
                    v
                ))
            })?,
        };
        Ok(Box::new(Counter {
            count: start,
            sum: 0.0,
        }))
    }

    fn restore(&self, state: Value) -> ModeldResult<Box<dyn Model>> {
        let counter: Counter = serde_json::from_value(state)
            .map_err(|e| ModeldError::Corrupt(format!("counter state: {}", e)))?;
        Ok(Box::new(counter))
    }
}

/// Counts runs and sums numeric inputs. `null` input only counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub count: u64,
    pub sum: f64,
}

impl Model for Counter {
    fn run(&mut self, input: Value) -> ModeldResult<Value> {
        let increment = if input.is_null() {
            0.0
        } else {
            numeric_input(&input)?
        };
        self.count += 1;
        self.sum += increment;
        Ok(json!({ "count": self.count, "sum": self.sum }))
    }

    fn state(&self) -> ModeldResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}
