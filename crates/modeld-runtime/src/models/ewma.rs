//! Exponentially weighted mean/variance anomaly scorer
//!
//! Each input is scored by its distance from the running mean in running
//! standard deviations, then folded into the running statistics.

use modeld_core::{ModeldError, ModeldResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::numeric_input;
use crate::traits::{Model, ModelKind};

pub struct EwmaKind;

impl ModelKind for EwmaKind {
    fn name(&self) -> &'static str {
        "ewma"
    }

    fn default_parameters(&self) -> Value {
        json!({ "alpha": 0.1, "threshold": 3.0 })
    }

    fn create(&self, params: &Value) -> ModeldResult<Box<dyn Model>> {
        let alpha = float_param(params, "alpha", 0.1)?;
        let threshold = float_param(params, "threshold", 3.0)?;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(ModeldError::ConfigurationInvalid(format!(
                "ewma alpha must be in (0, 1], got {}",
                alpha
            )));
        }
        if threshold <= 0.0 {
            return Err(ModeldError::ConfigurationInvalid(format!(
                "ewma threshold must be positive, got {}",
                threshold
            )));
        }
        Ok(Box::new(Ewma {
            alpha,
            threshold,
            mean: 0.0,
            variance: 0.0,
            count: 0,
        }))
    }

    fn restore(&self, state: Value) -> ModeldResult<Box<dyn Model>> {
        let ewma: Ewma = serde_json::from_value(state)
            .map_err(|e| ModeldError::Corrupt(format!("ewma state: {}", e)))?;
        Ok(Box::new(ewma))
    }
}

fn float_param(params: &Value, key: &str, default: f64) -> ModeldResult<f64> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_f64()
            .filter(|f| f.is_finite())
            .ok_or_else(|| ModeldError::ConfigurationInvalid(format!("ewma {} = {}", key, v))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ewma {
    pub alpha: f64,
    pub threshold: f64,
    pub mean: f64,
    pub variance: f64,
    pub count: u64,
}

impl Model for Ewma {
    fn run(&mut self, input: Value) -> ModeldResult<Value> {
        let value = numeric_input(&input)?;

        let score = if self.count == 0 {
            self.mean = value;
            self.variance = 0.0;
            0.0
        } else {
            let diff = value - self.mean;
            let stddev = self.variance.sqrt();
            let score = if stddev > 0.0 { diff.abs() / stddev } else { 0.0 };
            let increment = self.alpha * diff;
            self.mean += increment;
            self.variance = (1.0 - self.alpha) * (self.variance + diff * increment);
            score
        };
        self.count += 1;

        Ok(json!({
            "value": value,
            "mean": self.mean,
            "stddev": self.variance.sqrt(),
            "score": score,
            "anomaly": score > self.threshold,
            "count": self.count,
        }))
    }

    fn state(&self) -> ModeldResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}
