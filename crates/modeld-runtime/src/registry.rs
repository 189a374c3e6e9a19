//! Lookup table of model kinds

use std::collections::HashMap;
use std::sync::Arc;

use modeld_core::{ModeldError, ModeldResult};
use serde_json::Value;
use tracing::debug;

use crate::models::{CounterKind, EwmaKind};
use crate::traits::ModelKind;

/// Model kinds known to the worker, built once at startup
#[derive(Clone, Default)]
pub struct ModelRegistry {
    kinds: HashMap<String, Arc<dyn ModelKind>>,
    /// Configured parameters merged over each kind's defaults
    overrides: HashMap<String, Value>,
}

impl ModelRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in kinds
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CounterKind));
        registry.register(Arc::new(EwmaKind));
        registry
    }

    /// Apply per-kind parameter overrides, typically `WorkerConfig::models`
    pub fn with_overrides(mut self, overrides: HashMap<String, Value>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn register(&mut self, kind: Arc<dyn ModelKind>) {
        debug!(kind = kind.name(), "Registered model kind");
        self.kinds.insert(kind.name().to_string(), kind);
    }

    pub fn get(&self, name: &str) -> ModeldResult<Arc<dyn ModelKind>> {
        self.kinds
            .get(name)
            .cloned()
            .ok_or_else(|| ModeldError::UnknownModelKind(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kinds.contains_key(name)
    }

    /// Registered kind names, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut names: Vec<String> = self.kinds.keys().cloned().collect();
        names.sort();
        names
    }

    /// Defaults for `name` with any configured override merged on top
    pub fn default_parameters(&self, name: &str) -> ModeldResult<Value> {
        let mut params = self.get(name)?.default_parameters();
        if let Some(overrides) = self.overrides.get(name) {
            merge(&mut params, overrides);
        }
        Ok(params)
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

fn merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                merge(base.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}
