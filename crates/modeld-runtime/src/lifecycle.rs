//! Model lifecycle
//!
//! An entity's model goes `Ready -> Running -> Ready` on every run and passes
//! through `Saved` after each snapshot. An entity with no instance in the
//! cache is uninitialized; `Lifecycle::initialize` turns a cache lease into a
//! ready instance by reviving, restoring or creating it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use modeld_core::{ModeldError, ModeldResult, Resident};
use modeld_store::{CacheLease, Checkout, SnapshotMeta, SnapshotStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::registry::ModelRegistry;
use crate::traits::Model;

/// Lifecycle phase of a live instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Ready,
    Running,
    Saved,
}

/// Snapshot envelope written to the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedModel {
    pub model_kind: String,
    pub last_save_time: DateTime<Utc>,
    pub save_delay_secs: u64,
    pub state: Value,
}

/// A live model for one entity
pub struct ModelInstance {
    name: String,
    kind: String,
    phase: Phase,
    last_save_time: DateTime<Utc>,
    /// Auto-save interval, 0 disables auto-save
    save_delay_secs: u64,
    unit: Box<dyn Model>,
}

impl ModelInstance {
    /// Wrap a freshly created unit. Its save clock starts at `created`.
    pub fn new(name: &str, kind: &str, unit: Box<dyn Model>, created: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            phase: Phase::Ready,
            last_save_time: created,
            save_delay_secs: 0,
            unit,
        }
    }

    /// Rebuild an instance from snapshot bytes
    pub fn decode(name: &str, bytes: &[u8], registry: &ModelRegistry) -> ModeldResult<Self> {
        let saved: SavedModel = serde_json::from_slice(bytes)
            .map_err(|e| ModeldError::Corrupt(format!("snapshot of '{}': {}", name, e)))?;
        let unit = registry.get(&saved.model_kind)?.restore(saved.state)?;
        Ok(Self {
            name: name.to_string(),
            kind: saved.model_kind,
            phase: Phase::Ready,
            last_save_time: saved.last_save_time,
            save_delay_secs: saved.save_delay_secs,
            unit,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn last_save_time(&self) -> DateTime<Utc> {
        self.last_save_time
    }

    pub fn save_delay_secs(&self) -> u64 {
        self.save_delay_secs
    }

    pub fn set_save_delay(&mut self, secs: u64) {
        self.save_delay_secs = secs;
    }

    /// Feed one input to the unit
    pub fn run(&mut self, input: Value) -> ModeldResult<Value> {
        self.phase = Phase::Running;
        let output = self.unit.run(input);
        self.phase = Phase::Ready;
        output
    }

    /// Whether an auto-save is due at `now`
    pub fn save_due(&self, now: DateTime<Utc>) -> bool {
        if self.save_delay_secs == 0 {
            return false;
        }
        // Delays beyond chrono's range never come due.
        let Some(delay) = i64::try_from(self.save_delay_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
        else {
            return false;
        };
        now.signed_duration_since(self.last_save_time) > delay
    }

    pub fn envelope(&self) -> ModeldResult<SavedModel> {
        Ok(SavedModel {
            model_kind: self.kind.clone(),
            last_save_time: self.last_save_time,
            save_delay_secs: self.save_delay_secs,
            state: self.unit.state()?,
        })
    }
}

impl Resident for ModelInstance {
    fn encode(&self) -> ModeldResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.envelope()?)?)
    }
}

impl std::fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelInstance")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("phase", &self.phase)
            .field("last_save_time", &self.last_save_time)
            .field("save_delay_secs", &self.save_delay_secs)
            .finish()
    }
}

/// Create/load/run/save driver
pub struct Lifecycle {
    store: Arc<SnapshotStore>,
    registry: Arc<ModelRegistry>,
    /// Kind used when neither the store nor the request names one
    default_kind: String,
}

impl Lifecycle {
    pub fn new(store: Arc<SnapshotStore>, registry: Arc<ModelRegistry>, default_kind: &str) -> Self {
        Self {
            store,
            registry,
            default_kind: default_kind.to_string(),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Turn a cache lease into a ready instance.
    ///
    /// On failure the checkout is handed back: a resident instance is kept,
    /// anything else leaves the entry empty for the next attempt.
    pub async fn initialize(
        &self,
        checkout: Checkout<ModelInstance>,
        lease: CacheLease<ModelInstance>,
        requested: Option<&str>,
    ) -> ModeldResult<(Checkout<ModelInstance>, ModelInstance)> {
        let name = checkout.name().to_string();
        let result = match lease {
            CacheLease::Resident(instance) => match check_requested(&instance, requested) {
                Ok(()) => return Ok((checkout, instance)),
                Err(e) => {
                    checkout.checkin(Some(instance)).await;
                    return Err(e);
                }
            },
            CacheLease::Stored(bytes) => match self.decode(&name, bytes).await {
                Ok(instance) => check_requested(&instance, requested).map(|_| instance),
                Err(e) => Err(e),
            },
            CacheLease::Vacant => self.create(&name, requested).await,
        };

        match result {
            Ok(instance) => Ok((checkout, instance)),
            Err(e) => {
                warn!(name = %name, error = %e, "Model initialization failed");
                checkout.checkin(None).await;
                Err(e)
            }
        }
    }

    /// Decode snapshot bytes on the blocking pool
    pub async fn decode(&self, name: &str, bytes: Vec<u8>) -> ModeldResult<ModelInstance> {
        let registry = Arc::clone(&self.registry);
        let owned = name.to_string();
        let instance =
            tokio::task::spawn_blocking(move || ModelInstance::decode(&owned, &bytes, &registry))
                .await??;
        debug!(name = name, kind = %instance.kind, "Model restored from snapshot");
        Ok(instance)
    }

    /// Kind a new model for `name` gets
    pub async fn resolve_kind(&self, name: &str, requested: Option<&str>) -> ModeldResult<String> {
        let stored = self.store.get_model_kind(name).await?;
        match (stored, requested) {
            (Some(stored), Some(requested)) if stored != requested => {
                Err(ModeldError::ConfigurationInvalid(format!(
                    "'{}' is a {} model, not {}",
                    name, stored, requested
                )))
            }
            (Some(stored), _) => Ok(stored),
            (None, Some(requested)) => Ok(requested.to_string()),
            (None, None) => Ok(self.default_kind.clone()),
        }
    }

    async fn create(&self, name: &str, requested: Option<&str>) -> ModeldResult<ModelInstance> {
        let kind = self.resolve_kind(name, requested).await?;
        let factory = self.registry.get(&kind)?;

        let defaults = self.registry.default_parameters(&kind)?;
        self.store.set_default_parameters(name, &defaults).await?;
        let params = self.store.get_parameters(name).await?.unwrap_or(defaults);

        let unit = tokio::task::spawn_blocking(move || factory.create(&params)).await??;
        self.store.set_model_kind(name, &kind).await?;

        info!(name = name, kind = %kind, "Created model");
        Ok(ModelInstance::new(name, &kind, unit, Utc::now()))
    }

    /// Snapshot `instance` with `now` as its save time.
    ///
    /// The outer error means the instance was lost; the inner result is the
    /// store's. A failed save keeps the previous save time.
    pub async fn save(
        &self,
        instance: ModelInstance,
        now: DateTime<Utc>,
    ) -> ModeldResult<(ModelInstance, ModeldResult<SnapshotMeta>)> {
        let (mut instance, previous, encoded) = tokio::task::spawn_blocking(move || {
            let mut instance = instance;
            let previous = instance.last_save_time;
            instance.last_save_time = now;
            let encoded = instance.encode();
            (instance, previous, encoded)
        })
        .await?;

        let result = match encoded {
            Ok(bytes) => self.store.save(&instance.name, bytes).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(meta) => {
                instance.phase = Phase::Saved;
                info!(name = %instance.name, generation = meta.generation, "Model saved");
            }
            Err(e) => {
                instance.last_save_time = previous;
                warn!(name = %instance.name, error = %e, "Model save failed");
            }
        }
        Ok((instance, result))
    }

    /// Save if the instance's delay has elapsed. Returns whether it saved.
    pub async fn auto_save(
        &self,
        instance: ModelInstance,
        now: DateTime<Utc>,
    ) -> ModeldResult<(ModelInstance, bool)> {
        if !instance.save_due(now) {
            return Ok((instance, false));
        }
        let (instance, result) = self.save(instance, now).await?;
        Ok((instance, result.is_ok()))
    }

    /// Run `body` on the blocking pool, then auto-save, check the instance
    /// back in and mark it dirty, whatever `body` returned.
    pub async fn scoped<F, T>(
        &self,
        checkout: Checkout<ModelInstance>,
        instance: ModelInstance,
        body: F,
    ) -> ModeldResult<T>
    where
        F: FnOnce(&mut ModelInstance) -> ModeldResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let name = checkout.name().to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut instance = instance;
            let output = body(&mut instance);
            (instance, output)
        })
        .await;

        let (instance, output) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                error!(name = %name, error = %e, "Model panicked, dropping in-memory state");
                checkout.checkin(None).await;
                return Err(ModeldError::ComputationFailure(format!(
                    "model for '{}' panicked",
                    name
                )));
            }
        };

        match self.auto_save(instance, Utc::now()).await {
            Ok((instance, _)) => checkout.checkin_changed(instance).await,
            Err(e) => {
                error!(name = %name, error = %e, "Auto-save lost the model");
                checkout.checkin(None).await;
                return Err(e);
            }
        }
        output
    }
}

fn check_requested(instance: &ModelInstance, requested: Option<&str>) -> ModeldResult<()> {
    match requested {
        Some(kind) if kind != instance.kind => Err(ModeldError::ConfigurationInvalid(format!(
            "'{}' is a {} model, not {}",
            instance.name, instance.kind, kind
        ))),
        _ => Ok(()),
    }
}
