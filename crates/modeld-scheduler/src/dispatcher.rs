//! Per-entity request dispatcher
//!
//! Every operation on an entity runs under that entity's lock from the
//! [`LockTable`]. Admission into the resident cache may evict another entity;
//! dirty evictions are written back in a batch after the lock is released,
//! each under the evicted entity's own lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use modeld_core::{
    validate_entity_name, EntityGuard, FlushMode, LockTable, ModeldError, ModeldResult,
    Resident, WorkerConfig,
};
use modeld_runtime::{Lifecycle, ModelInstance, ModelRegistry};
use modeld_store::{
    CacheLease, CacheStats, Checkout, ResidentCache, ResidentInfo, SnapshotMeta, SnapshotStore,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Payload of a run request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    /// Model kind to use if the entity has none yet
    #[serde(default)]
    pub model: Option<String>,
    /// Input handed to the model
    #[serde(default)]
    pub input: Value,
}

/// Outcome of a batch write-back
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    /// Entities written to the store
    pub flushed: Vec<String>,
    /// Entities that could not be written, with the reason
    pub failed: Vec<FlushFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushFailure {
    pub name: String,
    pub error: String,
}

impl FlushReport {
    /// Error out if any entity failed
    pub fn into_result(self) -> ModeldResult<Self> {
        if self.failed.is_empty() {
            return Ok(self);
        }
        let names: Vec<&str> = self.failed.iter().map(|f| f.name.as_str()).collect();
        Err(ModeldError::StoreWriteFailure(format!(
            "{} of {} entities failed to flush: {}",
            self.failed.len(),
            self.failed.len() + self.flushed.len(),
            names.join(", ")
        )))
    }
}

/// Worker state snapshot
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub cache: CacheStats,
    pub resident: Vec<ResidentInfo>,
    pub pending: Vec<String>,
    pub locks_held: usize,
    /// Entities with a checkpoint directory
    pub stored_entities: usize,
    /// Generations kept per entity
    pub retention: usize,
    pub kinds: Vec<String>,
    pub default_model: String,
    pub checkpoint_root: PathBuf,
}

struct Shared {
    store: Arc<SnapshotStore>,
    cache: ResidentCache<ModelInstance>,
    locks: LockTable,
    lifecycle: Lifecycle,
    /// Serializes write-back batches
    flush_lock: Mutex<()>,
    flush_mode: FlushMode,
    lock_timeout: Duration,
    default_model: String,
}

/// Entity request dispatcher
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Build a dispatcher over an existing store and registry
    pub fn new(
        config: &WorkerConfig,
        store: Arc<SnapshotStore>,
        registry: Arc<ModelRegistry>,
    ) -> ModeldResult<Self> {
        let default_model = config.dispatcher.default_model.clone();
        if !registry.contains(&default_model) {
            return Err(ModeldError::Config(format!(
                "default model '{}' is not registered (known: {})",
                default_model,
                registry.kinds().join(", ")
            )));
        }

        info!(
            capacity = config.cache.capacity,
            flush_mode = ?config.cache.flush_mode,
            default_model = %default_model,
            root = %store.root().display(),
            "Dispatcher initialized"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                cache: ResidentCache::new(config.cache.capacity, Arc::clone(&store)),
                lifecycle: Lifecycle::new(Arc::clone(&store), registry, &default_model),
                store,
                locks: LockTable::new(),
                flush_mode: config.cache.flush_mode,
                lock_timeout: config.dispatcher.lock_timeout(),
                flush_lock: Mutex::new(()),
                default_model,
            }),
        })
    }

    /// Build the store and registry from configuration
    pub fn from_config(config: &WorkerConfig) -> ModeldResult<Self> {
        let store = Arc::new(SnapshotStore::from_config(&config.storage));
        let registry = Arc::new(ModelRegistry::builtin().with_overrides(config.models.clone()));
        Self::new(config, store, registry)
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.shared.store
    }

    pub fn locks(&self) -> &LockTable {
        &self.shared.locks
    }

    /// Run one input through the model of `name`
    pub async fn handle(&self, name: &str, request: RunRequest) -> ModeldResult<Value> {
        let RunRequest { model, input } = request;
        let (guard, checkout, lease, evicted) = self.admit(name).await?;

        let result = async {
            let (checkout, instance) = self
                .shared
                .lifecycle
                .initialize(checkout, lease, model.as_deref())
                .await?;
            self.shared
                .lifecycle
                .scoped(checkout, instance, move |m| m.run(input))
                .await
        }
        .await;

        drop(guard);
        self.after_eviction(evicted).await;
        result
    }

    /// Snapshot `name` now.
    ///
    /// An entity that is not in memory is already as new as its committed
    /// snapshot, whose metadata is returned without loading it.
    pub async fn save(&self, name: &str) -> ModeldResult<SnapshotMeta> {
        let (guard, held, evicted) = self.admit_resident(name).await?;

        let result = match held {
            Some((checkout, instance)) => {
                match self.shared.lifecycle.save(instance, Utc::now()).await {
                    Ok((instance, Ok(meta))) => {
                        checkout.checkin_saved(instance).await;
                        Ok(meta)
                    }
                    Ok((instance, Err(e))) => {
                        checkout.checkin(Some(instance)).await;
                        Err(e)
                    }
                    Err(e) => {
                        checkout.checkin(None).await;
                        Err(e)
                    }
                }
            }
            None => self
                .shared
                .store
                .latest(name)
                .await
                .and_then(|meta| meta.ok_or_else(|| ModeldError::NotFound(name.to_string()))),
        };

        drop(guard);
        self.after_eviction(evicted).await;
        result
    }

    /// Change the auto-save delay of `name`, creating its model if needed
    pub async fn set_save_delay(&self, name: &str, secs: u64) -> ModeldResult<()> {
        let (guard, checkout, lease, evicted) = self.admit(name).await?;

        let result = async {
            let (checkout, mut instance) = self
                .shared
                .lifecycle
                .initialize(checkout, lease, None)
                .await?;
            instance.set_save_delay(secs);
            checkout.checkin_changed(instance).await;
            info!(name = name, save_delay_secs = secs, "Save delay updated");
            Ok::<(), ModeldError>(())
        }
        .await;

        drop(guard);
        self.after_eviction(evicted).await;
        result
    }

    /// Current snapshot bytes of `name`; the in-memory state when resident.
    ///
    /// Reading a stored entity does not admit it into the cache.
    pub async fn get_snapshot(&self, name: &str) -> ModeldResult<Vec<u8>> {
        let (guard, held, evicted) = self.admit_resident(name).await?;

        let result = match held {
            Some((checkout, instance)) => {
                let encoded = tokio::task::spawn_blocking(move || {
                    let bytes = instance.encode();
                    (instance, bytes)
                })
                .await;
                match encoded {
                    Ok((instance, bytes)) => {
                        checkout.checkin(Some(instance)).await;
                        bytes
                    }
                    Err(e) => {
                        checkout.checkin(None).await;
                        Err(e.into())
                    }
                }
            }
            None => self.shared.store.load(name).await,
        };

        drop(guard);
        self.after_eviction(evicted).await;
        result
    }

    /// Install uploaded snapshot bytes as the state of `name`
    pub async fn put_snapshot(&self, name: &str, bytes: Vec<u8>) -> ModeldResult<SnapshotMeta> {
        validate_entity_name(name)?;
        let instance = self
            .shared
            .lifecycle
            .decode(name, bytes.clone())
            .await
            .map_err(|e| match e {
                ModeldError::Corrupt(msg) => ModeldError::InvalidRequest(msg),
                other => other,
            })?;
        let kind = instance.kind().to_string();

        let (guard, checkout, lease, evicted) = self.admit(name).await?;

        let result = async {
            match self.shared.store.save(name, bytes).await {
                Ok(meta) => {
                    checkout.checkin_saved(instance).await;
                    self.shared.store.set_model_kind(name, &kind).await?;
                    info!(name = name, kind = %kind, generation = meta.generation, "Snapshot installed");
                    Ok(meta)
                }
                Err(e) => {
                    let previous = match lease {
                        CacheLease::Resident(old) => Some(old),
                        _ => None,
                    };
                    checkout.checkin(previous).await;
                    Err(e)
                }
            }
        }
        .await;

        drop(guard);
        self.after_eviction(evicted).await;
        result
    }

    /// Discard all state of `name`, optionally replacing its parameters.
    ///
    /// Resetting an entity that has no state is not an error.
    pub async fn reset_entity(&self, name: &str, params: Option<Value>) -> ModeldResult<()> {
        validate_entity_name(name)?;
        let _guard = self.shared.locks.acquire(name, self.shared.lock_timeout).await?;

        if let Some(ref params) = params {
            self.check_parameters(name, params).await?;
        }

        self.shared.cache.remove(name).await;
        self.shared.store.reset(name).await?;
        if let Some(params) = params {
            self.shared.store.set_parameters(name, &params).await?;
        }

        info!(name = name, "Entity reset");
        Ok(())
    }

    /// Write back every dirty resident and evicted entity
    pub async fn flush_all(&self) -> ModeldResult<FlushReport> {
        let _flush = self.shared.flush_lock.lock().await;

        let mut names = self.shared.cache.resident_names().await;
        names.extend(self.shared.cache.pending_names().await);
        names.sort();
        names.dedup();

        let results = join_all(names.iter().map(|name| self.flush_one(name, true))).await;
        let report = collect_report(names, results);
        info!(
            flushed = report.flushed.len(),
            failed = report.failed.len(),
            "Flushed all entities"
        );
        report.into_result()
    }

    /// Write back entities evicted from the cache
    pub async fn flush_evicted(&self) -> ModeldResult<FlushReport> {
        let _flush = self.shared.flush_lock.lock().await;

        let names = self.shared.cache.pending_names().await;
        if names.is_empty() {
            return Ok(FlushReport::default());
        }

        let results = join_all(names.iter().map(|name| self.flush_one(name, false))).await;
        let report = collect_report(names, results);
        debug!(
            flushed = report.flushed.len(),
            failed = report.failed.len(),
            "Flushed evicted entities"
        );
        report.into_result()
    }

    pub async fn status(&self) -> ModeldResult<WorkerStatus> {
        Ok(WorkerStatus {
            cache: self.shared.cache.stats().await,
            resident: self.shared.cache.list().await,
            pending: self.shared.cache.pending_names().await,
            locks_held: self.shared.locks.len(),
            stored_entities: self.shared.store.list_entities().await?.len(),
            retention: self.shared.store.retention(),
            kinds: self.shared.lifecycle.registry().kinds(),
            default_model: self.shared.default_model.clone(),
            checkpoint_root: self.shared.store.root().to_path_buf(),
        })
    }

    /// Lock `name`, admit it into the cache and evict down to capacity
    async fn admit(
        &self,
        name: &str,
    ) -> ModeldResult<(
        EntityGuard,
        Checkout<ModelInstance>,
        CacheLease<ModelInstance>,
        bool,
    )> {
        validate_entity_name(name)?;
        let guard = self.shared.locks.acquire(name, self.shared.lock_timeout).await?;
        let (checkout, lease) = self.shared.cache.acquire(name).await?;
        let evicted_dirty = self.evict_to_capacity().await;
        Ok((guard, checkout, lease, evicted_dirty))
    }

    /// Lock `name` and check out its in-memory handle, if it has one
    async fn admit_resident(
        &self,
        name: &str,
    ) -> ModeldResult<(EntityGuard, Option<(Checkout<ModelInstance>, ModelInstance)>, bool)> {
        validate_entity_name(name)?;
        let guard = self.shared.locks.acquire(name, self.shared.lock_timeout).await?;
        let held = self.shared.cache.acquire_resident(name).await?;
        // Only a handle revived from the write-back set takes a new slot.
        let evicted_dirty = match held {
            Some(_) => self.evict_to_capacity().await,
            None => false,
        };
        Ok((guard, held, evicted_dirty))
    }

    async fn evict_to_capacity(&self) -> bool {
        let mut evicted_dirty = false;
        while let Some(eviction) = self.shared.cache.evict_if_over_capacity().await {
            evicted_dirty |= eviction.dirty;
        }
        evicted_dirty
    }

    async fn check_parameters(&self, name: &str, params: &Value) -> ModeldResult<()> {
        let lifecycle = &self.shared.lifecycle;
        let kind = lifecycle.resolve_kind(name, None).await?;
        let factory = lifecycle.registry().get(&kind)?;
        let params = params.clone();
        tokio::task::spawn_blocking(move || factory.create(&params).map(|_| ())).await?
    }

    async fn after_eviction(&self, evicted_dirty: bool) {
        if !evicted_dirty {
            return;
        }
        match self.shared.flush_mode {
            FlushMode::Deferred => {
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.flush_evicted().await {
                        warn!(error = %e, "Deferred write-back failed");
                    }
                });
            }
            FlushMode::Inline => {
                if let Err(e) = self.flush_evicted().await {
                    warn!(error = %e, "Write-back failed");
                }
            }
        }
    }

    /// Flush one entity under its own lock. Returns whether anything was written.
    async fn flush_one(&self, name: &str, include_resident: bool) -> ModeldResult<bool> {
        let _guard = self.shared.locks.acquire(name, self.shared.lock_timeout).await?;
        let mut written = self.shared.cache.flush_pending(name).await?;
        if include_resident {
            written |= self.shared.cache.flush_entry(name).await?;
        }
        Ok(written)
    }
}

fn collect_report(names: Vec<String>, results: Vec<ModeldResult<bool>>) -> FlushReport {
    let mut report = FlushReport::default();
    for (name, result) in names.into_iter().zip(results) {
        match result {
            Ok(true) => report.flushed.push(name),
            Ok(false) => {}
            Err(e) => {
                warn!(name = %name, error = %e, "Flush failed");
                report.failed.push(FlushFailure {
                    name,
                    error: e.to_string(),
                });
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use modeld_runtime::SavedModel;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(tmp: &TempDir, capacity: usize, flush_mode: FlushMode) -> WorkerConfig {
        let mut config = WorkerConfig::default();
        config.storage.checkpoint_root = tmp.path().join("models");
        config.storage.compress = false;
        config.cache.capacity = capacity;
        config.cache.flush_mode = flush_mode;
        config.dispatcher.lock_timeout_secs = 1;
        config.dispatcher.default_model = "counter".to_string();
        config
    }

    async fn dispatcher(tmp: &TempDir, capacity: usize, flush_mode: FlushMode) -> Dispatcher {
        let dispatcher = Dispatcher::from_config(&config(tmp, capacity, flush_mode)).unwrap();
        dispatcher.store().init().await.unwrap();
        dispatcher
    }

    fn count(output: &Value) -> u64 {
        output["count"].as_u64().unwrap()
    }

    async fn run(d: &Dispatcher, name: &str) -> u64 {
        count(&d.handle(name, RunRequest::default()).await.unwrap())
    }

    fn decode(bytes: &[u8]) -> SavedModel {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_default_model_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(&tmp, 2, FlushMode::Inline);
        config.dispatcher.default_model = "lstm".to_string();
        assert!(matches!(
            Dispatcher::from_config(&config),
            Err(ModeldError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_capacity_two_scenario() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 2, FlushMode::Inline).await;

        assert_eq!(run(&d, "a").await, 1);
        assert_eq!(run(&d, "b").await, 1);
        assert_eq!(run(&d, "c").await, 1);

        let status = d.status().await.unwrap();
        let resident: Vec<&str> = status.resident.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(resident, vec!["b", "c"]);
        assert!(status.pending.is_empty());

        let saved = decode(&d.store().load("a").await.unwrap());
        assert_eq!(saved.model_kind, "counter");
        assert_eq!(saved.state["count"], 1);

        assert_eq!(run(&d, "a").await, 2);
    }

    #[tokio::test]
    async fn test_deferred_eviction_never_reads_stale_state() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 1, FlushMode::Deferred).await;

        for round in 1..=20u64 {
            assert_eq!(run(&d, "a").await, round);
            assert_eq!(run(&d, "b").await, round);
        }

        d.flush_all().await.unwrap();
        for name in ["a", "b"] {
            let saved = decode(&d.store().load(name).await.unwrap());
            assert_eq!(saved.state["count"], 20, "{}", name);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_are_serialized() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 4, FlushMode::Deferred).await;

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let d = d.clone();
                tokio::spawn(async move { run(&d, "shared").await })
            })
            .collect();

        let mut counts = Vec::new();
        for task in tasks {
            counts.push(task.await.unwrap());
        }
        counts.sort();
        assert_eq!(counts, (1..=32).collect::<Vec<u64>>());
        assert!(d.locks().is_empty());
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 2, FlushMode::Inline).await;

        let _held = d
            .locks()
            .acquire("busy", Duration::from_secs(1))
            .await
            .unwrap();
        let err = d.handle("busy", RunRequest::default()).await.unwrap_err();
        assert!(matches!(err, ModeldError::LockTimeout { .. }));
        assert_eq!(run(&d, "free").await, 1);
    }

    #[tokio::test]
    async fn test_invalid_input_and_names() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 2, FlushMode::Inline).await;

        let err = d.handle("../etc", RunRequest::default()).await.unwrap_err();
        assert!(matches!(err, ModeldError::InvalidRequest(_)));

        let bad = RunRequest {
            model: None,
            input: json!("not a number"),
        };
        let err = d.handle("x", bad).await.unwrap_err();
        assert!(matches!(err, ModeldError::ComputationFailure(_)));
        // The failed call left the model usable and unchanged.
        assert_eq!(run(&d, "x").await, 1);
    }

    #[tokio::test]
    async fn test_kind_is_fixed_per_entity() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 2, FlushMode::Inline).await;

        let ewma = RunRequest {
            model: Some("ewma".to_string()),
            input: json!(1.5),
        };
        let out = d.handle("temp", ewma).await.unwrap();
        assert_eq!(out["mean"], 1.5);

        let counter = RunRequest {
            model: Some("counter".to_string()),
            input: json!(1),
        };
        let err = d.handle("temp", counter).await.unwrap_err();
        assert!(matches!(err, ModeldError::ConfigurationInvalid(_)));
    }

    #[tokio::test]
    async fn test_save() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 2, FlushMode::Inline).await;

        assert!(matches!(
            d.save("ghost").await,
            Err(ModeldError::NotFound(_))
        ));

        run(&d, "x").await;
        run(&d, "x").await;
        let meta = d.save("x").await.unwrap();
        assert_eq!(meta.entity, "x");
        assert_eq!(d.status().await.unwrap().cache.dirty, 0);

        let saved = decode(&d.store().load("x").await.unwrap());
        assert_eq!(saved.state["count"], 2);
    }

    #[tokio::test]
    async fn test_get_snapshot_prefers_memory() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 2, FlushMode::Inline).await;

        assert!(matches!(
            d.get_snapshot("x").await,
            Err(ModeldError::NotFound(_))
        ));
        assert!(d.status().await.unwrap().resident.is_empty());

        run(&d, "x").await;
        d.save("x").await.unwrap();
        run(&d, "x").await;

        let snapshot = decode(&d.get_snapshot("x").await.unwrap());
        assert_eq!(snapshot.state["count"], 2);
        let stored = decode(&d.store().load("x").await.unwrap());
        assert_eq!(stored.state["count"], 1);
    }

    #[tokio::test]
    async fn test_put_snapshot() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 2, FlushMode::Inline).await;

        for _ in 0..5 {
            run(&d, "source").await;
        }
        let bytes = d.get_snapshot("source").await.unwrap();

        run(&d, "target").await;
        d.put_snapshot("target", bytes).await.unwrap();
        assert_eq!(run(&d, "target").await, 6);

        let err = d
            .put_snapshot("target", b"garbage".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ModeldError::InvalidRequest(_)));
        assert_eq!(run(&d, "target").await, 7);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 2, FlushMode::Inline).await;

        run(&d, "x").await;
        d.save("x").await.unwrap();
        run(&d, "x").await;

        d.reset_entity("x", None).await.unwrap();
        d.reset_entity("x", None).await.unwrap();
        d.reset_entity("never-seen", None).await.unwrap();

        assert!(matches!(
            d.get_snapshot("x").await,
            Err(ModeldError::NotFound(_))
        ));
        assert_eq!(run(&d, "x").await, 1);
    }

    #[tokio::test]
    async fn test_reset_with_parameters() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 2, FlushMode::Inline).await;

        run(&d, "x").await;
        let err = d
            .reset_entity("x", Some(json!({ "start": "ten" })))
            .await
            .unwrap_err();
        assert!(matches!(err, ModeldError::ConfigurationInvalid(_)));
        assert_eq!(run(&d, "x").await, 2);

        d.reset_entity("x", Some(json!({ "start": 10 })))
            .await
            .unwrap();
        assert_eq!(run(&d, "x").await, 11);
        assert_eq!(
            d.store().get_parameters("x").await.unwrap().unwrap(),
            json!({ "start": 10 })
        );
    }

    #[tokio::test]
    async fn test_set_save_delay() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 2, FlushMode::Inline).await;

        d.set_save_delay("x", 30).await.unwrap();
        let snapshot = decode(&d.get_snapshot("x").await.unwrap());
        assert_eq!(snapshot.save_delay_secs, 30);
        assert_eq!(d.status().await.unwrap().cache.dirty, 1);
    }

    #[tokio::test]
    async fn test_huge_save_delay_keeps_entity_usable() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 2, FlushMode::Inline).await;

        for (i, secs) in [10_000_000_000_000_000, u64::MAX].into_iter().enumerate() {
            let name = format!("x{}", i);
            d.set_save_delay(&name, secs).await.unwrap();
            assert_eq!(run(&d, &name).await, 1);
            assert_eq!(run(&d, &name).await, 2);
            assert!(d.store().load(&name).await.is_err());
        }

        let status = d.status().await.unwrap();
        assert_eq!(status.cache.in_use, 0);
        assert_eq!(status.cache.discarded, 0);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_entity_dirty() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 2, FlushMode::Inline).await;

        run(&d, "x").await;
        let meta = d.save("x").await.unwrap();
        run(&d, "x").await;

        // Move the committed generation far ahead and block the blob path of
        // the one after it with a non-empty directory.
        let dir = d.store().entity_dir("x");
        let blob = |generation: u64| dir.join(format!("checkpoint-{:020}.snap", generation));
        let pinned: u64 = 4_000_000_000_000_000;
        std::fs::rename(blob(meta.generation), blob(pinned)).unwrap();
        let pointer = SnapshotMeta {
            generation: pinned,
            ..meta
        };
        std::fs::write(dir.join("checkpoint"), serde_json::to_vec(&pointer).unwrap()).unwrap();
        std::fs::create_dir(blob(pinned + 1)).unwrap();
        std::fs::write(blob(pinned + 1).join("keep"), b"x").unwrap();

        let err = d.save("x").await.unwrap_err();
        assert!(matches!(err, ModeldError::StoreWriteFailure(_)), "{:?}", err);
        let err = d.flush_all().await.unwrap_err();
        assert!(matches!(err, ModeldError::StoreWriteFailure(_)), "{:?}", err);

        let stored = decode(&d.store().load("x").await.unwrap());
        assert_eq!(stored.state["count"], 1);
        let status = d.status().await.unwrap();
        assert_eq!(status.cache.dirty, 1);
        assert_eq!(status.cache.in_use, 0);
        assert_eq!(status.resident[0].name, "x");
        let leftovers: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);

        std::fs::remove_dir_all(blob(pinned + 1)).unwrap();
        let retried = d.save("x").await.unwrap();
        assert_eq!(retried.generation, pinned + 1);
        assert_eq!(decode(&d.store().load("x").await.unwrap()).state["count"], 2);
        assert_eq!(d.status().await.unwrap().cache.dirty, 0);
    }

    #[tokio::test]
    async fn test_reading_stored_entity_does_not_evict() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 1, FlushMode::Inline).await;

        run(&d, "a").await;
        let committed = d.save("a").await.unwrap();
        run(&d, "b").await;

        let snapshot = decode(&d.get_snapshot("a").await.unwrap());
        assert_eq!(snapshot.state["count"], 1);
        assert_eq!(d.save("a").await.unwrap(), committed);
        assert!(matches!(
            d.get_snapshot("ghost").await,
            Err(ModeldError::NotFound(_))
        ));

        let status = d.status().await.unwrap();
        let resident: Vec<&str> = status.resident.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(resident, vec!["b"]);
        assert!(status.pending.is_empty());
        assert_eq!(status.cache.dirty, 1);
        assert!(d.store().load("b").await.is_err());
    }

    #[tokio::test]
    async fn test_status_reports_store() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 2, FlushMode::Inline).await;

        let status = d.status().await.unwrap();
        assert_eq!(status.stored_entities, 0);
        assert_eq!(status.retention, 2);

        run(&d, "a").await;
        run(&d, "b").await;
        let status = d.status().await.unwrap();
        assert_eq!(status.stored_entities, 2);
        assert_eq!(status.cache.discarded, 0);
        assert_eq!(status.cache.lost_changes, 0);
    }

    #[tokio::test]
    async fn test_flush_all_persists_everything() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 4, FlushMode::Deferred).await;

        for name in ["a", "b", "c"] {
            run(&d, name).await;
        }
        let report = d.flush_all().await.unwrap();
        assert_eq!(report.flushed.len(), 3);
        assert!(report.failed.is_empty());

        for name in ["a", "b", "c"] {
            assert!(d.store().load(name).await.is_ok(), "{}", name);
        }
        let status = d.status().await.unwrap();
        assert_eq!(status.cache.dirty, 0);
        assert!(status.pending.is_empty());

        // Nothing left to write.
        assert!(d.flush_all().await.unwrap().flushed.is_empty());
    }

    #[tokio::test]
    async fn test_flush_evicted_leaves_resident_alone() {
        let tmp = TempDir::new().unwrap();
        let d = dispatcher(&tmp, 1, FlushMode::Inline).await;

        run(&d, "a").await;
        assert!(d.flush_evicted().await.unwrap().flushed.is_empty());
        assert!(d.store().load("a").await.is_err());

        run(&d, "b").await;
        assert!(d.store().load("a").await.is_ok());
        assert!(d.store().load("b").await.is_err());
    }
}
