//! Resident model cache
//!
//! Keeps at most `capacity` model handles in memory. A request checks a handle
//! out with [`ResidentCache::acquire`] and gets a [`Checkout`] that pins the
//! entry until it is checked back in. A checkout that is dropped instead (an
//! early return, a cancelled future, a panic) releases the entry empty, so
//! the next request reloads the committed snapshot.
//!
//! Evicting a dirty entry moves its handle to a pending write-back set instead
//! of dropping it; the handle stays there until a flush commits it or a new
//! request revives it.
//!
//! Callers must hold the entity's lock from `modeld_core::LockTable` around
//! `acquire`/`checkin`, `flush_entry` and `flush_pending` for the same name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use modeld_core::{ModeldError, ModeldResult, Resident};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::checkpoint::SnapshotStore;

/// One resident entity
#[derive(Debug)]
struct CacheEntry<M> {
    /// Model handle; `None` while checked out or before initialization
    model: Option<M>,
    /// Logical access clock, larger is more recent
    tick: u64,
    /// Admission order, used to break ties
    seq: u64,
    /// Wall time of the last access
    last_accessed: DateTime<Utc>,
    /// Changes since the last committed snapshot
    unsaved: u64,
    /// Checked out by a request
    in_use: bool,
    /// Id of the current checkout
    lease: u64,
}

impl<M> CacheEntry<M> {
    fn touch(&mut self, tick: u64) {
        self.tick = tick;
        self.last_accessed = Utc::now();
    }

    fn dirty(&self) -> bool {
        self.unsaved > 0
    }
}

/// Evicted handle awaiting write-back
struct PendingEntry<M> {
    model: M,
    unsaved: u64,
}

struct CacheState<M> {
    entries: HashMap<String, CacheEntry<M>>,
    pending: HashMap<String, PendingEntry<M>>,
    clock: u64,
    next_seq: u64,
    next_lease: u64,
    /// Dirty handles lost without being written back
    discarded: u64,
    /// Changes those handles carried
    lost_changes: u64,
}

type SharedState<M> = Arc<RwLock<CacheState<M>>>;

impl<M> CacheState<M> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn lease(&mut self) -> u64 {
        self.next_lease += 1;
        self.next_lease
    }

    /// Insert a checked-out entry
    fn admit(&mut self, name: &str, unsaved: u64, lease: u64) {
        let tick = self.tick();
        self.next_seq += 1;
        self.entries.insert(
            name.to_string(),
            CacheEntry {
                model: None,
                tick,
                seq: self.next_seq,
                last_accessed: Utc::now(),
                unsaved,
                in_use: true,
                lease,
            },
        );
    }

    /// Return the handle of checkout `lease` to its entry and unpin it
    fn release(&mut self, name: &str, lease: u64, model: Option<M>) {
        let tick = self.tick();
        let Some(entry) = self.entries.get_mut(name) else {
            if model.is_some() {
                warn!(name = name, "Checked in after removal, discarding handle");
            }
            return;
        };
        if !entry.in_use || entry.lease != lease {
            warn!(name = name, "Stale checkout ignored");
            return;
        }

        let lost = if model.is_none() { entry.unsaved } else { 0 };
        if lost > 0 {
            entry.unsaved = 0;
        }
        entry.model = model;
        entry.in_use = false;
        entry.touch(tick);

        if lost > 0 {
            self.record_loss(name, lost);
        }
    }

    fn record_loss(&mut self, name: &str, unsaved: u64) {
        self.discarded += 1;
        self.lost_changes += unsaved;
        error!(
            name = name,
            unsaved_changes = unsaved,
            "Model state lost before write-back, reverting to the last snapshot"
        );
    }
}

/// What `acquire` found for a name
#[derive(Debug)]
pub enum CacheLease<M> {
    /// The resident (or revived) handle
    Resident(M),
    /// Not resident; the committed snapshot bytes from the store
    Stored(Vec<u8>),
    /// Neither resident nor stored
    Vacant,
}

/// Exclusive hold on one cache entry.
///
/// Hand the model back with [`Checkout::checkin`], [`Checkout::checkin_changed`]
/// or [`Checkout::checkin_saved`]. Dropping the checkout instead unpins the
/// entry without a handle.
#[must_use = "a dropped checkout discards the entry's handle"]
pub struct Checkout<M: Resident> {
    name: String,
    lease: u64,
    state: SharedState<M>,
    released: bool,
}

impl<M: Resident> Checkout<M> {
    /// Name of the checked-out entity
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return `model` unchanged; `None` leaves the entry empty
    pub async fn checkin(mut self, model: Option<M>) {
        let mut state = self.state.write().await;
        state.release(&self.name, self.lease, model);
        self.released = true;
    }

    /// Return `model` after it changed; the entry becomes dirty
    pub async fn checkin_changed(self, model: M) {
        self.checkin_counting(model, |unsaved| unsaved + 1).await;
    }

    /// Return `model` right after its state was committed; the entry becomes clean
    pub async fn checkin_saved(self, model: M) {
        self.checkin_counting(model, |_| 0).await;
    }

    async fn checkin_counting(mut self, model: M, update: impl FnOnce(u64) -> u64) {
        let mut state = self.state.write().await;
        state.release(&self.name, self.lease, Some(model));
        if let Some(entry) = state.entries.get_mut(&self.name) {
            if entry.lease == self.lease {
                entry.unsaved = update(entry.unsaved);
            }
        }
        self.released = true;
    }
}

impl<M: Resident> Drop for Checkout<M> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(name = %self.name, "Checkout dropped without checkin, releasing entry");

        if let Ok(mut state) = self.state.try_write() {
            state.release(&self.name, self.lease, None);
            return;
        }
        let state = Arc::clone(&self.state);
        let name = std::mem::take(&mut self.name);
        let lease = self.lease;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    state.write().await.release(&name, lease, None);
                });
            }
            Err(_) => error!(name = %name, "No runtime to release checkout, entry stays pinned"),
        }
    }
}

impl<M: Resident> fmt::Debug for Checkout<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkout")
            .field("name", &self.name)
            .field("lease", &self.lease)
            .finish()
    }
}

/// Result of an eviction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    /// Evicted entity
    pub name: String,
    /// Whether its handle was queued for write-back
    pub dirty: bool,
}

/// Resident entry summary
#[derive(Debug, Clone, Serialize)]
pub struct ResidentInfo {
    pub name: String,
    pub dirty: bool,
    pub unsaved_changes: u64,
    pub in_use: bool,
    pub last_accessed: DateTime<Utc>,
}

/// Resident cache manager
pub struct ResidentCache<M: Resident> {
    /// Maximum resident entries
    capacity: usize,
    /// Entries, pending write-backs and clocks
    state: SharedState<M>,
    /// Write-back target
    store: Arc<SnapshotStore>,
}

impl<M: Resident> ResidentCache<M> {
    /// Create an empty cache writing back into `store`
    pub fn new(capacity: usize, store: Arc<SnapshotStore>) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Arc::new(RwLock::new(CacheState {
                entries: HashMap::new(),
                pending: HashMap::new(),
                clock: 0,
                next_seq: 0,
                next_lease: 0,
                discarded: 0,
                lost_changes: 0,
            })),
            store,
        }
    }

    /// Maximum number of resident entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Backing snapshot store
    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    fn checkout(&self, name: &str, lease: u64) -> Checkout<M> {
        Checkout {
            name: name.to_string(),
            lease,
            state: Arc::clone(&self.state),
            released: false,
        }
    }

    /// Check out the handle for `name`, admitting an entry if needed.
    ///
    /// On a miss the entry is admitted empty first and the store is read
    /// afterwards, outside the cache lock.
    pub async fn acquire(&self, name: &str) -> ModeldResult<(Checkout<M>, CacheLease<M>)> {
        let checkout = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let tick = state.tick();
            let lease = state.lease();

            if let Some(entry) = state.entries.get_mut(name) {
                if entry.in_use {
                    return Err(already_checked_out(name));
                }
                entry.touch(tick);
                entry.in_use = true;
                entry.lease = lease;
                if let Some(model) = entry.model.take() {
                    debug!(name = name, "Cache hit");
                    return Ok((self.checkout(name, lease), CacheLease::Resident(model)));
                }
                // Admitted earlier but never initialized; fall through to the store.
            } else if let Some(pending) = state.pending.remove(name) {
                state.admit(name, pending.unsaved, lease);
                info!(name = name, "Revived entity awaiting write-back");
                return Ok((self.checkout(name, lease), CacheLease::Resident(pending.model)));
            } else {
                state.admit(name, 0, lease);
                debug!(name = name, "Cache miss, entry admitted");
            }
            self.checkout(name, lease)
        };

        match self.store.load(name).await {
            Ok(bytes) => Ok((checkout, CacheLease::Stored(bytes))),
            Err(ModeldError::NotFound(_)) => Ok((checkout, CacheLease::Vacant)),
            Err(e) => {
                checkout.checkin(None).await;
                Err(e)
            }
        }
    }

    /// Check out `name` only if its handle is in memory, resident or
    /// awaiting write-back. Nothing is admitted otherwise.
    pub async fn acquire_resident(&self, name: &str) -> ModeldResult<Option<(Checkout<M>, M)>> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let tick = state.tick();
        let lease = state.lease();

        if let Some(entry) = state.entries.get_mut(name) {
            if entry.in_use {
                return Err(already_checked_out(name));
            }
            let Some(model) = entry.model.take() else {
                return Ok(None);
            };
            entry.touch(tick);
            entry.in_use = true;
            entry.lease = lease;
            return Ok(Some((self.checkout(name, lease), model)));
        }

        match state.pending.remove(name) {
            Some(pending) => {
                state.admit(name, pending.unsaved, lease);
                info!(name = name, "Revived entity awaiting write-back");
                Ok(Some((self.checkout(name, lease), pending.model)))
            }
            None => Ok(None),
        }
    }

    /// Evict one entry if the cache holds more than `capacity`.
    ///
    /// The victim is the least recently used entry that is not checked out.
    /// Dirty victims move to the pending write-back set.
    pub async fn evict_if_over_capacity(&self) -> Option<Eviction> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        if state.entries.len() <= self.capacity {
            return None;
        }

        let victim = state
            .entries
            .iter()
            .filter(|(_, e)| !e.in_use)
            .min_by_key(|(_, e)| (e.tick, e.seq))
            .map(|(name, _)| name.clone());

        let Some(name) = victim else {
            warn!(
                resident = state.entries.len(),
                capacity = self.capacity,
                "Over capacity but every entry is checked out"
            );
            return None;
        };

        let entry = state.entries.remove(&name)?;
        let dirty = match (entry.dirty(), entry.model) {
            (true, Some(model)) => {
                state.pending.insert(
                    name.clone(),
                    PendingEntry {
                        model,
                        unsaved: entry.unsaved,
                    },
                );
                true
            }
            _ => false,
        };

        info!(name = %name, dirty = dirty, "Evicted entity from cache (LRU)");
        Some(Eviction { name, dirty })
    }

    /// Drop `name` without writing it back
    pub async fn remove(&self, name: &str) -> bool {
        let mut state = self.state.write().await;
        let resident = state.entries.remove(name).is_some();
        let pending = state.pending.remove(name).is_some();
        if resident || pending {
            info!(name = name, "Removed entity from cache without flushing");
        }
        resident || pending
    }

    /// Write a dirty resident entry to the store. Returns whether it wrote.
    ///
    /// On failure the entry stays dirty.
    pub async fn flush_entry(&self, name: &str) -> ModeldResult<bool> {
        let (checkout, model) = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let lease = state.lease();
            let Some(entry) = state.entries.get_mut(name) else {
                return Ok(false);
            };
            if !entry.dirty() || entry.in_use {
                return Ok(false);
            }
            let Some(model) = entry.model.take() else {
                return Ok(false);
            };
            entry.in_use = true;
            entry.lease = lease;
            (self.checkout(name, lease), model)
        };

        let (model, result) = match self.write_back(name, model).await {
            Ok(written) => written,
            Err(e) => {
                checkout.checkin(None).await;
                return Err(e);
            }
        };

        match result {
            Ok(()) => {
                checkout.checkin_saved(model).await;
                Ok(true)
            }
            Err(e) => {
                checkout.checkin(Some(model)).await;
                Err(e)
            }
        }
    }

    /// Write an evicted entry to the store. Returns whether it wrote.
    ///
    /// On failure the handle goes back to the pending set.
    pub async fn flush_pending(&self, name: &str) -> ModeldResult<bool> {
        let Some(PendingEntry { model, unsaved }) = self.state.write().await.pending.remove(name)
        else {
            return Ok(false);
        };

        let (model, result) = match self.write_back(name, model).await {
            Ok(written) => written,
            Err(e) => {
                self.state.write().await.record_loss(name, unsaved);
                return Err(e);
            }
        };
        if let Err(e) = result {
            warn!(name = name, error = %e, "Write-back failed, keeping entity pending");
            self.state
                .write()
                .await
                .pending
                .insert(name.to_string(), PendingEntry { model, unsaved });
            return Err(e);
        }
        Ok(true)
    }

    /// Encode on the blocking pool and save. The outer error means the handle was lost.
    async fn write_back(&self, name: &str, model: M) -> ModeldResult<(M, ModeldResult<()>)> {
        let (model, encoded) = tokio::task::spawn_blocking(move || {
            let encoded = model.encode();
            (model, encoded)
        })
        .await?;

        let result = match encoded {
            Ok(bytes) => self.store.save(name, bytes).await.map(|_| ()),
            Err(e) => Err(e),
        };
        Ok((model, result))
    }

    /// Whether `name` is resident
    pub async fn contains(&self, name: &str) -> bool {
        self.state.read().await.entries.contains_key(name)
    }

    /// Whether `name` is waiting for write-back
    pub async fn is_pending(&self, name: &str) -> bool {
        self.state.read().await.pending.contains_key(name)
    }

    /// Number of resident entries
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Names of resident entries, least recently used first
    pub async fn resident_names(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut entries: Vec<(&String, &CacheEntry<M>)> = state.entries.iter().collect();
        entries.sort_by_key(|(_, e)| (e.tick, e.seq));
        entries.into_iter().map(|(name, _)| name.clone()).collect()
    }

    /// Names of evicted entries awaiting write-back
    pub async fn pending_names(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state.pending.keys().cloned().collect();
        names.sort();
        names
    }

    /// Summaries of resident entries, least recently used first
    pub async fn list(&self) -> Vec<ResidentInfo> {
        let state = self.state.read().await;
        let mut entries: Vec<(&String, &CacheEntry<M>)> = state.entries.iter().collect();
        entries.sort_by_key(|(_, e)| (e.tick, e.seq));
        entries
            .into_iter()
            .map(|(name, e)| ResidentInfo {
                name: name.clone(),
                dirty: e.dirty(),
                unsaved_changes: e.unsaved,
                in_use: e.in_use,
                last_accessed: e.last_accessed,
            })
            .collect()
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;
        CacheStats {
            resident: state.entries.len(),
            capacity: self.capacity,
            dirty: state.entries.values().filter(|e| e.dirty()).count(),
            in_use: state.entries.values().filter(|e| e.in_use).count(),
            pending: state.pending.len(),
            discarded: state.discarded,
            lost_changes: state.lost_changes,
        }
    }
}

fn already_checked_out(name: &str) -> ModeldError {
    ModeldError::Internal(format!("'{}' is already checked out", name))
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Resident entries
    pub resident: usize,
    /// Maximum resident entries
    pub capacity: usize,
    /// Resident entries with unsaved changes
    pub dirty: usize,
    /// Entries checked out by a request
    pub in_use: usize,
    /// Evicted entries awaiting write-back
    pub pending: usize,
    /// Dirty handles lost to a panic before write-back
    pub discarded: u64,
    /// Unsaved changes those handles carried
    pub lost_changes: u64,
}
