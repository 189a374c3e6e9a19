//! Per-entity advisory locks
//!
//! A [`LockTable`] hands out one async mutex per entity name. Slots are created
//! on first use and dropped as soon as no guard holds them and nobody is
//! waiting on them, so the table only ever contains names that are in play.
//!
//! Guards are owned (`'static`), which lets a holder keep the lock across
//! `.await` points and while work for the entity runs on the blocking pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::{ModeldError, ModeldResult};

struct Slot {
    lock: Arc<AsyncMutex<()>>,
    refs: usize,
}

type SlotMap = HashMap<String, Slot>;

/// Lazily populated, reference-counted map of entity locks
#[derive(Clone, Default)]
pub struct LockTable {
    slots: Arc<Mutex<SlotMap>>,
}

impl LockTable {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock on `name`, giving up after `timeout`
    pub async fn acquire(&self, name: &str, timeout: Duration) -> ModeldResult<EntityGuard> {
        let lock = self.retain(name);
        let started = Instant::now();

        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => {
                debug!(name = name, "Entity lock acquired");
                Ok(EntityGuard {
                    name: name.to_string(),
                    guard: Some(guard),
                    slots: Arc::clone(&self.slots),
                })
            }
            Err(_) => {
                release_slot(&self.slots, name);
                Err(ModeldError::LockTimeout {
                    name: name.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }

    /// Number of names currently held or waited on
    pub fn len(&self) -> usize {
        lock_slots(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn retain(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut slots = lock_slots(&self.slots);
        let slot = slots.entry(name.to_string()).or_insert_with(|| Slot {
            lock: Arc::new(AsyncMutex::new(())),
            refs: 0,
        });
        slot.refs += 1;
        Arc::clone(&slot.lock)
    }
}

/// Exclusive hold on one entity; released on drop
pub struct EntityGuard {
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Arc<Mutex<SlotMap>>,
}

impl EntityGuard {
    /// Name of the locked entity
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        // Unlock before the refcount drops so the slot is never removed while held.
        self.guard.take();
        release_slot(&self.slots, &self.name);
        debug!(name = %self.name, "Entity lock released");
    }
}

impl std::fmt::Debug for EntityGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityGuard").field("name", &self.name).finish()
    }
}

fn lock_slots(slots: &Mutex<SlotMap>) -> std::sync::MutexGuard<'_, SlotMap> {
    // The map is only mutated by short non-panicking sections.
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn release_slot(slots: &Mutex<SlotMap>, name: &str) {
    let mut slots = lock_slots(slots);
    if let Some(slot) = slots.get_mut(name) {
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            slots.remove(name);
        }
    }
}
