//! # Entity Repository
//!
//! Generic over [`Entity`]: owns the per-state counters and the held index,
//! and runs every state change through a generation-checked write.
//!
//! ## Transition protocol
//!
//! ```text
//!   lock entity ──► state == from? ──no──► false
//!                        │yes
//!                        ▼
//!            state := to, put(all fields, version)
//!                 │                     │
//!              written              conflict / error
//!                 │                     │
//!   version := new, counts[from]-1,   state := from
//!   counts[to]+1, track if held       false
//! ```
//!
//! The lock is a `tokio::sync::Mutex` held for the whole read-modify-write;
//! [`Repository::transition`] takes the [`EntityGuard`] itself, so calling
//! it without holding the lock does not compile.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{ControlFlow, Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::entity::{Entity, EntityState};
use crate::error::{Result, StoreError};
use crate::metering::Metering;
use crate::record::Record;
use crate::store::{PutOutcome, ScanCallback, SharedStore};

// =============================================================================
// VERSIONED ENTITY
// =============================================================================

/// An entity together with the store generation it was last written or
/// read at. `version == 0` means never written.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<E> {
    entity: E,
    version: u32,
}

impl<E: Entity> Versioned<E> {
    pub const fn new(entity: E, version: u32) -> Self {
        Self { entity, version }
    }

    /// Decode a scanned or fetched record.
    pub fn from_record(id: i64, record: &Record) -> Result<Self> {
        Ok(Self::new(E::from_bins(id, record)?, record.generation))
    }

    pub const fn version(&self) -> u32 {
        self.version
    }

    pub fn into_inner(self) -> E {
        self.entity
    }
}

impl<E> Deref for Versioned<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.entity
    }
}

// =============================================================================
// ENTITY HANDLE AND LOCK
// =============================================================================

/// Shared, lockable handle to one in-memory entity.
pub struct EntityRef<E> {
    id: i64,
    slot: Arc<Mutex<Versioned<E>>>,
}

impl<E> Clone for EntityRef<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<E: Entity> EntityRef<E> {
    pub fn new(versioned: Versioned<E>) -> Self {
        Self {
            id: versioned.id(),
            slot: Arc::new(Mutex::new(versioned)),
        }
    }

    pub const fn id(&self) -> i64 {
        self.id
    }

    /// Take the entity's exclusive lock.
    pub async fn lock(&self) -> EntityGuard<E> {
        EntityGuard {
            handle: self.clone(),
            slot: Arc::clone(&self.slot).lock_owned().await,
        }
    }

    /// Copy of the current value, taken under the lock.
    pub async fn snapshot(&self) -> Versioned<E> {
        self.slot.lock().await.clone()
    }

    /// True when both handles point at the same in-memory entity.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<E: Entity> From<Versioned<E>> for EntityRef<E> {
    fn from(versioned: Versioned<E>) -> Self {
        Self::new(versioned)
    }
}

impl<E> fmt::Debug for EntityRef<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRef").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Proof of holding an entity's lock; derefs to the entity.
pub struct EntityGuard<E> {
    handle: EntityRef<E>,
    slot: OwnedMutexGuard<Versioned<E>>,
}

impl<E> EntityGuard<E> {
    pub const fn handle(&self) -> &EntityRef<E> {
        &self.handle
    }

    pub fn version(&self) -> u32 {
        self.slot.version
    }
}

impl<E> Deref for EntityGuard<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.slot.entity
    }
}

impl<E> DerefMut for EntityGuard<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.slot.entity
    }
}

// =============================================================================
// COUNTERS
// =============================================================================

/// One atomic counter per state. `INIT` is never counted.
pub struct StateCounts<S> {
    counts: Box<[AtomicI64]>,
    _state: PhantomData<S>,
}

impl<S: EntityState> StateCounts<S> {
    pub fn new() -> Self {
        Self {
            counts: (0..S::COUNT).map(|_| AtomicI64::new(0)).collect(),
            _state: PhantomData,
        }
    }

    fn modify(&self, state: S, amount: i64) {
        if state != S::INIT {
            self.counts[state.ordinal()].fetch_add(amount, Ordering::SeqCst);
        }
    }

    pub fn get(&self, state: S) -> i64 {
        self.counts[state.ordinal()].load(Ordering::SeqCst)
    }

    /// Sum over all states.
    pub fn total(&self) -> i64 {
        self.counts.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    fn reset(&self) {
        for count in &self.counts {
            count.store(0, Ordering::SeqCst);
        }
    }
}

impl<S: EntityState> Default for StateCounts<S> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// REPOSITORY
// =============================================================================

/// Repository for one entity type.
pub struct Repository<E: Entity> {
    pub(crate) store: SharedStore,
    pub(crate) metering: Arc<Metering>,
    next_id: AtomicI64,
    counts: StateCounts<E::State>,
    pub(crate) held: DashMap<i64, EntityRef<E>>,
}

impl<E: Entity> Repository<E> {
    pub fn new(store: SharedStore, metering: Arc<Metering>) -> Self {
        Self {
            store,
            metering,
            next_id: AtomicI64::new(0),
            counts: StateCounts::new(),
            held: DashMap::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    /// Entities currently counted in `state`.
    pub fn count(&self, state: E::State) -> i64 {
        self.counts.get(state)
    }

    pub const fn counts(&self) -> &StateCounts<E::State> {
        &self.counts
    }

    /// Entities waiting in the held index.
    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    /// Create an entity and persist it in `initial`.
    ///
    /// The entity is returned even if the initial write fails; check that
    /// its state is `initial` before relying on it being stored.
    pub async fn new_entity(&self, initial: E::State) -> EntityRef<E> {
        self.new_entity_with(initial, |_| {}).await
    }

    /// Like [`Repository::new_entity`], letting `init` fill in fields before
    /// the first write.
    pub async fn new_entity_with(&self, initial: E::State, init: impl FnOnce(&mut E) + Send) -> EntityRef<E> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut entity = E::with_id(id);
        init(&mut entity);
        entity.set_state(E::State::INIT);

        let handle = EntityRef::new(Versioned::new(entity, 0));
        let mut guard = handle.lock().await;
        if !self.transition(&mut guard, E::State::INIT, initial).await {
            tracing::warn!(
                collection = E::COLLECTION,
                id,
                state = %initial,
                "Unable to put new entity"
            );
        }
        drop(guard);
        handle
    }

    /// Move the locked entity from `from` to `to` with a generation-checked
    /// write. Returns `false`, leaving state and counters untouched, if the
    /// entity is not in `from`, if `from == to` outside construction, or if
    /// the write conflicts or fails.
    pub async fn transition(&self, guard: &mut EntityGuard<E>, from: E::State, to: E::State) -> bool {
        if from == to && from != E::State::INIT {
            tracing::debug!(collection = E::COLLECTION, id = guard.id(), state = %from, "No-op transition rejected");
            return false;
        }
        if guard.state() != from {
            return false;
        }

        guard.set_state(to);
        if !self.put(guard).await {
            guard.set_state(from);
            return false;
        }

        self.counts.modify(from, -1);
        self.counts.modify(to, 1);
        if E::State::hold().is_some_and(|(held, _)| held == to) {
            self.held.insert(guard.id(), guard.handle().clone());
        }
        true
    }

    /// Write every field of the locked entity, checked against its version.
    /// On success the guard carries the new version.
    pub async fn put(&self, guard: &mut EntityGuard<E>) -> bool {
        if !self.store.is_connected() {
            tracing::debug!(collection = E::COLLECTION, id = guard.id(), "Skipping put while disconnected");
            return false;
        }
        Metering::bump(&self.metering.puts);
        let bins = guard.to_bins();
        match self
            .store
            .put(E::COLLECTION, guard.id(), &bins, guard.version())
            .await
        {
            Ok(PutOutcome::Written { version }) => {
                guard.slot.version = version;
                true
            }
            Ok(PutOutcome::Conflict { current }) => {
                Metering::bump(&self.metering.conflicts);
                tracing::debug!(
                    collection = E::COLLECTION,
                    id = guard.id(),
                    expected = guard.version(),
                    current,
                    "Write conflict"
                );
                false
            }
            Err(e) => {
                tracing::error!(op = "put", collection = E::COLLECTION, id = guard.id(), error = %e, "Store write failed");
                false
            }
        }
    }

    /// Rebuild a lockable entity from a record.
    pub fn get(&self, id: i64, record: &Record) -> Result<EntityRef<E>> {
        Versioned::from_record(id, record).map(EntityRef::new)
    }

    /// Point lookup. `None` when absent or disconnected.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<EntityRef<E>>> {
        if !self.store.is_connected() {
            return Ok(None);
        }
        Metering::bump(&self.metering.gets);
        match self.store.get(E::COLLECTION, id).await? {
            Some(record) => self.get(id, &record).map(Some),
            None => Ok(None),
        }
    }

    /// Invoke `action` for every stored entity, in no particular order and
    /// possibly from several workers at once. The scan cannot be cut short:
    /// a `Break` from `action` is ignored.
    pub async fn foreach_snapshot<F>(&self, action: F)
    where
        F: Fn(Versioned<E>) -> ControlFlow<()> + Send + Sync + 'static,
    {
        if !self.store.is_connected() {
            return;
        }
        Metering::bump(&self.metering.scans);
        let metering = Arc::clone(&self.metering);
        let callback: ScanCallback = Arc::new(move |id, record| {
            Metering::bump(&metering.scan_results);
            match Versioned::<E>::from_record(id, &record) {
                Ok(entity) => {
                    let _ = action(entity);
                }
                Err(e) => tracing::warn!(collection = E::COLLECTION, id, error = %e, "Skipping undecodable record"),
            }
            ControlFlow::Continue(())
        });
        if let Err(e) = self.store.scan_all(E::COLLECTION, callback).await {
            log_scan_error::<E>(&e);
        }
    }

    /// Delete every stored entity and reset the derived in-memory state.
    pub async fn clear(&self) -> Result<u64> {
        if !self.store.is_connected() {
            return Ok(0);
        }
        let removed = self.store.clear(E::COLLECTION).await?;
        self.counts.reset();
        self.held.clear();
        tracing::info!(collection = E::COLLECTION, removed, "Cleared collection");
        Ok(removed)
    }

    /// Rebuild the derived in-memory state from the stored records: the id
    /// sequence continues past the largest stored id, counters match the
    /// stored states, and held entities are tracked again. Returns how many
    /// entities were found.
    pub async fn rebuild(&self) -> Result<usize> {
        if !self.store.is_connected() {
            return Ok(0);
        }
        Metering::bump(&self.metering.scans);
        // Keyed by id; a retried scan pass may deliver a record twice.
        let found: Arc<DashMap<i64, Versioned<E>>> = Arc::default();
        let sink = Arc::clone(&found);
        let metering = Arc::clone(&self.metering);
        let callback: ScanCallback = Arc::new(move |id, record| {
            Metering::bump(&metering.scan_results);
            match Versioned::<E>::from_record(id, &record) {
                Ok(entity) => {
                    sink.insert(id, entity);
                }
                Err(e) => tracing::warn!(collection = E::COLLECTION, id, error = %e, "Skipping undecodable record"),
            }
            ControlFlow::Continue(())
        });
        self.store.scan_all(E::COLLECTION, callback).await?;

        self.counts.reset();
        self.held.clear();
        let held_state = E::State::hold().map(|(held, _)| held);
        for entry in found.iter() {
            let id = *entry.key();
            let state = entry.value().state();
            self.next_id.fetch_max(id, Ordering::SeqCst);
            self.counts.modify(state, 1);
            if Some(state) == held_state {
                self.held.insert(id, EntityRef::new(entry.value().clone()));
            }
        }
        tracing::info!(
            collection = E::COLLECTION,
            found = found.len(),
            held = self.held.len(),
            next_id = self.next_id.load(Ordering::SeqCst) + 1,
            "Rebuilt from store"
        );
        Ok(found.len())
    }
}

pub(crate) fn log_scan_error<E: Entity>(e: &StoreError) {
    tracing::error!(op = "scan", collection = E::COLLECTION, error = %e, "Scan failed");
}

/// Job repository
pub type Jobs = Repository<delivery_domain::Job>;

/// Drone repository
pub type Drones = Repository<delivery_domain::Drone>;
