//! Keyed, leveled, reference-counted lock registry.
//!
//! # Responsibility
//! - Create one lock per resource identity on demand and drop it once the
//!   last holder or waiter is gone.
//! - Enforce a total acquisition order across resource kinds.
//!
//! # Invariants
//! - A thread holding a lock at level N may only acquire locks at level > N
//!   from the same registry. Violations are rejected before blocking.
//! - An entry exists in the map exactly while its holder count is non-zero.
//! - `LockHandle` is neither `Send` nor `Sync`; it is released on the thread
//!   that acquired it.

use crate::engine::lock_unpoisoned;
use crate::model::item::ItemId;
use log::{error, trace};
use std::cell::RefCell;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use uuid::Uuid;

/// Acquisition order rank; higher levels are acquired later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockLevel(u8);

impl LockLevel {
    pub fn value(self) -> u8 {
        self.0
    }
}

/// Resource kind protected through the registry. Each kind has a fixed level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Item tree structure and storage binding tables.
    MetadataRegistry,
    /// One shared storage manager (open/close/read/write).
    StorageManager,
    /// One attribute value buffer or one tile of it.
    TileBuffer,
}

impl ResourceKind {
    pub const fn level(self) -> LockLevel {
        match self {
            Self::MetadataRegistry => LockLevel(10),
            Self::StorageManager => LockLevel(20),
            Self::TileBuffer => LockLevel(30),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MetadataRegistry => "metadata_registry",
            Self::StorageManager => "storage_manager",
            Self::TileBuffer => "tile_buffer",
        }
    }
}

/// Identity of one lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    kind: ResourceKind,
    resource: Uuid,
    tile: Option<u32>,
}

impl LockKey {
    pub fn metadata(resource: Uuid) -> Self {
        Self {
            kind: ResourceKind::MetadataRegistry,
            resource,
            tile: None,
        }
    }

    pub fn storage(manager: Uuid) -> Self {
        Self {
            kind: ResourceKind::StorageManager,
            resource: manager,
            tile: None,
        }
    }

    /// Whole value buffer of one attribute item.
    pub fn buffer(item: ItemId) -> Self {
        Self {
            kind: ResourceKind::TileBuffer,
            resource: item,
            tile: None,
        }
    }

    pub fn tile(item: ItemId, tile: u32) -> Self {
        Self {
            kind: ResourceKind::TileBuffer,
            resource: item,
            tile: Some(tile),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn level(&self) -> LockLevel {
        self.kind.level()
    }

    pub fn resource(&self) -> Uuid {
        self.resource
    }
}

impl Display for LockKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.tile {
            Some(tile) => write!(f, "{}:{}#{}", self.kind.as_str(), self.resource, tile),
            None => write!(f, "{}:{}", self.kind.as_str(), self.resource),
        }
    }
}

pub type LockResult<T> = Result<T, LockError>;

/// Lock registry errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The calling thread already holds `held` at a level >= `requested`.
    LevelViolation { requested: LockKey, held: LockKey },
}

impl Display for LockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LevelViolation { requested, held } => write!(
                f,
                "lock order violation: requested {requested} (level {}) while holding {held} (level {})",
                requested.level().value(),
                held.level().value()
            ),
        }
    }
}

impl Error for LockError {}

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static HELD: RefCell<Vec<HeldLock>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Clone, Copy)]
struct HeldLock {
    registry: u64,
    key: LockKey,
}

#[derive(Debug, Default)]
struct EntryState {
    locked: bool,
    /// Current holder plus every waiter.
    holders: usize,
}

#[derive(Debug, Default)]
struct LockEntry {
    state: Mutex<EntryState>,
    released: Condvar,
}

#[derive(Debug)]
struct RegistryInner {
    id: u64,
    entries: Mutex<HashMap<LockKey, Arc<LockEntry>>>,
}

/// Session-scoped lock registry; cheap to clone.
#[derive(Debug, Clone)]
pub struct LockRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Blocks until `key` is exclusively held by the calling thread.
    ///
    /// # Errors
    /// - Returns `LevelViolation` when the thread already holds a lock of this
    ///   registry at the same or a higher level. Nothing is acquired then.
    pub fn acquire(&self, key: LockKey) -> LockResult<LockHandle> {
        self.check_order(key)?;
        let entry = self.enter(key);
        {
            let mut state = lock_unpoisoned(&entry.state);
            while state.locked {
                state = entry
                    .released
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.locked = true;
        }
        trace!("event=lock_acquire module=lock_registry status=ok key={key}");
        Ok(self.handle(key, entry))
    }

    /// Acquires `key` only if no other holder has it right now.
    ///
    /// # Errors
    /// - Same level rule as `acquire`.
    pub fn try_acquire(&self, key: LockKey) -> LockResult<Option<LockHandle>> {
        self.check_order(key)?;
        let mut entries = lock_unpoisoned(&self.inner.entries);
        let entry = Arc::clone(
            entries
                .entry(key)
                .or_insert_with(|| Arc::new(LockEntry::default())),
        );
        {
            let mut state = lock_unpoisoned(&entry.state);
            if state.locked {
                return Ok(None);
            }
            state.locked = true;
            state.holders += 1;
        }
        drop(entries);
        trace!("event=lock_try_acquire module=lock_registry status=ok key={key}");
        Ok(Some(self.handle(key, entry)))
    }

    /// Number of live entries (held or waited on).
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: LockKey) -> bool {
        lock_unpoisoned(&self.inner.entries).contains_key(&key)
    }

    /// Holder plus waiter count for `key`; zero when no entry exists.
    pub fn holder_count(&self, key: LockKey) -> usize {
        lock_unpoisoned(&self.inner.entries)
            .get(&key)
            .map_or(0, |entry| lock_unpoisoned(&entry.state).holders)
    }

    /// Keys of this registry currently held by the calling thread.
    pub fn held_by_current_thread(&self) -> Vec<LockKey> {
        let registry = self.inner.id;
        HELD.with(|held| {
            held.borrow()
                .iter()
                .filter(|entry| entry.registry == registry)
                .map(|entry| entry.key)
                .collect()
        })
    }

    /// Checks whether the calling thread may acquire `requested` now,
    /// without acquiring it.
    ///
    /// # Errors
    /// - Same level rule as `acquire`.
    pub fn check_order(&self, requested: LockKey) -> LockResult<()> {
        let registry = self.inner.id;
        let blocking = HELD.with(|held| {
            held.borrow()
                .iter()
                .filter(|entry| entry.registry == registry)
                .map(|entry| entry.key)
                .max_by_key(LockKey::level)
                .filter(|held| held.level() >= requested.level())
        });
        match blocking {
            Some(held) => {
                error!(
                    "event=lock_order_violation module=lock_registry status=error requested={requested} held={held}"
                );
                Err(LockError::LevelViolation { requested, held })
            }
            None => Ok(()),
        }
    }

    fn enter(&self, key: LockKey) -> Arc<LockEntry> {
        let mut entries = lock_unpoisoned(&self.inner.entries);
        let entry = Arc::clone(
            entries
                .entry(key)
                .or_insert_with(|| Arc::new(LockEntry::default())),
        );
        lock_unpoisoned(&entry.state).holders += 1;
        entry
    }

    fn handle(&self, key: LockKey, entry: Arc<LockEntry>) -> LockHandle {
        let registry = self.inner.id;
        HELD.with(|held| held.borrow_mut().push(HeldLock { registry, key }));
        LockHandle {
            registry: Arc::clone(&self.inner),
            key,
            entry,
            _not_send: PhantomData,
        }
    }
}

/// Exclusive hold on one registry key; released on drop.
#[derive(Debug)]
pub struct LockHandle {
    registry: Arc<RegistryInner>,
    key: LockKey,
    entry: Arc<LockEntry>,
    _not_send: PhantomData<*const ()>,
}

impl LockHandle {
    pub fn key(&self) -> LockKey {
        self.key
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        {
            let mut entries = lock_unpoisoned(&self.registry.entries);
            let mut state = lock_unpoisoned(&self.entry.state);
            state.locked = false;
            state.holders = state.holders.saturating_sub(1);
            if state.holders == 0 {
                entries.remove(&self.key);
            }
        }
        self.entry.released.notify_all();

        let registry = self.registry.id;
        let key = self.key;
        // Thread-local storage may already be torn down during thread exit.
        let _ = HELD.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some(position) = held
                .iter()
                .rposition(|entry| entry.registry == registry && entry.key == key)
            {
                held.remove(position);
            }
        });
        trace!("event=lock_release module=lock_registry status=ok key={key}");
    }
}
