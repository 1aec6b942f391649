//! Storage factory registry and per-location manager sharing.
//!
//! # Responsibility
//! - Register one factory per storage kind.
//! - Hand out the single live `SharedStorage` for each location.
//! - Probe existence and writability before a binding is accepted.
//!
//! # Invariants
//! - At most one live manager per resolved location.
//! - A location is never bound under two different kinds at once.
//! - Binding runs under the registry's metadata-level lock.

use crate::engine::clock::LogicalClock;
use crate::engine::lock_registry::{LockKey, LockRegistry};
use crate::engine::lock_unpoisoned;
use crate::storage::file_store::FileStorageFactory;
use crate::storage::shared::SharedStorage;
use crate::storage::table_store::TableStorageFactory;
use crate::storage::{StorageError, StorageFactory, StorageKind, StorageResult};
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use uuid::Uuid;

pub struct StorageRegistry {
    registry_key: Uuid,
    factories: RwLock<BTreeMap<StorageKind, Arc<dyn StorageFactory>>>,
    managers: Mutex<HashMap<PathBuf, Weak<SharedStorage>>>,
    locks: LockRegistry,
    clock: Arc<LogicalClock>,
}

impl StorageRegistry {
    /// Creates an empty registry.
    pub fn new(locks: LockRegistry, clock: Arc<LogicalClock>) -> Self {
        Self {
            registry_key: Uuid::new_v4(),
            factories: RwLock::new(BTreeMap::new()),
            managers: Mutex::new(HashMap::new()),
            locks,
            clock,
        }
    }

    /// Creates a registry with the built-in JSON file and SQLite table backends.
    pub fn with_builtin_factories(locks: LockRegistry, clock: Arc<LogicalClock>) -> Self {
        let registry = Self::new(locks, clock);
        let mut factories = registry
            .factories
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        factories.insert(StorageKind::GenericFile, Arc::new(FileStorageFactory));
        factories.insert(StorageKind::Tabular, Arc::new(TableStorageFactory));
        drop(factories);
        registry
    }

    /// Registers one factory.
    ///
    /// # Errors
    /// - `DuplicateFactory` when the kind is already served.
    pub fn register_factory(&self, factory: Arc<dyn StorageFactory>) -> StorageResult<()> {
        let kind = factory.kind();
        let mut factories = self
            .factories
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if factories.contains_key(&kind) {
            return Err(StorageError::DuplicateFactory(kind));
        }
        factories.insert(kind, factory);
        info!(
            "event=storage_factory_register module=storage status=ok kind={}",
            kind.as_str()
        );
        Ok(())
    }

    /// Sorted kinds with a registered factory.
    pub fn kinds(&self) -> Vec<StorageKind> {
        self.factories
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn does_exist(&self, kind: StorageKind, location: &Path) -> StorageResult<bool> {
        Ok(self.factory(kind)?.does_exist(location))
    }

    pub fn is_writable(&self, kind: StorageKind, location: &Path) -> StorageResult<bool> {
        Ok(self.factory(kind)?.is_writable(location))
    }

    /// Number of locations with a live manager.
    pub fn live_managers(&self) -> usize {
        lock_unpoisoned(&self.managers)
            .values()
            .filter(|manager| manager.strong_count() > 0)
            .count()
    }

    /// Live manager for `location`, if any item still holds one.
    pub fn manager(&self, location: &Path) -> Option<Arc<SharedStorage>> {
        lock_unpoisoned(&self.managers)
            .get(location)
            .and_then(Weak::upgrade)
    }

    /// Returns the shared manager for `location`, creating it on first use.
    ///
    /// # Errors
    /// - `UnsupportedKind` when no factory serves `kind`.
    /// - `KindConflict` when the location is live under another kind.
    /// - `NotFound` for a read-only binding of a missing location.
    /// - `PermissionDenied` for a writable binding of an unwritable location.
    pub fn bind(
        &self,
        kind: StorageKind,
        location: &Path,
        read_only: bool,
    ) -> StorageResult<Arc<SharedStorage>> {
        let _lock = self.locks.acquire(LockKey::metadata(self.registry_key))?;
        let factory = self.factory(kind)?;
        let mut managers = lock_unpoisoned(&self.managers);
        managers.retain(|_, manager| manager.strong_count() > 0);

        if let Some(existing) = managers.get(location).and_then(Weak::upgrade) {
            if existing.kind() != kind {
                warn!(
                    "event=storage_bind module=storage status=error location={} error_code=kind_conflict",
                    location.display()
                );
                return Err(StorageError::KindConflict {
                    location: location.to_path_buf(),
                    bound: existing.kind(),
                    requested: kind,
                });
            }
            if !read_only {
                probe(factory.as_ref(), location, read_only)?;
                existing.allow_writes();
            }
            return Ok(existing);
        }

        probe(factory.as_ref(), location, read_only)?;
        let backend = factory.create(location)?;
        let manager = Arc::new(SharedStorage::new(
            backend,
            read_only,
            self.locks.clone(),
            Arc::clone(&self.clock),
        ));
        managers.insert(location.to_path_buf(), Arc::downgrade(&manager));
        info!(
            "event=storage_bind module=storage status=ok kind={} read_only={} location={}",
            kind.as_str(),
            read_only,
            location.display()
        );
        Ok(manager)
    }

    fn factory(&self, kind: StorageKind) -> StorageResult<Arc<dyn StorageFactory>> {
        self.factories
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&kind)
            .cloned()
            .ok_or(StorageError::UnsupportedKind(kind))
    }
}

fn probe(factory: &dyn StorageFactory, location: &Path, read_only: bool) -> StorageResult<()> {
    if read_only {
        if !factory.does_exist(location) {
            return Err(StorageError::NotFound(location.to_path_buf()));
        }
    } else if !factory.is_writable(location) {
        return Err(StorageError::PermissionDenied(location.to_path_buf()));
    }
    Ok(())
}
