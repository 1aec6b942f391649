//! Shared storage manager: reference-counted open/close and change
//! reconciliation for one external location.
//!
//! # Responsibility
//! - Open the backend for the first session and close it when the last
//!   session ends, committing only if a write happened.
//! - Map external change times onto the session's logical clock.
//! - Detect external modification during an open write session.
//!
//! # Invariants
//! - Every backend call runs under the manager's storage-level registry lock.
//! - The manager's own committed writes update the cached external time
//!   without advancing its logical change time, so sibling items bound to the
//!   same location are not invalidated by them.
//! - `change_time` only grows.

use crate::engine::clock::{LogicalClock, LogicalTime};
use crate::engine::context::{self, ContextRole};
use crate::engine::lock_registry::{LockHandle, LockKey, LockRegistry};
use crate::engine::lock_unpoisoned;
use crate::model::item::{DomainRange, ValueType, Values};
use crate::storage::{
    OpenMode, StorageError, StorageKind, StorageManager, StorageResult, TileRange,
};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use uuid::Uuid;

struct ManagerCore {
    backend: Box<dyn StorageManager>,
    open_count: usize,
    mode: Option<OpenMode>,
    wrote: bool,
    conflict: bool,
    /// Last external time this manager knows about.
    cached_external: Option<SystemTime>,
    /// External time expected at the next write-session check.
    session_baseline: Option<SystemTime>,
    /// Logical time of the latest observed external change.
    change_time: LogicalTime,
    /// Logical time at which `cached_external` was last verified.
    verified_at: LogicalTime,
    backend_opens: u64,
}

/// One backend shared by every item bound to the same location.
pub struct SharedStorage {
    id: Uuid,
    kind: StorageKind,
    location: PathBuf,
    read_only: AtomicBool,
    locks: LockRegistry,
    clock: Arc<LogicalClock>,
    core: Mutex<ManagerCore>,
}

impl SharedStorage {
    pub fn new(
        backend: Box<dyn StorageManager>,
        read_only: bool,
        locks: LockRegistry,
        clock: Arc<LogicalClock>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: backend.kind(),
            location: backend.location().to_path_buf(),
            read_only: AtomicBool::new(read_only),
            locks,
            clock,
            core: Mutex::new(ManagerCore {
                backend,
                open_count: 0,
                mode: None,
                wrote: false,
                conflict: false,
                cached_external: None,
                session_baseline: None,
                change_time: LogicalTime::ZERO,
                verified_at: LogicalTime::ZERO,
                backend_opens: 0,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Lifts the read-only flag once a writable binding joins this manager.
    pub(crate) fn allow_writes(&self) {
        self.read_only.store(false, Ordering::SeqCst);
    }

    /// Number of live sessions.
    pub fn open_count(&self) -> usize {
        lock_unpoisoned(&self.core).open_count
    }

    pub fn is_open(&self) -> bool {
        lock_unpoisoned(&self.core).mode.is_some()
    }

    /// Number of times the backend itself was opened.
    pub fn backend_opens(&self) -> u64 {
        lock_unpoisoned(&self.core).backend_opens
    }

    /// Logical time of the latest external change seen, without re-checking.
    pub fn change_time(&self) -> LogicalTime {
        lock_unpoisoned(&self.core).change_time
    }

    pub fn verified_at(&self) -> LogicalTime {
        lock_unpoisoned(&self.core).verified_at
    }

    pub fn cached_external_time(&self) -> Option<SystemTime> {
        lock_unpoisoned(&self.core).cached_external
    }

    /// Re-reads the external change time and returns the logical time of the
    /// latest external change.
    ///
    /// A new external time advances the logical clock. During a write session
    /// the comparison is against the session baseline, and a difference is
    /// reported as a conflict that blocks the commit.
    pub fn reconcile(&self) -> StorageResult<LogicalTime> {
        let _lock = self.storage_lock()?;
        let mut core = lock_unpoisoned(&self.core);
        let current = core.backend.external_change_time()?;

        if core.mode == Some(OpenMode::Write) {
            if current != core.session_baseline && !core.conflict {
                core.conflict = true;
                core.change_time = self.clock.tick();
                warn!(
                    "event=storage_external_change module=storage status=conflict location={}",
                    self.location.display()
                );
            }
        } else if current != core.cached_external {
            core.cached_external = current;
            core.change_time = self.clock.tick();
            info!(
                "event=storage_external_change module=storage status=ok location={} change_time={}",
                self.location.display(),
                core.change_time
            );
        }

        core.verified_at = self.clock.now();
        Ok(core.change_time)
    }

    pub fn open_for_read(self: &Arc<Self>) -> StorageResult<StorageSession> {
        self.open(OpenMode::Read)
    }

    /// # Errors
    /// - `ReadOnly` when no writable binding shares this manager.
    pub fn open_for_write(self: &Arc<Self>) -> StorageResult<StorageSession> {
        if self.is_read_only() {
            return Err(StorageError::ReadOnly(self.location.clone()));
        }
        self.open(OpenMode::Write)
    }

    fn open(self: &Arc<Self>, mode: OpenMode) -> StorageResult<StorageSession> {
        let _frame = context::enter(
            ContextRole::StorageOpen,
            None,
            self.location.display().to_string(),
        );
        let _lock = self.storage_lock()?;
        let mut core = lock_unpoisoned(&self.core);

        match (core.mode, mode) {
            (None, _) => {
                let before = core.backend.external_change_time()?;
                let opened = match mode {
                    OpenMode::Read => core.backend.open_for_read(),
                    OpenMode::Write => core.backend.open_for_write(),
                };
                if let Err(err) = opened {
                    error!(
                        "event=storage_open module=storage status=error kind={} mode={} location={} error={}",
                        self.kind.as_str(),
                        mode.as_str(),
                        self.location.display(),
                        err
                    );
                    return Err(err);
                }
                core.mode = Some(mode);
                core.backend_opens += 1;
                if mode == OpenMode::Write {
                    self.begin_write_session(&mut core, before)?;
                }
                info!(
                    "event=storage_open module=storage status=ok kind={} mode={} location={}",
                    self.kind.as_str(),
                    mode.as_str(),
                    self.location.display()
                );
            }
            (Some(OpenMode::Read), OpenMode::Write) => {
                let before = core.backend.external_change_time()?;
                core.backend.close_storage(false)?;
                if let Err(err) = core.backend.open_for_write() {
                    // Keep existing readers working on a read-mode backend.
                    core.mode = core.backend.open_for_read().ok().map(|_| OpenMode::Read);
                    return Err(err);
                }
                core.mode = Some(OpenMode::Write);
                core.backend_opens += 1;
                self.begin_write_session(&mut core, before)?;
                info!(
                    "event=storage_open module=storage status=ok kind={} mode=upgrade location={}",
                    self.kind.as_str(),
                    self.location.display()
                );
            }
            _ => {}
        }

        core.open_count += 1;
        Ok(StorageSession {
            storage: Arc::clone(self),
            mode,
            closed: false,
        })
    }

    /// `before` is the external time seen just before the backend opened;
    /// whatever the open itself touched (schema setup, file creation) is
    /// absorbed into the baseline.
    fn begin_write_session(
        &self,
        core: &mut ManagerCore,
        before: Option<SystemTime>,
    ) -> StorageResult<()> {
        if before != core.cached_external {
            core.change_time = self.clock.tick();
        }
        let current = core.backend.external_change_time()?;
        core.cached_external = current;
        core.session_baseline = current;
        core.conflict = false;
        Ok(())
    }

    fn storage_lock(&self) -> StorageResult<LockHandle> {
        Ok(self.locks.acquire(LockKey::storage(self.id))?)
    }

    fn with_backend<T>(
        &self,
        op: impl FnOnce(&mut dyn StorageManager) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let _lock = self.storage_lock()?;
        let mut core = lock_unpoisoned(&self.core);
        if core.mode.is_none() {
            return Err(StorageError::NotOpen(self.location.clone()));
        }
        op(core.backend.as_mut())
    }

    fn with_write_backend(
        &self,
        op: impl FnOnce(&mut dyn StorageManager) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let _lock = self.storage_lock()?;
        let mut core = lock_unpoisoned(&self.core);
        if core.mode != Some(OpenMode::Write) {
            return Err(StorageError::NotOpen(self.location.clone()));
        }
        self.check_unchanged(&mut core)?;
        op(core.backend.as_mut())?;
        core.wrote = true;
        core.session_baseline = core.backend.external_change_time()?;
        Ok(())
    }

    fn check_unchanged(&self, core: &mut ManagerCore) -> StorageResult<()> {
        let current = core.backend.external_change_time()?;
        if core.conflict || current != core.session_baseline {
            if !core.conflict {
                core.conflict = true;
                core.change_time = self.clock.tick();
            }
            warn!(
                "event=storage_external_change module=storage status=conflict location={}",
                self.location.display()
            );
            return Err(StorageError::ExternalChange(self.location.clone()));
        }
        Ok(())
    }

    fn release(&self) -> StorageResult<()> {
        let _frame = context::enter(
            ContextRole::StorageClose,
            None,
            self.location.display().to_string(),
        );
        let _lock = self.storage_lock()?;
        let mut core = lock_unpoisoned(&self.core);
        core.open_count = core.open_count.saturating_sub(1);
        if core.open_count > 0 {
            return Ok(());
        }
        let Some(mode) = core.mode.take() else {
            return Ok(());
        };

        let wrote = std::mem::take(&mut core.wrote);
        let conflict = if mode == OpenMode::Write && wrote {
            self.check_unchanged(&mut core).is_err()
        } else {
            core.conflict
        };
        let commit = mode == OpenMode::Write && wrote && !conflict && !self.is_read_only();

        let closed = core.backend.close_storage(commit);
        core.session_baseline = None;
        core.conflict = false;
        if let Err(err) = closed {
            error!(
                "event=storage_close module=storage status=error location={} commit={} error={}",
                self.location.display(),
                commit,
                err
            );
            return Err(err);
        }

        if commit {
            core.cached_external = core.backend.external_change_time()?;
            core.verified_at = self.clock.tick();
        }
        info!(
            "event=storage_close module=storage status=ok location={} commit={}",
            self.location.display(),
            commit
        );

        if conflict {
            return Err(StorageError::ExternalChange(self.location.clone()));
        }
        Ok(())
    }
}

/// One consumer's use of a shared storage; closing happens on `finish` or drop.
pub struct StorageSession {
    storage: Arc<SharedStorage>,
    mode: OpenMode,
    closed: bool,
}

impl StorageSession {
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn storage(&self) -> &Arc<SharedStorage> {
        &self.storage
    }

    pub fn read_attribute(
        &self,
        role: &str,
        tile: TileRange,
        value_type: ValueType,
    ) -> StorageResult<Values> {
        let _frame = self.frame(ContextRole::StorageRead, role);
        self.storage
            .with_backend(|backend| backend.read_attribute(role, tile, value_type))
    }

    pub fn read_domain_range(&self, role: &str) -> StorageResult<DomainRange> {
        let _frame = self.frame(ContextRole::StorageRead, role);
        self.storage
            .with_backend(|backend| backend.read_domain_range(role))
    }

    /// # Errors
    /// - `ReadOnly` for read sessions.
    /// - `ExternalChange` when the location changed since the session began.
    pub fn write_attribute(&self, role: &str, values: &Values) -> StorageResult<()> {
        let _frame = self.frame(ContextRole::StorageWrite, role);
        self.require_write()?;
        self.storage
            .with_write_backend(|backend| backend.write_attribute(role, values))
    }

    pub fn write_domain_range(&self, role: &str, range: DomainRange) -> StorageResult<()> {
        let _frame = self.frame(ContextRole::StorageWrite, role);
        self.require_write()?;
        self.storage
            .with_write_backend(|backend| backend.write_domain_range(role, range))
    }

    /// Ends this session and reports close/commit failures.
    pub fn finish(mut self) -> StorageResult<()> {
        self.closed = true;
        self.storage.release()
    }

    fn require_write(&self) -> StorageResult<()> {
        if self.mode != OpenMode::Write {
            return Err(StorageError::ReadOnly(self.storage.location.clone()));
        }
        Ok(())
    }

    fn frame(&self, role: ContextRole, storage_role: &str) -> context::ContextGuard {
        context::enter(
            role,
            None,
            format!("{}#{storage_role}", self.storage.location.display()),
        )
    }
}

impl Drop for StorageSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.storage.release() {
            error!(
                "event=storage_close module=storage status=error location={} error={}",
                self.storage.location.display(),
                err
            );
        }
    }
}
