//! Storage manager interface and shared storage lifecycle.
//!
//! # Responsibility
//! - Define the plugin contract every external-format backend implements.
//! - Share one manager per external location and reference-count its
//!   open/close lifecycle.
//! - Reconcile external change times against the session's logical clock.
//!
//! # Invariants
//! - Backends are only driven through `SharedStorage`, which serializes access
//!   with a storage-level registry lock.
//! - A read-only manager never opens for write.

use crate::engine::lock_registry::LockError;
use crate::model::item::{DomainRange, ValueType, Values};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub mod file_store;
pub mod location;
pub mod migrations;
pub mod registry;
pub mod shared;
pub mod table_store;

pub use location::{LocationError, PlaceholderTable};
pub use registry::StorageRegistry;
pub use shared::{SharedStorage, StorageSession};

pub type StorageResult<T> = Result<T, StorageError>;

/// Backend family selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Columnar table format (built in: SQLite).
    Tabular,
    /// Shape/geometry codec; supplied by the embedding application.
    Geometry,
    /// Raster image codec; supplied by the embedding application.
    Raster,
    /// Generic file (built in: JSON document).
    GenericFile,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tabular => "tabular",
            Self::Geometry => "geometry",
            Self::Raster => "raster",
            Self::GenericFile => "generic_file",
        }
    }
}

/// Element window requested by one attribute read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub index: u32,
    pub start: u32,
    pub len: u32,
}

impl TileRange {
    /// The whole array as a single tile.
    pub fn whole(count: u32) -> Self {
        Self {
            index: 0,
            start: 0,
            len: count,
        }
    }

    /// Splits `count` elements into tiles of at most `tile_size` elements.
    ///
    /// Always yields at least one tile so empty domains still read once.
    pub fn split(count: u32, tile_size: Option<u32>) -> Vec<TileRange> {
        let size = match tile_size {
            Some(size) if size > 0 && size < count => size,
            _ => return vec![Self::whole(count)],
        };
        let mut tiles = Vec::new();
        let mut start = 0;
        while start < count {
            let len = size.min(count - start);
            tiles.push(Self {
                index: tiles.len() as u32,
                start,
                len,
            });
            start += len;
        }
        tiles
    }
}

/// Open mode of a storage session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

impl OpenMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

/// Contract implemented by every external-format backend.
///
/// Backends hold no locks of their own; `SharedStorage` guarantees that at
/// most one call is in flight per backend.
pub trait StorageManager: Send {
    fn kind(&self) -> StorageKind;

    fn location(&self) -> &Path;

    fn open_for_read(&mut self) -> StorageResult<()>;

    fn open_for_write(&mut self) -> StorageResult<()>;

    /// Closes the open backend, persisting writes only when `commit` is set.
    fn close_storage(&mut self, commit: bool) -> StorageResult<()>;

    fn read_attribute(
        &mut self,
        role: &str,
        tile: TileRange,
        value_type: ValueType,
    ) -> StorageResult<Values>;

    fn write_attribute(&mut self, role: &str, values: &Values) -> StorageResult<()>;

    fn read_domain_range(&mut self, role: &str) -> StorageResult<DomainRange>;

    fn write_domain_range(&mut self, role: &str, range: DomainRange) -> StorageResult<()>;

    /// Last external modification time; `None` when the location is absent.
    fn external_change_time(&self) -> StorageResult<Option<SystemTime>>;
}

/// Creates backends of one kind and probes locations before binding.
pub trait StorageFactory: Send + Sync {
    fn kind(&self) -> StorageKind;

    fn create(&self, location: &Path) -> StorageResult<Box<dyn StorageManager>>;

    fn does_exist(&self, location: &Path) -> bool;

    fn is_writable(&self, location: &Path) -> bool;
}

/// Shared writability probe for file-backed factories.
pub(crate) fn file_is_writable(location: &Path) -> bool {
    match std::fs::metadata(location) {
        Ok(metadata) => metadata.is_file() && !metadata.permissions().readonly(),
        Err(_) => location
            .parent()
            .map(|parent| if parent.as_os_str().is_empty() { Path::new(".") } else { parent })
            .and_then(|parent| std::fs::metadata(parent).ok())
            .is_some_and(|metadata| metadata.is_dir() && !metadata.permissions().readonly()),
    }
}

/// Shared change-time probe for file-backed backends.
pub(crate) fn file_change_time(location: &Path) -> StorageResult<Option<SystemTime>> {
    match std::fs::metadata(location) {
        Ok(metadata) => Ok(Some(metadata.modified()?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Storage-layer errors.
#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Sqlite(rusqlite::Error),
    Json(serde_json::Error),
    Lock(LockError),
    /// Location does not exist.
    NotFound(PathBuf),
    /// Location exists but may not be written.
    PermissionDenied(PathBuf),
    /// Write requested on a read-only manager.
    ReadOnly(PathBuf),
    /// Operation requires an open session.
    NotOpen(PathBuf),
    /// Role (attribute or domain) is absent from the storage.
    MissingRole { location: PathBuf, role: String },
    /// Stored element type differs from the requested one.
    TypeMismatch {
        role: String,
        expected: ValueType,
        actual: String,
    },
    /// Location already has a manager of another kind.
    KindConflict {
        location: PathBuf,
        bound: StorageKind,
        requested: StorageKind,
    },
    /// No factory registered for this kind.
    UnsupportedKind(StorageKind),
    /// A factory of this kind is already registered.
    DuplicateFactory(StorageKind),
    /// Storage schema is newer than this build understands.
    UnsupportedSchemaVersion { db_version: u32, latest_supported: u32 },
    /// External modification detected during an open write session.
    ExternalChange(PathBuf),
    /// Persisted data cannot be decoded.
    InvalidData(String),
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{err}"),
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "{err}"),
            Self::Lock(err) => write!(f, "{err}"),
            Self::NotFound(path) => write!(f, "storage not found: {}", path.display()),
            Self::PermissionDenied(path) => {
                write!(f, "storage is not writable: {}", path.display())
            }
            Self::ReadOnly(path) => {
                write!(f, "storage manager is read-only: {}", path.display())
            }
            Self::NotOpen(path) => write!(f, "storage is not open: {}", path.display()),
            Self::MissingRole { location, role } => write!(
                f,
                "storage `{}` has no entry for role `{role}`",
                location.display()
            ),
            Self::TypeMismatch {
                role,
                expected,
                actual,
            } => write!(
                f,
                "role `{role}` stores `{actual}` values, expected `{expected}`"
            ),
            Self::KindConflict {
                location,
                bound,
                requested,
            } => write!(
                f,
                "storage `{}` is bound as `{}`, cannot rebind as `{}`",
                location.display(),
                bound.as_str(),
                requested.as_str()
            ),
            Self::UnsupportedKind(kind) => {
                write!(f, "no storage factory registered for `{}`", kind.as_str())
            }
            Self::DuplicateFactory(kind) => {
                write!(f, "storage factory already registered: {}", kind.as_str())
            }
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "storage schema version {db_version} is newer than supported {latest_supported}"
            ),
            Self::ExternalChange(path) => write!(
                f,
                "storage `{}` was modified externally during a write session",
                path.display()
            ),
            Self::InvalidData(message) => write!(f, "invalid stored data: {message}"),
        }
    }
}

impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Sqlite(err) => Some(err),
            Self::Json(err) => Some(err),
            Self::Lock(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<LockError> for StorageError {
    fn from(value: LockError) -> Self {
        Self::Lock(value)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

#[cfg(test)]
mod tests {
    use super::TileRange;

    #[test]
    fn split_covers_all_elements_in_order() {
        let tiles = TileRange::split(10, Some(4));
        assert_eq!(tiles.len(), 3);
        assert_eq!((tiles[0].start, tiles[0].len), (0, 4));
        assert_eq!((tiles[1].start, tiles[1].len), (4, 4));
        assert_eq!((tiles[2].start, tiles[2].len), (8, 2));
        assert_eq!(tiles[2].index, 2);
    }

    #[test]
    fn split_without_tiling_yields_one_tile() {
        assert_eq!(TileRange::split(5, None), vec![TileRange::whole(5)]);
        assert_eq!(TileRange::split(5, Some(0)), vec![TileRange::whole(5)]);
        assert_eq!(TileRange::split(0, Some(4)), vec![TileRange::whole(0)]);
    }
}
