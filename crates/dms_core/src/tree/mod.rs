//! Item tree: named, typed items with lazily computed, storage-reconciled
//! values.
//!
//! # Responsibility
//! - Own the item namespace and its dependency edges.
//! - Drive each item through the progress state machine on demand.
//! - Turn structural mistakes into `TreeError` and computation problems into
//!   `Failed` items.
//!
//! # Invariants
//! - Structural errors are returned to the caller building the tree and leave
//!   it unchanged.
//! - Errors during `ensure_meta_ready`/`ensure_data_ready` never escape as
//!   anything but the item's shared `ItemFailure`.

mod compute;
pub mod config;
pub mod engine;
mod node;

pub use config::{EngineConfig, ItemConfig, ItemKindConfig, StorageConfig, TreeConfig};
pub use engine::Engine;

use crate::engine::lock_registry::LockError;
use crate::engine::rule::RuleError;
use crate::model::failure::ItemFailure;
use crate::model::item::{ItemId, ItemKind};
use crate::storage::{LocationError, StorageError};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub type TreeResult<T> = Result<T, TreeError>;
pub type EngineResult<T> = Result<T, EngineError>;

/// Structural errors raised while building or addressing the tree.
#[derive(Debug)]
pub enum TreeError {
    InvalidName(String),
    DuplicateChild { parent: String, name: String },
    UnknownItem(ItemId),
    UnknownPath(String),
    /// Calculation rule and read-only storage (or a declared count) both
    /// claim the item's value.
    ConflictingAuthority(String),
    WrongKind {
        path: String,
        expected: &'static str,
        actual: ItemKind,
    },
    ReadOnlyBinding(String),
    /// User-supplied values do not fit the item's structure.
    ValueShape { path: String, reason: String },
    Location(LocationError),
    /// The calling thread holds a registry lock that orders after the item's
    /// buffer lock.
    Lock(LockError),
    Storage(StorageError),
    Rule { path: String, source: RuleError },
    MalformedConfig(String),
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl Display for TreeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName(name) => write!(f, "invalid item name `{name}`"),
            Self::DuplicateChild { parent, name } => {
                write!(f, "`{parent}` already has a child named `{name}`")
            }
            Self::UnknownItem(id) => write!(f, "unknown item {id}"),
            Self::UnknownPath(path) => write!(f, "no item at path `{path}`"),
            Self::ConflictingAuthority(path) => write!(
                f,
                "item `{path}` has both a calculation rule and a read-only value source"
            ),
            Self::WrongKind {
                path,
                expected,
                actual,
            } => write!(
                f,
                "item `{path}` is a {}, expected {expected}",
                actual.as_str()
            ),
            Self::ReadOnlyBinding(path) => {
                write!(f, "item `{path}` is bound to read-only storage")
            }
            Self::ValueShape { path, reason } => {
                write!(f, "values do not fit item `{path}`: {reason}")
            }
            Self::Location(err) => write!(f, "{err}"),
            Self::Lock(err) => write!(f, "{err}"),
            Self::Storage(err) => write!(f, "{err}"),
            Self::Rule { path, source } => write!(f, "rule for `{path}` rejected: {source}"),
            Self::MalformedConfig(message) => write!(f, "malformed configuration: {message}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "{err}"),
        }
    }
}

impl Error for TreeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Location(err) => Some(err),
            Self::Lock(err) => Some(err),
            Self::Storage(err) => Some(err),
            Self::Rule { source, .. } => Some(source),
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<LocationError> for TreeError {
    fn from(value: LocationError) -> Self {
        Self::Location(value)
    }
}

impl From<LockError> for TreeError {
    fn from(value: LockError) -> Self {
        Self::Lock(value)
    }
}

impl From<StorageError> for TreeError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

impl From<std::io::Error> for TreeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for TreeError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Error returned by value-producing engine calls.
#[derive(Debug, Clone)]
pub enum EngineError {
    Tree(Arc<TreeError>),
    /// The item (or something upstream of it) is in `Failed` state.
    Failed(Arc<ItemFailure>),
}

impl EngineError {
    /// The item failure, when this error is one.
    pub fn failure(&self) -> Option<&Arc<ItemFailure>> {
        match self {
            Self::Failed(failure) => Some(failure),
            Self::Tree(_) => None,
        }
    }
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tree(err) => write!(f, "{err}"),
            Self::Failed(failure) => write!(f, "{failure}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Tree(err) => Some(err.as_ref()),
            Self::Failed(failure) => Some(failure.as_ref()),
        }
    }
}

impl From<TreeError> for EngineError {
    fn from(value: TreeError) -> Self {
        Self::Tree(Arc::new(value))
    }
}

impl From<Arc<ItemFailure>> for EngineError {
    fn from(value: Arc<ItemFailure>) -> Self {
        Self::Failed(value)
    }
}
