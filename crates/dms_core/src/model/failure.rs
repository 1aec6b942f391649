//! Failure taxonomy for item computation.
//!
//! # Responsibility
//! - Classify failures caught at the item boundary.
//! - Carry the immediate upstream cause so consumers can walk to the root.
//!
//! # Invariants
//! - A failure is attached to exactly one item and never re-thrown.
//! - `cause` points at the upstream item whose failure blocked this one.

use crate::model::item::ItemId;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Category of one item failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Conflicting rule/storage authority, malformed location, bad structure.
    Configuration,
    /// Open/read/write failure or permission denied.
    Storage,
    /// Rule evaluation failed.
    Computation,
    /// External change detected during an open write session.
    Consistency,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Storage => "storage",
            Self::Computation => "computation",
            Self::Consistency => "consistency",
        }
    }
}

/// Failure record attached to an item in `Failed` state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub item: ItemId,
    pub item_path: String,
    pub kind: FailureKind,
    /// Human-readable reason.
    pub reason: String,
    /// Upstream item whose failure caused this one, if any.
    pub cause: Option<ItemId>,
    /// Reason plus context frames and session metadata.
    pub diagnostic: String,
}

impl ItemFailure {
    /// Returns whether this failure originates in this item itself.
    pub fn is_root(&self) -> bool {
        self.cause.is_none()
    }
}

impl Display for ItemFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failure at `{}`: {}",
            self.kind.as_str(),
            self.item_path,
            self.reason
        )
    }
}

impl Error for ItemFailure {}

/// Stable presentation triple handed to GUI/CLI layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub item_path: String,
    pub kind: FailureKind,
    pub reason: String,
    /// Paths from the reporting item to the root cause, inclusive.
    pub origin_chain: Vec<String>,
    pub diagnostic: String,
}

impl FailureReport {
    /// Path of the root-cause item.
    pub fn root_cause_path(&self) -> &str {
        self.origin_chain
            .last()
            .map(String::as_str)
            .unwrap_or(self.item_path.as_str())
    }
}
