//! Item progress state machine.
//!
//! # Invariants
//! - Forward transitions follow
//!   `Created -> MetaReady -> {DataReady | Failed} -> Validated -> Committed`.
//! - `Failed` may be entered from any non-terminal state and never advances.
//! - The only backward edge is invalidation, which always lands on `MetaReady`.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Position of one item in its computation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressState {
    Created,
    MetaReady,
    DataReady,
    Failed,
    Validated,
    Committed,
}

impl ProgressState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::MetaReady => "meta_ready",
            Self::DataReady => "data_ready",
            Self::Failed => "failed",
            Self::Validated => "validated",
            Self::Committed => "committed",
        }
    }

    /// Position along the dependency order; `DataReady` and `Failed` share one.
    pub fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::MetaReady => 1,
            Self::DataReady | Self::Failed => 2,
            Self::Validated => 3,
            Self::Committed => 4,
        }
    }

    /// Whether structure (domain sizes, value types) has been established.
    pub fn has_meta(self) -> bool {
        !matches!(self, Self::Created | Self::Failed)
    }

    /// Returns whether `next` is a legal forward transition from `self`.
    ///
    /// Invalidation is not a forward transition; see `can_invalidate`.
    pub fn can_advance_to(self, next: ProgressState) -> bool {
        match (self, next) {
            (Self::Failed, _) | (Self::Committed, _) => false,
            (_, Self::Failed) => true,
            (Self::Created, Self::MetaReady)
            | (Self::MetaReady, Self::DataReady)
            | (Self::DataReady, Self::Validated)
            | (Self::Validated, Self::Committed) => true,
            _ => false,
        }
    }

    /// Returns whether an invalidation edge may fire from `self`.
    pub fn can_invalidate(self) -> bool {
        !matches!(self, Self::Created)
    }
}

impl Display for ProgressState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress state plus the two transient markers orthogonal to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressStatus {
    pub state: ProgressState,
    /// A computation for this item is in flight.
    pub updating: bool,
    /// An upstream dependency or backing file changed since the last attempt.
    pub invalidated: bool,
}
