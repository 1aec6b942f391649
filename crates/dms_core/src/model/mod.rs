//! Plain data model shared by the item tree, storage and diagnostics layers.
//!
//! # Responsibility
//! - Define item identity, kinds, value arrays and structural metadata.
//! - Define the progress state machine and its legal transitions.
//! - Define the failure taxonomy surfaced to consumers.
//!
//! # Invariants
//! - Every item is identified by a stable `ItemId`.
//! - `Values` always carries exactly one element type.

pub mod failure;
pub mod item;
pub mod progress;
