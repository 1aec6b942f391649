//! Engine-wide primitives shared by the item tree and storage layers.
//!
//! # Responsibility
//! - Provide the logical clock, lock registry, interest ledger, context
//!   stack, observer registry and the calculation-rule boundary.
//!
//! # Invariants
//! - None of these primitives are process globals; each engine session owns
//!   its own instances. The context stack is per thread.

pub mod clock;
pub mod context;
pub mod interest;
pub mod lock_registry;
pub mod observer;
pub mod rule;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
