//! Interest ledger: scoped retain/release of computed item results.
//!
//! # Invariants
//! - Retain counts change only through `InterestGuard` creation and drop, so
//!   a release can neither be forgotten nor repeated.
//! - Guards are reentrant: nested guards for the same item stack their counts.
//! - An item with a non-zero count is never reported as reclaimable.

use crate::engine::lock_unpoisoned;
use crate::model::item::ItemId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct LedgerInner {
    counts: Mutex<HashMap<ItemId, usize>>,
}

/// Session-scoped retain counts; cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct InterestLedger {
    inner: Arc<LedgerInner>,
}

impl InterestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retains every item in `items` until the returned guard is dropped.
    ///
    /// Duplicate ids are retained once per occurrence.
    pub fn retain(&self, items: &[ItemId]) -> InterestGuard {
        {
            let mut counts = lock_unpoisoned(&self.inner.counts);
            for item in items {
                *counts.entry(*item).or_insert(0) += 1;
            }
        }
        InterestGuard {
            ledger: Arc::clone(&self.inner),
            items: items.to_vec(),
        }
    }

    pub fn retain_count(&self, item: ItemId) -> usize {
        lock_unpoisoned(&self.inner.counts)
            .get(&item)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_retained(&self, item: ItemId) -> bool {
        self.retain_count(item) > 0
    }

    /// Number of items with a live retain.
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.inner.counts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `reclaim` only if `item` is unretained, holding the ledger so no
    /// retain can slip in between the check and the reclamation.
    ///
    /// Returns `None` when the item is retained.
    pub fn with_unretained<T>(&self, item: ItemId, reclaim: impl FnOnce() -> T) -> Option<T> {
        let counts = lock_unpoisoned(&self.inner.counts);
        if counts.get(&item).copied().unwrap_or(0) > 0 {
            return None;
        }
        let result = reclaim();
        drop(counts);
        Some(result)
    }
}

/// Scope guard returned by `InterestLedger::retain`.
#[derive(Debug)]
#[must_use = "dropping the guard releases the retained items immediately"]
pub struct InterestGuard {
    ledger: Arc<LedgerInner>,
    items: Vec<ItemId>,
}

impl InterestGuard {
    pub fn items(&self) -> &[ItemId] {
        &self.items
    }
}

impl Drop for InterestGuard {
    fn drop(&mut self) {
        let mut counts = lock_unpoisoned(&self.ledger.counts);
        for item in &self.items {
            if let Some(count) = counts.get_mut(item) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counts.remove(item);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::InterestLedger;
    use uuid::Uuid;

    #[test]
    fn guard_releases_on_drop() {
        let ledger = InterestLedger::new();
        let item = Uuid::new_v4();
        {
            let _guard = ledger.retain(&[item]);
            assert_eq!(ledger.retain_count(item), 1);
        }
        assert_eq!(ledger.retain_count(item), 0);
        assert!(ledger.is_empty());
    }

    #[test]
    fn nested_guards_stack_counts() {
        let ledger = InterestLedger::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let outer = ledger.retain(&[a, b]);
        let inner = ledger.retain(&[a, a]);
        assert_eq!(ledger.retain_count(a), 3);
        assert_eq!(ledger.retain_count(b), 1);

        drop(inner);
        assert_eq!(ledger.retain_count(a), 1);
        drop(outer);
        assert!(ledger.is_empty());
    }

    #[test]
    fn guard_releases_during_unwind() {
        let ledger = InterestLedger::new();
        let item = Uuid::new_v4();
        let cloned = ledger.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.retain(&[item]);
            panic!("operation failed");
        });
        assert!(result.is_err());
        assert!(!ledger.is_retained(item));
    }

    #[test]
    fn with_unretained_skips_retained_items() {
        let ledger = InterestLedger::new();
        let item = Uuid::new_v4();
        let guard = ledger.retain(&[item]);
        assert_eq!(ledger.with_unretained(item, || "reclaimed"), None);
        drop(guard);
        assert_eq!(ledger.with_unretained(item, || "reclaimed"), Some("reclaimed"));
    }
}
