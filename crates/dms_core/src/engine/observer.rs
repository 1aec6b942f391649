//! Per-item progress observers.
//!
//! Callbacks run synchronously on the thread that caused the transition,
//! before the causing call returns. They must not block and must not call
//! back into the engine.

use crate::engine::lock_unpoisoned;
use crate::model::item::ItemId;
use crate::model::progress::ProgressState;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Callback invoked as `(item, old_state, new_state)`.
pub type ProgressObserver = Arc<dyn Fn(ItemId, ProgressState, ProgressState) + Send + Sync>;

/// Registration handle returned by `ObserverRegistry::subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    observers: Mutex<HashMap<ItemId, Vec<(ObserverId, ProgressObserver)>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, item: ItemId, observer: ProgressObserver) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock_unpoisoned(&self.observers)
            .entry(item)
            .or_default()
            .push((id, observer));
        id
    }

    /// Removes one registration. Returns `false` when it was not present.
    pub fn unsubscribe(&self, item: ItemId, id: ObserverId) -> bool {
        let mut observers = lock_unpoisoned(&self.observers);
        let Some(list) = observers.get_mut(&item) else {
            return false;
        };
        let before = list.len();
        list.retain(|(registered, _)| *registered != id);
        let removed = list.len() != before;
        if list.is_empty() {
            observers.remove(&item);
        }
        removed
    }

    pub fn observer_count(&self, item: ItemId) -> usize {
        lock_unpoisoned(&self.observers)
            .get(&item)
            .map_or(0, Vec::len)
    }

    /// Calls every observer of `item`. The registry lock is not held while
    /// callbacks run.
    pub fn notify(&self, item: ItemId, old: ProgressState, new: ProgressState) {
        let callbacks = match lock_unpoisoned(&self.observers).get(&item) {
            Some(list) => list
                .iter()
                .map(|(_, observer)| Arc::clone(observer))
                .collect::<Vec<_>>(),
            None => return,
        };
        for callback in callbacks {
            callback(item, old, new);
        }
    }
}
