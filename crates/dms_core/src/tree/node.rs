//! Per-item node: immutable identity, mutable configuration, progress state.
//!
//! # Invariants
//! - `config` and `state` are never locked at the same time by one thread.
//! - `updating` is set by exactly one thread at a time (the claim holder);
//!   everyone else waits on `changed`.

use crate::engine::clock::LogicalTime;
use crate::engine::lock_unpoisoned;
use crate::engine::rule::{CalculationRule, ComputeFn};
use crate::model::failure::ItemFailure;
use crate::model::item::{ItemData, ItemId, ItemKind, MetaDescriptor, ValueType};
use crate::model::progress::{ProgressState, ProgressStatus};
use crate::storage::SharedStorage;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Declared structure of an item, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemDecl {
    Container,
    DomainUnit {
        count: Option<u32>,
        element_type: ValueType,
    },
    Attribute {
        domain: ItemId,
        value_type: ValueType,
        tile_size: Option<u32>,
    },
}

impl ItemDecl {
    pub(crate) fn kind(&self) -> ItemKind {
        match self {
            Self::Container => ItemKind::Container,
            Self::DomainUnit { .. } => ItemKind::DomainUnit,
            Self::Attribute { .. } => ItemKind::Attribute,
        }
    }
}

/// Storage binding of one item.
#[derive(Clone)]
pub(crate) struct StorageBinding {
    pub storage: Arc<SharedStorage>,
    pub role: String,
    pub read_only: bool,
    /// Location as configured, before placeholder substitution.
    pub raw_location: String,
}

#[derive(Default)]
pub(crate) struct NodeConfig {
    pub children: Vec<ItemId>,
    pub rule: Option<Arc<dyn CalculationRule>>,
    /// Resolved rule arguments in declaration order.
    pub args: Vec<ItemId>,
    pub binding: Option<StorageBinding>,
    pub keep_data: bool,
    /// Items whose rule or domain refers to this item.
    pub dependents: Vec<ItemId>,
}

pub(crate) struct NodeState {
    pub progress: ProgressState,
    pub updating: bool,
    pub invalidated: bool,
    /// Explicit invalidation that arrived while an update was in flight.
    pub invalidate_requested: bool,
    pub meta: Option<MetaDescriptor>,
    pub compute: Option<ComputeFn>,
    pub data: Option<ItemData>,
    pub meta_time: LogicalTime,
    pub commit_time: LogicalTime,
    pub failed_at: LogicalTime,
    pub failure: Option<Arc<ItemFailure>>,
    /// User-written data not yet committed to storage.
    pub pending_write: bool,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            progress: ProgressState::Created,
            updating: false,
            invalidated: false,
            invalidate_requested: false,
            meta: None,
            compute: None,
            data: None,
            meta_time: LogicalTime::ZERO,
            commit_time: LogicalTime::ZERO,
            failed_at: LogicalTime::ZERO,
            failure: None,
            pending_write: false,
        }
    }
}

impl NodeState {
    pub(crate) fn status(&self) -> ProgressStatus {
        ProgressStatus {
            state: self.progress,
            updating: self.updating,
            invalidated: self.invalidated,
        }
    }

    /// Meta established and not invalidated.
    pub(crate) fn meta_current(&self) -> Option<MetaDescriptor> {
        if self.invalidated || !self.progress.has_meta() {
            return None;
        }
        self.meta
    }

    /// Data committed and not invalidated.
    pub(crate) fn data_current(&self) -> Option<ItemData> {
        if self.invalidated || self.progress != ProgressState::Committed {
            return None;
        }
        self.data.clone()
    }
}

pub(crate) struct ItemNode {
    pub id: ItemId,
    pub name: String,
    pub parent: Option<ItemId>,
    pub path: String,
    pub decl: ItemDecl,
    pub config: Mutex<NodeConfig>,
    pub state: Mutex<NodeState>,
    pub changed: Condvar,
}

impl ItemNode {
    pub(crate) fn new(
        id: ItemId,
        name: String,
        parent: Option<ItemId>,
        path: String,
        decl: ItemDecl,
    ) -> Self {
        Self {
            id,
            name,
            parent,
            path,
            decl,
            config: Mutex::new(NodeConfig::default()),
            state: Mutex::new(NodeState::default()),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn kind(&self) -> ItemKind {
        self.decl.kind()
    }

    pub(crate) fn config(&self) -> MutexGuard<'_, NodeConfig> {
        lock_unpoisoned(&self.config)
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, NodeState> {
        lock_unpoisoned(&self.state)
    }

    pub(crate) fn binding(&self) -> Option<StorageBinding> {
        self.config().binding.clone()
    }

    /// Rule arguments plus the attribute's domain, deduplicated.
    pub(crate) fn dependencies(&self) -> Vec<ItemId> {
        let mut deps = self.config().args.clone();
        if let Some(domain) = self.domain() {
            if !deps.contains(&domain) {
                deps.push(domain);
            }
        }
        deps
    }

    pub(crate) fn domain(&self) -> Option<ItemId> {
        match self.decl {
            ItemDecl::Attribute { domain, .. } => Some(domain),
            _ => None,
        }
    }

    /// Whether dropped data could be produced again without user input.
    pub(crate) fn has_source(&self) -> bool {
        let config = self.config();
        config.rule.is_some() || config.binding.is_some()
    }
}

/// Exclusive update claim on one node; releases `updating` and wakes waiters
/// on drop, including during unwinding.
pub(crate) struct UpdateClaim<'a> {
    node: &'a ItemNode,
}

impl<'a> UpdateClaim<'a> {
    /// Caller must have set `updating` while holding the state lock.
    pub(crate) fn new(node: &'a ItemNode) -> Self {
        Self { node }
    }
}

impl Drop for UpdateClaim<'_> {
    fn drop(&mut self) {
        self.node.state().updating = false;
        self.node.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::{ItemDecl, ItemNode, NodeState, UpdateClaim};
    use crate::model::item::{ItemKind, ValueType};
    use crate::model::progress::ProgressState;
    use uuid::Uuid;

    fn attribute_node(domain: Uuid) -> ItemNode {
        ItemNode::new(
            Uuid::new_v4(),
            "a".to_string(),
            None,
            "/a".to_string(),
            ItemDecl::Attribute {
                domain,
                value_type: ValueType::Int32,
                tile_size: None,
            },
        )
    }

    #[test]
    fn dependencies_include_domain_once() {
        let domain = Uuid::new_v4();
        let node = attribute_node(domain);
        node.config().args = vec![domain];
        assert_eq!(node.dependencies(), vec![domain]);
        assert_eq!(node.kind(), ItemKind::Attribute);
    }

    #[test]
    fn invalidated_state_hides_meta_and_data() {
        let mut state = NodeState {
            progress: ProgressState::MetaReady,
            invalidated: true,
            ..NodeState::default()
        };
        assert!(state.meta_current().is_none());
        state.invalidated = false;
        assert!(state.data_current().is_none());
    }

    #[test]
    fn claim_drop_clears_updating() {
        let node = attribute_node(Uuid::new_v4());
        node.state().updating = true;
        drop(UpdateClaim::new(&node));
        assert!(!node.state().updating);
    }
}
