//! Progress-state machine: meta phase, data phase, validation, commit,
//! invalidation and eviction.
//!
//! # Invariants
//! - No node state lock and no registry lock is held while a rule runs or
//!   while another item is being ensured.
//! - A storage lock is never requested while a tile or buffer lock is held.
//! - Observers are notified under the item's state lock, so one item's
//!   transitions reach observers in order.
//! - An item is re-entered on the same thread only through a dependency
//!   cycle; the context stack detects it before any wait.

use crate::engine::context::{self, ContextRole};
use crate::engine::lock_registry::{LockHandle, LockKey, LockResult};
use crate::engine::rule::{ArgumentMeta, CalculationRule, ComputeFn, RuleShape, RuleTarget};
use crate::model::failure::{FailureKind, ItemFailure};
use crate::model::item::{
    DomainRange, ItemData, ItemId, ItemKind, MetaDescriptor, ValueType, Values,
};
use crate::model::progress::ProgressState;
use crate::storage::{StorageError, TileRange};
use crate::tree::engine::Engine;
use crate::tree::node::{ItemDecl, ItemNode, NodeState, StorageBinding, UpdateClaim};
use crate::tree::{EngineResult, TreeError};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError};

pub(crate) type ItemOutcome<T> = Result<T, Arc<ItemFailure>>;

/// Where the data of one data cycle came from; decides write-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataSource {
    /// Declared or rule-derived structure (containers, domain units).
    Structure,
    Rule,
    Storage,
    User,
}

impl DataSource {
    fn writes_back(self) -> bool {
        !matches!(self, Self::Storage)
    }

    fn validation_kind(self) -> FailureKind {
        match self {
            Self::Rule => FailureKind::Computation,
            Self::Storage => FailureKind::Storage,
            Self::Structure | Self::User => FailureKind::Configuration,
        }
    }
}

impl Engine {
    /// Establishes the item's structure without computing values.
    ///
    /// Idempotent; concurrent callers for one item wait for a single
    /// computation.
    pub fn ensure_meta_ready(&self, item: ItemId) -> EngineResult<MetaDescriptor> {
        let node = self.node(item)?;
        Ok(self.meta_phase(&node)?)
    }

    /// Drives the item through data, validation and commit.
    ///
    /// Idempotent; concurrent callers for one item observe a single
    /// computation or storage read.
    pub fn ensure_data_ready(&self, item: ItemId) -> EngineResult<ItemData> {
        let node = self.node(item)?;
        Ok(self.data_phase(&node)?)
    }

    /// Values of an attribute item, computing them if needed.
    pub fn values(&self, item: ItemId) -> EngineResult<Arc<Values>> {
        let node = self.node(item)?;
        match self.data_phase(&node)? {
            ItemData::Attribute(values) => Ok(values),
            _ => Err(TreeError::WrongKind {
                path: node.path.clone(),
                expected: "attribute",
                actual: node.kind(),
            }
            .into()),
        }
    }

    /// Installs user values into a rule-less attribute and commits them,
    /// writing through to a writable storage binding.
    ///
    /// # Errors
    /// - `ConflictingAuthority` when the item has a rule.
    /// - `ReadOnlyBinding` when its storage is read-only.
    /// - `ValueShape` when type or length do not fit the item's domain.
    /// - `Lock` when the calling thread holds a registry lock at or above the
    ///   buffer level.
    /// - `Failed` when the commit fails; the item keeps the values.
    pub fn write_attribute(&self, item: ItemId, values: Values) -> EngineResult<()> {
        let node = self.node(item)?;
        if node.kind() != ItemKind::Attribute {
            return Err(TreeError::WrongKind {
                path: node.path.clone(),
                expected: "attribute",
                actual: node.kind(),
            }
            .into());
        }
        {
            let config = node.config();
            if config.rule.is_some() {
                return Err(TreeError::ConflictingAuthority(node.path.clone()).into());
            }
            if config.binding.as_ref().is_some_and(|binding| binding.read_only) {
                return Err(TreeError::ReadOnlyBinding(node.path.clone()).into());
            }
        }
        self.inner
            .locks
            .check_order(LockKey::buffer(node.id))
            .map_err(TreeError::from)?;

        let (meta, claim) = loop {
            if node.state().progress == ProgressState::Failed {
                self.invalidate_node(&node, "values written")
                    .map_err(TreeError::from)?;
            }
            let meta = self.meta_phase(&node)?;
            if let Some(reason) = shape_mismatch(&meta, &values) {
                return Err(TreeError::ValueShape {
                    path: node.path.clone(),
                    reason,
                }
                .into());
            }
            {
                let mut state = node.state();
                while state.updating {
                    state = node
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                // Structure moved while waiting; check the values against it again.
                if state.meta_current() != Some(meta) {
                    continue;
                }
                state.updating = true;
            }
            break (meta, UpdateClaim::new(&node));
        };

        let data = ItemData::Attribute(Arc::new(values));
        let installed = self.buffer_lock(&node).map(|_buffer| {
            let mut state = node.state();
            if state.progress != ProgressState::MetaReady {
                self.apply_invalidation(&node, &mut state, false);
            }
            state.data = Some(data.clone());
            state.pending_write = true;
            self.advance(&node, &mut state, ProgressState::DataReady);
        });
        let result = installed.and_then(|()| {
            self.validate_and_commit(&node, &meta, data, DataSource::User)
        });
        drop(claim);
        result?;
        self.invalidate_dependents(&node).map_err(TreeError::from)?;
        Ok(())
    }

    /// Frees buffers nobody retains.
    ///
    /// Skips items pinned by `keep_data`, items whose data is the only copy
    /// (pending write-back or no rule/storage to rebuild it), and items whose
    /// buffer is busy. Evicted items take the invalidation edge.
    pub fn evict_unretained(&self) -> usize {
        let mut evicted = 0;
        for node in self.all_nodes() {
            if node.kind() != ItemKind::Attribute {
                continue;
            }
            let keep_data = node.config().keep_data;
            if keep_data || !node.has_source() {
                continue;
            }
            let Ok(Some(_buffer)) = self.inner.locks.try_acquire(LockKey::buffer(node.id)) else {
                continue;
            };
            let reclaimed = self.inner.interest.with_unretained(node.id, || {
                let mut state = node.state();
                if state.updating
                    || state.pending_write
                    || state.data.is_none()
                    || state.progress != ProgressState::Committed
                {
                    return false;
                }
                self.apply_invalidation(&node, &mut state, true);
                true
            });
            if reclaimed == Some(true) {
                evicted += 1;
                debug!(
                    "event=item_evict module=tree status=ok item={}",
                    node.path
                );
            }
        }
        info!("event=evict_unretained module=tree status=ok evicted={evicted}");
        evicted
    }

    pub(crate) fn meta_phase(&self, node: &Arc<ItemNode>) -> ItemOutcome<MetaDescriptor> {
        if context::is_active(ContextRole::MetaReady, node.id) {
            return Err(self.cycle_failure(node));
        }
        let _frame = context::enter(ContextRole::MetaReady, Some(node.id), node.path.clone());
        for dep in node.dependencies() {
            if let Some(dep_node) = self.lookup(dep) {
                let _ = self.meta_phase(&dep_node);
            }
        }
        self.refresh_staleness(node)?;

        {
            let mut state = node.state();
            loop {
                if let Some(meta) = state.meta_current() {
                    return Ok(meta);
                }
                if !state.updating {
                    break;
                }
                state = node
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if state.progress == ProgressState::Failed {
                if let Some(failure) = state.failure.clone() {
                    return Err(failure);
                }
            }
            state.updating = true;
        }
        let claim = UpdateClaim::new(node);
        let outcome = self.establish_meta(node);

        let (_buffer, outcome) = match self.buffer_lock(node) {
            Ok(buffer) => (Some(buffer), outcome),
            Err(failure) => (None, Err(failure)),
        };
        let mut state = node.state();
        let result = match outcome {
            Ok((meta, compute)) => {
                state.meta = Some(meta);
                state.compute = compute;
                state.meta_time = self.inner.clock.tick();
                state.invalidated = false;
                state.failure = None;
                self.advance(node, &mut state, ProgressState::MetaReady);
                Ok(meta)
            }
            Err(failure) => {
                self.mark_failed(node, &mut state, Arc::clone(&failure));
                Err(failure)
            }
        };
        self.finish_update(node, &mut state);
        drop(state);
        drop(claim);
        result
    }

    pub(crate) fn data_phase(&self, node: &Arc<ItemNode>) -> ItemOutcome<ItemData> {
        if context::is_active(ContextRole::DataReady, node.id) {
            return Err(self.cycle_failure(node));
        }
        let _frame = context::enter(ContextRole::DataReady, Some(node.id), node.path.clone());
        let args = node.config().args.clone();
        for arg in args {
            if let Some(arg_node) = self.lookup(arg) {
                let _ = self.data_phase(&arg_node);
            }
        }

        loop {
            let meta = self.meta_phase(node)?;
            {
                let mut state = node.state();
                loop {
                    if let Some(data) = state.data_current() {
                        return Ok(data);
                    }
                    if !state.updating {
                        break;
                    }
                    state = node
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                if state.progress == ProgressState::Failed {
                    if let Some(failure) = state.failure.clone() {
                        return Err(failure);
                    }
                }
                if state.meta_current() != Some(meta) {
                    continue;
                }
                state.updating = true;
            }
            let claim = UpdateClaim::new(node);
            let outcome = self.run_data_cycle(node, &meta);
            drop(claim);
            return outcome;
        }
    }

    fn run_data_cycle(&self, node: &Arc<ItemNode>, meta: &MetaDescriptor) -> ItemOutcome<ItemData> {
        let (data, source) = match self.produce_data(node, meta) {
            Ok(produced) => produced,
            Err(failure) => return Err(self.record_failure(node, failure)),
        };
        let published = self.buffer_lock(node).map(|_buffer| {
            let mut state = node.state();
            state.data = Some(data.clone());
            self.advance(node, &mut state, ProgressState::DataReady);
        });
        if let Err(failure) = published {
            return Err(self.record_failure(node, failure));
        }
        self.validate_and_commit(node, meta, data, source)
    }

    fn produce_data(
        &self,
        node: &Arc<ItemNode>,
        meta: &MetaDescriptor,
    ) -> ItemOutcome<(ItemData, DataSource)> {
        match *meta {
            MetaDescriptor::Container => Ok((ItemData::Container, DataSource::Structure)),
            MetaDescriptor::Domain { range, .. } => {
                let from_storage = matches!(node.decl, ItemDecl::DomainUnit { count: None, .. })
                    && node.config().rule.is_none();
                let source = if from_storage {
                    DataSource::Storage
                } else {
                    DataSource::Structure
                };
                Ok((ItemData::Domain(range), source))
            }
            MetaDescriptor::Attribute {
                domain_range,
                value_type,
                ..
            } => {
                let compute = node.state().compute.clone();
                if let Some(compute) = compute {
                    return self.compute_attribute(node, compute);
                }
                if let Some(binding) = node.binding() {
                    return self.read_attribute(node, &binding, domain_range, value_type);
                }
                Err(self.new_failure(
                    node,
                    FailureKind::Configuration,
                    "attribute has no rule, storage binding or written values",
                    None,
                ))
            }
        }
    }

    fn compute_attribute(
        &self,
        node: &Arc<ItemNode>,
        compute: ComputeFn,
    ) -> ItemOutcome<(ItemData, DataSource)> {
        let args = node.config().args.clone();
        let mut inputs = Vec::with_capacity(args.len());
        for arg in args {
            let arg_node = self.dependency(node, arg)?;
            match self.data_phase(&arg_node) {
                Ok(ItemData::Attribute(values)) => inputs.push(values),
                Ok(ItemData::Domain(range)) => {
                    inputs.push(Arc::new(Values::index_sequence(range.count)))
                }
                Ok(ItemData::Container) => {
                    return Err(self.new_failure(
                        node,
                        FailureKind::Configuration,
                        format!("container `{}` cannot be a rule argument", arg_node.path),
                        None,
                    ))
                }
                Err(failure) => return Err(self.upstream_failure(node, &arg_node, &failure)),
            }
        }

        let values = compute(&inputs).map_err(|err| {
            self.new_failure(
                node,
                FailureKind::Computation,
                format!("rule evaluation failed: {err}"),
                None,
            )
        })?;
        Ok((ItemData::Attribute(Arc::new(values)), DataSource::Rule))
    }

    /// Reads one attribute tile by tile into a private staging buffer.
    ///
    /// The staging buffer is invisible to other threads until
    /// `run_data_cycle` publishes it under the item's buffer lock, which is
    /// the only exclusive write.
    fn read_attribute(
        &self,
        node: &Arc<ItemNode>,
        binding: &StorageBinding,
        domain_range: DomainRange,
        value_type: ValueType,
    ) -> ItemOutcome<(ItemData, DataSource)> {
        let tile_size = match node.decl {
            ItemDecl::Attribute { tile_size, .. } => tile_size,
            _ => None,
        };
        binding
            .storage
            .reconcile()
            .map_err(|err| self.storage_failure(node, err))?;
        let session = binding
            .storage
            .open_for_read()
            .map_err(|err| self.storage_failure(node, err))?;

        let mut buffer = Values::empty(value_type);
        for tile in TileRange::split(domain_range.count, tile_size) {
            let part = session
                .read_attribute(&binding.role, tile, value_type)
                .map_err(|err| self.storage_failure(node, err))?;
            buffer.append(part).map_err(|err| {
                self.new_failure(node, FailureKind::Storage, err.to_string(), None)
            })?;
        }
        session
            .finish()
            .map_err(|err| self.storage_failure(node, err))?;
        Ok((ItemData::Attribute(Arc::new(buffer)), DataSource::Storage))
    }

    fn establish_meta(
        &self,
        node: &Arc<ItemNode>,
    ) -> ItemOutcome<(MetaDescriptor, Option<ComputeFn>)> {
        let (rule, args, binding) = {
            let config = node.config();
            (config.rule.clone(), config.args.clone(), config.binding.clone())
        };
        match node.decl {
            ItemDecl::Container => Ok((MetaDescriptor::Container, None)),
            ItemDecl::DomainUnit {
                count,
                element_type,
            } => {
                let range = if let Some(rule) = rule {
                    let evaluation = self.evaluate_rule(node, rule.as_ref(), &args, None)?;
                    match evaluation.shape {
                        RuleShape::Domain { count } => DomainRange::new(count),
                        RuleShape::Attribute { .. } => {
                            return Err(self.new_failure(
                                node,
                                FailureKind::Configuration,
                                "rule yields attribute values for a domain unit",
                                None,
                            ))
                        }
                    }
                } else if let Some(count) = count {
                    DomainRange::new(count)
                } else if let Some(binding) = binding {
                    self.read_domain_range(node, &binding)?
                } else {
                    return Err(self.new_failure(
                        node,
                        FailureKind::Configuration,
                        "domain unit has no count, rule or storage binding",
                        None,
                    ));
                };
                Ok((
                    MetaDescriptor::Domain {
                        range,
                        element_type,
                    },
                    None,
                ))
            }
            ItemDecl::Attribute {
                domain, value_type, ..
            } => {
                let domain_node = self.dependency(node, domain)?;
                let domain_meta = self
                    .meta_phase(&domain_node)
                    .map_err(|failure| self.upstream_failure(node, &domain_node, &failure))?;
                let MetaDescriptor::Domain { range, .. } = domain_meta else {
                    return Err(self.new_failure(
                        node,
                        FailureKind::Configuration,
                        format!("`{}` is not a domain unit", domain_node.path),
                        None,
                    ));
                };

                let compute = match rule {
                    Some(rule) => {
                        let evaluation =
                            self.evaluate_rule(node, rule.as_ref(), &args, Some(value_type))?;
                        match (evaluation.shape, evaluation.compute) {
                            (RuleShape::Attribute { value_type: produced }, Some(compute))
                                if produced == value_type =>
                            {
                                Some(compute)
                            }
                            (RuleShape::Attribute { value_type: produced }, Some(_)) => {
                                return Err(self.new_failure(
                                    node,
                                    FailureKind::Configuration,
                                    format!(
                                        "rule produces `{produced}` values, item declares `{value_type}`"
                                    ),
                                    None,
                                ))
                            }
                            _ => {
                                return Err(self.new_failure(
                                    node,
                                    FailureKind::Configuration,
                                    "rule yields no attribute compute function",
                                    None,
                                ))
                            }
                        }
                    }
                    None => None,
                };
                Ok((
                    MetaDescriptor::Attribute {
                        domain,
                        domain_range: range,
                        value_type,
                    },
                    compute,
                ))
            }
        }
    }

    fn evaluate_rule(
        &self,
        node: &Arc<ItemNode>,
        rule: &dyn CalculationRule,
        args: &[ItemId],
        value_type: Option<ValueType>,
    ) -> ItemOutcome<crate::engine::rule::Evaluation> {
        let mut metas = Vec::with_capacity(args.len());
        for arg in args {
            let arg_node = self.dependency(node, *arg)?;
            let meta = self
                .meta_phase(&arg_node)
                .map_err(|failure| self.upstream_failure(node, &arg_node, &failure))?;
            metas.push(ArgumentMeta {
                id: arg_node.id,
                path: arg_node.path.clone(),
                meta,
            });
        }
        let target = RuleTarget {
            id: node.id,
            path: node.path.clone(),
            kind: node.kind(),
            value_type,
        };
        rule.evaluate(&target, &metas).map_err(|err| {
            self.new_failure(
                node,
                FailureKind::Computation,
                format!("rule evaluation failed: {err}"),
                None,
            )
        })
    }

    /// Reads a domain unit's count from storage under its metadata lock.
    fn read_domain_range(
        &self,
        node: &Arc<ItemNode>,
        binding: &StorageBinding,
    ) -> ItemOutcome<DomainRange> {
        let _metadata = self
            .inner
            .locks
            .acquire(LockKey::metadata(node.id))
            .map_err(|err| self.storage_failure(node, err.into()))?;
        binding
            .storage
            .reconcile()
            .map_err(|err| self.storage_failure(node, err))?;
        let session = binding
            .storage
            .open_for_read()
            .map_err(|err| self.storage_failure(node, err))?;
        let range = session
            .read_domain_range(&binding.role)
            .map_err(|err| self.storage_failure(node, err))?;
        session
            .finish()
            .map_err(|err| self.storage_failure(node, err))?;
        Ok(range)
    }

    fn validate_and_commit(
        &self,
        node: &Arc<ItemNode>,
        meta: &MetaDescriptor,
        data: ItemData,
        source: DataSource,
    ) -> ItemOutcome<ItemData> {
        {
            let _frame = context::enter(ContextRole::Validate, Some(node.id), node.path.clone());
            if let Some(reason) = data_mismatch(meta, &data) {
                let failure = self.new_failure(node, source.validation_kind(), reason, None);
                return Err(self.record_failure(node, failure));
            }
            let mut state = node.state();
            self.advance(node, &mut state, ProgressState::Validated);
        }

        if let Some(binding) = node.binding().filter(|binding| !binding.read_only) {
            if source.writes_back() {
                let _frame = context::enter(ContextRole::Commit, Some(node.id), node.path.clone());
                if let Err(failure) = self.write_back(node, &binding, &data) {
                    return Err(self.record_failure(node, failure));
                }
            }
        }

        let _buffer = match self.buffer_lock(node) {
            Ok(buffer) => buffer,
            Err(failure) => return Err(self.record_failure(node, failure)),
        };
        let mut state = node.state();
        state.commit_time = self.inner.clock.tick();
        state.pending_write = false;
        self.advance(node, &mut state, ProgressState::Committed);
        self.finish_update(node, &mut state);
        Ok(data)
    }

    fn write_back(
        &self,
        node: &Arc<ItemNode>,
        binding: &StorageBinding,
        data: &ItemData,
    ) -> ItemOutcome<()> {
        binding
            .storage
            .reconcile()
            .map_err(|err| self.storage_failure(node, err))?;
        let session = binding
            .storage
            .open_for_write()
            .map_err(|err| self.storage_failure(node, err))?;
        let written = match data {
            ItemData::Attribute(values) => session.write_attribute(&binding.role, values),
            ItemData::Domain(range) => session.write_domain_range(&binding.role, *range),
            ItemData::Container => Ok(()),
        };
        let finished = session.finish();
        written
            .and(finished)
            .map_err(|err| self.storage_failure(node, err))
    }

    /// Invalidates `node` when its backing storage or a dependency changed
    /// after its last meta, commit or failure.
    ///
    /// Does not cascade; dependents notice through their own stamps. A
    /// lock-order error is returned to the caller and leaves the item as is.
    fn refresh_staleness(&self, node: &Arc<ItemNode>) -> ItemOutcome<()> {
        let (progress, reference) = {
            let state = node.state();
            if state.updating
                || state.progress == ProgressState::Created
                || (state.meta_current().is_none() && state.progress != ProgressState::Failed)
            {
                return Ok(());
            }
            let reference = match state.progress {
                ProgressState::Failed => state.failed_at,
                ProgressState::Committed => state.commit_time,
                _ => state.meta_time,
            };
            (state.progress, reference)
        };
        let meta_only = !matches!(progress, ProgressState::Committed | ProgressState::Failed);

        let mut reason = None;
        if let Some(binding) = node.binding() {
            let storage_shapes_meta = matches!(node.decl, ItemDecl::DomainUnit { .. });
            if !meta_only || storage_shapes_meta {
                match binding.storage.reconcile() {
                    Ok(change) if change > reference => reason = Some("backing storage changed"),
                    Ok(_) => {}
                    Err(err) => warn!(
                        "event=storage_reconcile module=tree status=error item={} error={}",
                        node.path, err
                    ),
                }
            }
        }

        if reason.is_none() {
            let args = node.config().args.clone();
            for dep in node.dependencies() {
                let Some(dep_node) = self.lookup(dep) else {
                    continue;
                };
                let dep_state = dep_node.state();
                let stamp = if meta_only || !args.contains(&dep) {
                    dep_state.meta_time
                } else {
                    dep_state.meta_time.max(dep_state.commit_time)
                };
                if stamp > reference {
                    reason = Some("dependency changed");
                    break;
                }
            }
        }

        if let Some(reason) = reason {
            self.invalidate_node(node, reason).map_err(|err| {
                self.new_failure(node, FailureKind::Configuration, err.to_string(), None)
            })?;
        }
        Ok(())
    }

    /// Fires the invalidation edge on one item. Returns whether it moved.
    ///
    /// # Errors
    /// - `LevelViolation` when the calling thread holds a lock at or above
    ///   the buffer level; the item is left untouched.
    pub(crate) fn invalidate_node(&self, node: &ItemNode, reason: &str) -> LockResult<bool> {
        let _buffer = self.inner.locks.acquire(LockKey::buffer(node.id))?;
        let mut state = node.state();
        if !state.progress.can_invalidate() {
            return Ok(false);
        }
        if state.updating {
            state.invalidate_requested = true;
            return Ok(true);
        }
        if state.progress == ProgressState::MetaReady && state.invalidated {
            return Ok(false);
        }
        debug!(
            "event=item_invalidate module=tree status=ok item={} reason={}",
            node.path,
            reason.replace(' ', "_")
        );
        self.apply_invalidation(node, &mut state, true);
        Ok(true)
    }

    /// Returns to `MetaReady`, dropping data. Caller holds the buffer lock.
    fn apply_invalidation(&self, node: &ItemNode, state: &mut NodeState, mark: bool) {
        let old = state.progress;
        state.progress = ProgressState::MetaReady;
        state.invalidated = mark;
        state.data = None;
        state.failure = None;
        state.pending_write = false;
        if old != ProgressState::MetaReady {
            debug!(
                "event=item_transition module=tree status=ok item={} from={} to={}",
                node.path,
                old,
                ProgressState::MetaReady
            );
            self.inner
                .observers
                .notify(node.id, old, ProgressState::MetaReady);
        }
    }

    fn advance(&self, node: &ItemNode, state: &mut NodeState, next: ProgressState) {
        let old = state.progress;
        if old == next {
            return;
        }
        if !old.can_advance_to(next) {
            error!(
                "event=item_transition module=tree status=error item={} from={} to={} error_code=illegal_transition",
                node.path, old, next
            );
            return;
        }
        state.progress = next;
        debug!(
            "event=item_transition module=tree status=ok item={} from={} to={}",
            node.path, old, next
        );
        self.inner.observers.notify(node.id, old, next);
    }

    /// Applies an invalidation that arrived while the update was in flight.
    fn finish_update(&self, node: &ItemNode, state: &mut NodeState) {
        if std::mem::take(&mut state.invalidate_requested) {
            self.apply_invalidation(node, state, true);
        }
    }

    fn mark_failed(&self, node: &ItemNode, state: &mut NodeState, failure: Arc<ItemFailure>) {
        state.failed_at = self.inner.clock.tick();
        state.failure = Some(failure);
        self.advance(node, state, ProgressState::Failed);
    }

    /// Marks the item failed. The data buffer is not touched, so the record
    /// is written even when lock order forbids the buffer lock.
    fn record_failure(&self, node: &ItemNode, failure: Arc<ItemFailure>) -> Arc<ItemFailure> {
        let _buffer = self.inner.locks.acquire(LockKey::buffer(node.id)).ok();
        let mut state = node.state();
        self.mark_failed(node, &mut state, Arc::clone(&failure));
        self.finish_update(node, &mut state);
        failure
    }

    fn new_failure(
        &self,
        node: &ItemNode,
        kind: FailureKind,
        reason: impl Into<String>,
        cause: Option<ItemId>,
    ) -> Arc<ItemFailure> {
        let reason = reason.into();
        let diagnostic = context::describe_failure(&reason, &self.inner.session);
        warn!(
            "event=item_failed module=tree status=error item={} kind={} root={}",
            node.path,
            kind.as_str(),
            cause.is_none()
        );
        Arc::new(ItemFailure {
            item: node.id,
            item_path: node.path.clone(),
            kind,
            reason,
            cause,
            diagnostic,
        })
    }

    fn storage_failure(&self, node: &ItemNode, err: StorageError) -> Arc<ItemFailure> {
        let kind = match err {
            StorageError::ExternalChange(_) => FailureKind::Consistency,
            _ => FailureKind::Storage,
        };
        self.new_failure(node, kind, err.to_string(), None)
    }

    fn cycle_failure(&self, node: &ItemNode) -> Arc<ItemFailure> {
        self.new_failure(
            node,
            FailureKind::Configuration,
            format!("dependency cycle through `{}`", node.path),
            None,
        )
    }

    /// Failure of `node` caused by `upstream`; becomes a cycle root when the
    /// upstream chain leads back to `node`.
    fn upstream_failure(
        &self,
        node: &ItemNode,
        upstream: &ItemNode,
        failure: &Arc<ItemFailure>,
    ) -> Arc<ItemFailure> {
        if self.chain_reaches(failure, node.id) {
            return self.cycle_failure(node);
        }
        self.new_failure(
            node,
            failure.kind,
            format!("depends on failed item `{}`", upstream.path),
            Some(upstream.id),
        )
    }

    fn chain_reaches(&self, failure: &Arc<ItemFailure>, target: ItemId) -> bool {
        let mut visited = HashSet::new();
        let mut current = Arc::clone(failure);
        loop {
            if current.item == target {
                return true;
            }
            let Some(cause) = current.cause else {
                return false;
            };
            if cause == target {
                return true;
            }
            if !visited.insert(cause) {
                return false;
            }
            let Some(next) = self
                .lookup(cause)
                .and_then(|node| node.state().failure.clone())
            else {
                return false;
            };
            current = next;
        }
    }

    fn dependency(&self, node: &ItemNode, id: ItemId) -> ItemOutcome<Arc<ItemNode>> {
        self.lookup(id).ok_or_else(|| {
            self.new_failure(
                node,
                FailureKind::Configuration,
                format!("dependency {id} does not exist"),
                None,
            )
        })
    }

    /// Exclusive access to the item's buffer. A lock-order violation is a
    /// configuration failure of the item.
    fn buffer_lock(&self, node: &ItemNode) -> ItemOutcome<LockHandle> {
        self.inner
            .locks
            .acquire(LockKey::buffer(node.id))
            .map_err(|err| {
                error!(
                    "event=buffer_lock module=tree status=error item={} error={}",
                    node.path, err
                );
                self.new_failure(
                    node,
                    FailureKind::Configuration,
                    format!("cannot lock item buffer: {err}"),
                    None,
                )
            })
    }
}

fn shape_mismatch(meta: &MetaDescriptor, values: &Values) -> Option<String> {
    let MetaDescriptor::Attribute {
        domain_range,
        value_type,
        ..
    } = meta
    else {
        return Some("item is not an attribute".to_string());
    };
    if values.value_type() != *value_type {
        return Some(format!(
            "expected `{value_type}` values, got `{}`",
            values.value_type()
        ));
    }
    if values.len() != domain_range.count as usize {
        return Some(format!(
            "expected {} values, got {}",
            domain_range.count,
            values.len()
        ));
    }
    None
}

fn data_mismatch(meta: &MetaDescriptor, data: &ItemData) -> Option<String> {
    match (meta, data) {
        (MetaDescriptor::Attribute { .. }, ItemData::Attribute(values)) => {
            shape_mismatch(meta, values)
        }
        (MetaDescriptor::Domain { range, .. }, ItemData::Domain(actual)) if range == actual => None,
        (MetaDescriptor::Container, ItemData::Container) => None,
        _ => Some("data does not match the item's structure".to_string()),
    }
}
