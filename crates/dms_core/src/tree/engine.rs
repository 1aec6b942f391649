//! Engine session handle: item namespace, bindings, rules and queries.
//!
//! # Responsibility
//! - Build the item tree (directly or from a `TreeConfig`).
//! - Own every session-scoped primitive: clock, lock registry, interest
//!   ledger, observers, storage registry.
//! - Expose progress, failure and origin-chain queries.
//!
//! # Invariants
//! - The tree index lock is taken before any node's `config` lock, never after.
//! - Items are never removed; ids stay valid for the session.
//!
//! # See also
//! - `tree::compute` for the progress state machine itself.

use crate::engine::clock::LogicalClock;
use crate::engine::context::{self, ContextRole, SessionInfo};
use crate::engine::interest::{InterestGuard, InterestLedger};
use crate::engine::lock_registry::{LockRegistry, LockResult};
use crate::engine::observer::{ObserverId, ObserverRegistry, ProgressObserver};
use crate::engine::rule::{CalculationRule, RuleResolver};
use crate::model::failure::{FailureReport, ItemFailure};
use crate::model::item::{ItemId, ItemKind, ValueType};
use crate::model::progress::{ProgressState, ProgressStatus};
use crate::storage::{PlaceholderTable, StorageRegistry};
use crate::tree::config::{EngineConfig, ItemConfig, ItemKindConfig, StorageConfig, TreeConfig};
use crate::tree::node::{ItemDecl, ItemNode, StorageBinding};
use crate::tree::{TreeError, TreeResult};
use log::{error, info};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

pub(crate) struct TreeIndex {
    pub root: ItemId,
    pub nodes: HashMap<ItemId, Arc<ItemNode>>,
}

pub(crate) struct EngineInner {
    pub session: SessionInfo,
    pub config: EngineConfig,
    pub placeholders: PlaceholderTable,
    pub clock: Arc<LogicalClock>,
    pub locks: LockRegistry,
    pub interest: InterestLedger,
    pub observers: ObserverRegistry,
    pub storage: StorageRegistry,
    pub tree: RwLock<TreeIndex>,
}

/// One engine session; cheap to clone and shareable across threads.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Engine {
    /// Starts a session with the built-in storage backends registered.
    pub fn new(config: EngineConfig) -> Self {
        let clock = Arc::new(LogicalClock::new());
        let locks = LockRegistry::new();
        let storage = StorageRegistry::with_builtin_factories(locks.clone(), Arc::clone(&clock));
        let root = Uuid::new_v4();
        let root_node = Arc::new(ItemNode::new(
            root,
            String::new(),
            None,
            "/".to_string(),
            ItemDecl::Container,
        ));
        let session = SessionInfo::new();
        info!(
            "event=engine_start module=tree status=ok session={} config_name={}",
            session.session_id, config.config_name
        );
        Self {
            inner: Arc::new(EngineInner {
                session,
                placeholders: config.placeholder_table(),
                config,
                clock,
                locks,
                interest: InterestLedger::new(),
                observers: ObserverRegistry::new(),
                storage,
                tree: RwLock::new(TreeIndex {
                    root,
                    nodes: HashMap::from([(root, root_node)]),
                }),
            }),
        }
    }

    pub fn session(&self) -> &SessionInfo {
        &self.inner.session
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.inner.clock
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.inner.locks
    }

    pub fn interest(&self) -> &InterestLedger {
        &self.inner.interest
    }

    /// Storage factory registry; register extra backends here.
    pub fn storage(&self) -> &StorageRegistry {
        &self.inner.storage
    }

    pub fn root(&self) -> ItemId {
        self.read_tree().root
    }

    pub fn add_container(&self, parent: ItemId, name: &str) -> TreeResult<ItemId> {
        self.add_item(parent, name, ItemDecl::Container)
    }

    /// Adds a domain unit. Without `count`, the count comes from a rule or a
    /// storage binding at meta time.
    pub fn add_domain_unit(
        &self,
        parent: ItemId,
        name: &str,
        count: Option<u32>,
        element_type: ValueType,
    ) -> TreeResult<ItemId> {
        self.add_item(
            parent,
            name,
            ItemDecl::DomainUnit {
                count,
                element_type,
            },
        )
    }

    /// Adds an attribute over `domain`, which must be a domain unit.
    pub fn add_attribute(
        &self,
        parent: ItemId,
        name: &str,
        domain: ItemId,
        value_type: ValueType,
        tile_size: Option<u32>,
    ) -> TreeResult<ItemId> {
        let domain_node = self.node(domain)?;
        if domain_node.kind() != ItemKind::DomainUnit {
            return Err(TreeError::WrongKind {
                path: domain_node.path.clone(),
                expected: "domain unit",
                actual: domain_node.kind(),
            });
        }
        let id = self.add_item(
            parent,
            name,
            ItemDecl::Attribute {
                domain,
                value_type,
                tile_size,
            },
        )?;
        domain_node.config().dependents.push(id);
        Ok(id)
    }

    fn add_item(&self, parent: ItemId, name: &str, decl: ItemDecl) -> TreeResult<ItemId> {
        validate_name(name)?;
        let mut tree = self.write_tree();
        let parent_node = tree
            .nodes
            .get(&parent)
            .cloned()
            .ok_or(TreeError::UnknownItem(parent))?;
        if parent_node.kind() == ItemKind::Attribute {
            return Err(TreeError::WrongKind {
                path: parent_node.path.clone(),
                expected: "container or domain unit",
                actual: ItemKind::Attribute,
            });
        }

        let mut parent_config = parent_node.config();
        let duplicate = parent_config
            .children
            .iter()
            .filter_map(|child| tree.nodes.get(child))
            .any(|child| child.name == name);
        if duplicate {
            return Err(TreeError::DuplicateChild {
                parent: parent_node.path.clone(),
                name: name.to_string(),
            });
        }

        let id = Uuid::new_v4();
        let path = child_path(&parent_node.path, name);
        parent_config.children.push(id);
        drop(parent_config);
        tree.nodes.insert(
            id,
            Arc::new(ItemNode::new(
                id,
                name.to_string(),
                Some(parent),
                path,
                decl,
            )),
        );
        Ok(id)
    }

    /// Attaches a calculation rule; arguments resolve against the item's parent.
    ///
    /// # Errors
    /// - `WrongKind` for containers.
    /// - `ConflictingAuthority` when a read-only binding or a declared count
    ///   already determines the value.
    /// - `UnknownPath` for unresolvable arguments.
    pub fn set_rule(&self, item: ItemId, rule: Arc<dyn CalculationRule>) -> TreeResult<()> {
        let node = self.node(item)?;
        match node.decl {
            ItemDecl::Container => {
                return Err(TreeError::WrongKind {
                    path: node.path.clone(),
                    expected: "domain unit or attribute",
                    actual: ItemKind::Container,
                })
            }
            ItemDecl::DomainUnit { count: Some(_), .. } => {
                return Err(TreeError::ConflictingAuthority(node.path.clone()))
            }
            _ => {}
        }
        if node.binding().is_some_and(|binding| binding.read_only) {
            return Err(TreeError::ConflictingAuthority(node.path.clone()));
        }

        let base = node.parent.unwrap_or(item);
        let args = rule
            .arguments()
            .iter()
            .map(|path| self.resolve_path(base, path))
            .collect::<TreeResult<Vec<_>>>()?;

        let previous = {
            let mut config = node.config();
            let previous = std::mem::replace(&mut config.args, args.clone());
            config.rule = Some(rule);
            previous
        };
        for old in previous.iter().filter(|old| Some(**old) != node.domain()) {
            if let Some(old_node) = self.lookup(*old) {
                old_node.config().dependents.retain(|dependent| *dependent != item);
            }
        }
        for arg in &args {
            let arg_node = self.node(*arg)?;
            let mut config = arg_node.config();
            if !config.dependents.contains(&item) {
                config.dependents.push(item);
            }
        }
        self.invalidate(item)?;
        Ok(())
    }

    /// Binds the item to external storage.
    ///
    /// # Errors
    /// - `ConflictingAuthority` for a read-only binding on a computed item.
    /// - `Location` for unresolvable placeholders.
    /// - `Storage` when probes reject the location or kinds conflict.
    pub fn bind_storage(&self, item: ItemId, storage: &StorageConfig) -> TreeResult<()> {
        let node = self.node(item)?;
        match node.decl {
            ItemDecl::Container => {
                return Err(TreeError::WrongKind {
                    path: node.path.clone(),
                    expected: "domain unit or attribute",
                    actual: ItemKind::Container,
                })
            }
            ItemDecl::DomainUnit { count: Some(_), .. } if storage.read_only => {
                return Err(TreeError::ConflictingAuthority(node.path.clone()))
            }
            _ => {}
        }
        if storage.read_only && node.config().rule.is_some() {
            return Err(TreeError::ConflictingAuthority(node.path.clone()));
        }

        let location = self.inner.placeholders.resolve(&storage.location)?;
        let shared = self
            .inner
            .storage
            .bind(storage.kind, &location, storage.read_only)?;
        let role = storage
            .role
            .clone()
            .filter(|role| !role.trim().is_empty())
            .unwrap_or_else(|| node.name.clone());
        node.config().binding = Some(StorageBinding {
            storage: shared,
            role,
            read_only: storage.read_only,
            raw_location: storage.location.clone(),
        });
        self.invalidate(item)?;
        Ok(())
    }

    /// Pins computed data against eviction.
    pub fn set_keep_data(&self, item: ItemId, keep: bool) -> TreeResult<()> {
        self.node(item)?.config().keep_data = keep;
        Ok(())
    }

    /// Builds the items of `config` under the root.
    ///
    /// Items are created first, then storage bindings are attached, then
    /// rules are resolved, so references may point forwards.
    pub fn load_config(&self, config: &TreeConfig, resolver: &dyn RuleResolver) -> TreeResult<()> {
        let _frame = context::enter(ContextRole::LoadConfig, None, self.inner.config.config_name.clone());
        info!(
            "event=config_load module=tree status=start items={}",
            config.items.len()
        );
        let result = self.load_items(config, resolver);
        match &result {
            Ok(()) => info!("event=config_load module=tree status=ok"),
            Err(err) => error!("event=config_load module=tree status=error error={err}"),
        }
        result
    }

    /// Reads a JSON `TreeConfig` from disk and loads it.
    pub fn load_config_file(
        &self,
        path: impl AsRef<Path>,
        resolver: &dyn RuleResolver,
    ) -> TreeResult<()> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: TreeConfig = serde_json::from_str(&text)?;
        self.load_config(&config, resolver)
    }

    fn load_items(&self, config: &TreeConfig, resolver: &dyn RuleResolver) -> TreeResult<()> {
        let root = self.root();
        let mut created = Vec::new();
        for item in &config.items {
            self.create_structure(root, item, &mut created)?;
        }
        for item in &config.items {
            self.create_attributes(root, item, &mut created)?;
        }
        for (id, item) in &created {
            if let Some(storage) = &item.storage {
                self.bind_storage(*id, storage)?;
            }
            if item.keep_data {
                self.set_keep_data(*id, true)?;
            }
        }
        for (id, item) in &created {
            if let Some(expr) = &item.expr {
                let path = self.path(*id)?;
                let rule = resolver
                    .resolve(&path, expr)
                    .map_err(|source| TreeError::Rule { path, source })?;
                self.set_rule(*id, rule)?;
            }
        }
        Ok(())
    }

    fn create_structure<'a>(
        &self,
        parent: ItemId,
        item: &'a ItemConfig,
        created: &mut Vec<(ItemId, &'a ItemConfig)>,
    ) -> TreeResult<()> {
        let id = match item.kind {
            ItemKindConfig::Container => self.add_container(parent, &item.name)?,
            ItemKindConfig::DomainUnit {
                count,
                element_type,
            } => self.add_domain_unit(parent, &item.name, count, element_type)?,
            ItemKindConfig::Attribute { .. } => {
                if !item.items.is_empty() {
                    return Err(TreeError::MalformedConfig(format!(
                        "attribute `{}` cannot have sub-items",
                        item.name
                    )));
                }
                return Ok(());
            }
        };
        created.push((id, item));
        for child in &item.items {
            self.create_structure(id, child, created)?;
        }
        Ok(())
    }

    fn create_attributes<'a>(
        &self,
        parent: ItemId,
        item: &'a ItemConfig,
        created: &mut Vec<(ItemId, &'a ItemConfig)>,
    ) -> TreeResult<()> {
        match &item.kind {
            ItemKindConfig::Attribute {
                domain,
                value_type,
                tile_size,
            } => {
                let domain = self.resolve_path(parent, domain)?;
                let id = self.add_attribute(parent, &item.name, domain, *value_type, *tile_size)?;
                created.push((id, item));
            }
            _ => {
                let base = self.child_by_name(parent, &item.name).ok_or_else(|| {
                    TreeError::MalformedConfig(format!("item `{}` was not created", item.name))
                })?;
                for child in &item.items {
                    self.create_attributes(base, child, created)?;
                }
            }
        }
        Ok(())
    }

    /// Resolves an absolute path, `None` when nothing lives there.
    pub fn find(&self, path: &str) -> Option<ItemId> {
        self.resolve_path(self.root(), path).ok()
    }

    /// Resolves `path` against `base`; absolute paths start at the root.
    pub fn resolve_path(&self, base: ItemId, path: &str) -> TreeResult<ItemId> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(TreeError::UnknownPath(path.to_string()));
        }
        let (mut current, rest) = match trimmed.strip_prefix('/') {
            Some(rest) => (self.root(), rest),
            None => (base, trimmed),
        };
        for segment in rest.split('/').filter(|segment| !segment.is_empty()) {
            current = match segment {
                "." => current,
                ".." => self
                    .node(current)?
                    .parent
                    .ok_or_else(|| TreeError::UnknownPath(trimmed.to_string()))?,
                name => self
                    .child_by_name(current, name)
                    .ok_or_else(|| TreeError::UnknownPath(trimmed.to_string()))?,
            };
        }
        Ok(current)
    }

    fn child_by_name(&self, parent: ItemId, name: &str) -> Option<ItemId> {
        let tree = self.read_tree();
        let parent_node = tree.nodes.get(&parent)?;
        let children = parent_node.config().children.clone();
        children
            .into_iter()
            .find(|child| tree.nodes.get(child).is_some_and(|node| node.name == name))
    }

    pub fn path(&self, item: ItemId) -> TreeResult<String> {
        Ok(self.node(item)?.path.clone())
    }

    pub fn name(&self, item: ItemId) -> TreeResult<String> {
        Ok(self.node(item)?.name.clone())
    }

    pub fn kind(&self, item: ItemId) -> TreeResult<ItemKind> {
        Ok(self.node(item)?.kind())
    }

    pub fn parent(&self, item: ItemId) -> TreeResult<Option<ItemId>> {
        Ok(self.node(item)?.parent)
    }

    /// Children in insertion order.
    pub fn children(&self, item: ItemId) -> TreeResult<Vec<ItemId>> {
        Ok(self.node(item)?.config().children.clone())
    }

    /// Resolved storage location of the item's binding, if any.
    pub fn storage_location(&self, item: ItemId) -> TreeResult<Option<std::path::PathBuf>> {
        Ok(self
            .node(item)?
            .binding()
            .map(|binding| binding.storage.location().to_path_buf()))
    }

    pub fn progress_state(&self, item: ItemId) -> TreeResult<ProgressState> {
        Ok(self.node(item)?.state().progress)
    }

    pub fn status(&self, item: ItemId) -> TreeResult<ProgressStatus> {
        Ok(self.node(item)?.state().status())
    }

    /// Failure attached to the item, if it is `Failed`.
    pub fn failure(&self, item: ItemId) -> TreeResult<Option<Arc<ItemFailure>>> {
        Ok(self.node(item)?.state().failure.clone())
    }

    /// Failures from `item` to the root cause, following `cause` links.
    pub fn failure_chain(&self, item: ItemId) -> TreeResult<Vec<Arc<ItemFailure>>> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut next = self.failure(item)?;
        while let Some(failure) = next {
            if !visited.insert(failure.item) {
                break;
            }
            next = failure
                .cause
                .and_then(|cause| self.lookup(cause))
                .and_then(|node| node.state().failure.clone());
            chain.push(failure);
        }
        Ok(chain)
    }

    /// The failure that started the chain ending at `item`.
    pub fn root_cause(&self, item: ItemId) -> TreeResult<Option<Arc<ItemFailure>>> {
        Ok(self.failure_chain(item)?.pop())
    }

    /// Item paths from `item` to its root cause, inclusive.
    pub fn origin_chain(&self, item: ItemId) -> TreeResult<Vec<String>> {
        Ok(self
            .failure_chain(item)?
            .iter()
            .map(|failure| failure.item_path.clone())
            .collect())
    }

    /// Presentation triple for GUI/CLI layers.
    pub fn failure_report(&self, item: ItemId) -> TreeResult<Option<FailureReport>> {
        let Some(failure) = self.failure(item)? else {
            return Ok(None);
        };
        Ok(Some(FailureReport {
            item_path: failure.item_path.clone(),
            kind: failure.kind,
            reason: failure.reason.clone(),
            origin_chain: self.origin_chain(item)?,
            diagnostic: failure.diagnostic.clone(),
        }))
    }

    /// Keeps computed results of `items` alive until the guard drops.
    pub fn retain(&self, items: &[ItemId]) -> InterestGuard {
        self.inner.interest.retain(items)
    }

    pub fn subscribe(&self, item: ItemId, observer: ProgressObserver) -> TreeResult<ObserverId> {
        self.node(item)?;
        Ok(self.inner.observers.subscribe(item, observer))
    }

    pub fn unsubscribe(&self, item: ItemId, id: ObserverId) -> bool {
        self.inner.observers.unsubscribe(item, id)
    }

    /// Fires the invalidation edge on `item` and every transitive dependent.
    ///
    /// Returns how many items actually moved.
    ///
    /// # Errors
    /// - `UnknownItem` for an id not in the tree.
    /// - `Lock` when the calling thread holds a registry lock at or above the
    ///   buffer level.
    pub fn invalidate(&self, item: ItemId) -> TreeResult<usize> {
        let node = self.node(item)?;
        let mut count = usize::from(self.invalidate_node(&node, "explicit invalidation")?);
        count += self.invalidate_dependents(&node)?;
        Ok(count)
    }

    pub(crate) fn invalidate_dependents(&self, node: &ItemNode) -> LockResult<usize> {
        let mut count = 0;
        let mut visited = HashSet::from([node.id]);
        let mut queue = VecDeque::from(node.config().dependents.clone());
        while let Some(next) = queue.pop_front() {
            if !visited.insert(next) {
                continue;
            }
            let Some(dependent) = self.lookup(next) else {
                continue;
            };
            if self.invalidate_node(&dependent, "upstream item changed")? {
                count += 1;
            }
            queue.extend(dependent.config().dependents.iter().copied());
        }
        Ok(count)
    }

    pub(crate) fn node(&self, item: ItemId) -> TreeResult<Arc<ItemNode>> {
        self.lookup(item).ok_or(TreeError::UnknownItem(item))
    }

    pub(crate) fn lookup(&self, item: ItemId) -> Option<Arc<ItemNode>> {
        self.read_tree().nodes.get(&item).cloned()
    }

    pub(crate) fn all_nodes(&self) -> Vec<Arc<ItemNode>> {
        self.read_tree().nodes.values().cloned().collect()
    }

    fn read_tree(&self) -> RwLockReadGuard<'_, TreeIndex> {
        self.inner
            .tree
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tree(&self) -> RwLockWriteGuard<'_, TreeIndex> {
        self.inner
            .tree
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate_name(name: &str) -> TreeResult<()> {
    let valid = !name.is_empty()
        && name.trim() == name
        && name != "."
        && name != ".."
        && !name.contains(['/', '%']);
    if !valid {
        return Err(TreeError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::{child_path, validate_name, Engine};
    use crate::engine::rule::{FnRule, NoRules};
    use crate::model::item::{ItemKind, ValueType, Values};
    use crate::storage::StorageKind;
    use crate::tree::config::{EngineConfig, StorageConfig, TreeConfig};
    use crate::tree::TreeError;
    use std::sync::Arc;

    fn engine() -> Engine {
        Engine::new(EngineConfig::new("/tmp", "test"))
    }

    #[test]
    fn names_and_paths() {
        assert!(validate_name("area").is_ok());
        for bad in ["", " a", "a/b", "%x%", "..", "."] {
            assert!(validate_name(bad).is_err(), "{bad:?} must be rejected");
        }
        assert_eq!(child_path("/", "a"), "/a");
        assert_eq!(child_path("/a", "b"), "/a/b");
    }

    #[test]
    fn builds_and_resolves_paths() {
        let engine = engine();
        let root = engine.root();
        let group = engine.add_container(root, "group").expect("container");
        let unit = engine
            .add_domain_unit(group, "U", Some(3), ValueType::UInt32)
            .expect("unit");
        let attr = engine
            .add_attribute(unit, "A", unit, ValueType::Int32, None)
            .expect("attribute");

        assert_eq!(engine.path(attr).expect("path"), "/group/U/A");
        assert_eq!(engine.find("/group/U/A"), Some(attr));
        assert_eq!(engine.resolve_path(attr, "..").expect("parent"), unit);
        assert_eq!(engine.resolve_path(unit, "../U/A").expect("relative"), attr);
        assert_eq!(engine.children(group).expect("children"), vec![unit]);
        assert_eq!(engine.kind(attr).expect("kind"), ItemKind::Attribute);
    }

    #[test]
    fn rejects_duplicates_and_bad_parents() {
        let engine = engine();
        let root = engine.root();
        let unit = engine
            .add_domain_unit(root, "U", Some(1), ValueType::UInt32)
            .expect("unit");
        let err = engine
            .add_container(root, "U")
            .expect_err("duplicate must fail");
        assert!(matches!(err, TreeError::DuplicateChild { .. }));

        let attr = engine
            .add_attribute(root, "A", unit, ValueType::Bool, None)
            .expect("attribute");
        let err = engine
            .add_container(attr, "child")
            .expect_err("attribute parent must fail");
        assert!(matches!(err, TreeError::WrongKind { .. }));

        let err = engine
            .add_attribute(root, "B", attr, ValueType::Bool, None)
            .expect_err("attribute domain must fail");
        assert!(matches!(err, TreeError::WrongKind { .. }));
    }

    #[test]
    fn rule_and_read_only_storage_conflict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("a.json");
        std::fs::write(&file, "{}").expect("seed");

        let engine = engine();
        let root = engine.root();
        let unit = engine
            .add_domain_unit(root, "U", Some(1), ValueType::UInt32)
            .expect("unit");
        let attr = engine
            .add_attribute(root, "A", unit, ValueType::Int32, None)
            .expect("attribute");
        engine
            .set_rule(
                attr,
                Arc::new(FnRule::new(vec![], ValueType::Int32, |_| {
                    Ok(Values::Int32(vec![1]))
                })),
            )
            .expect("rule");

        let storage = StorageConfig {
            kind: StorageKind::GenericFile,
            location: file.to_string_lossy().into_owned(),
            role: None,
            read_only: true,
        };
        let err = engine
            .bind_storage(attr, &storage)
            .expect_err("conflicting authority");
        assert!(matches!(err, TreeError::ConflictingAuthority(_)));
    }

    #[test]
    fn unknown_rule_argument_is_rejected() {
        let engine = engine();
        let root = engine.root();
        let unit = engine
            .add_domain_unit(root, "U", Some(1), ValueType::UInt32)
            .expect("unit");
        let attr = engine
            .add_attribute(root, "A", unit, ValueType::Int32, None)
            .expect("attribute");
        let err = engine
            .set_rule(
                attr,
                Arc::new(FnRule::new(vec!["missing".into()], ValueType::Int32, |_| {
                    Ok(Values::Int32(vec![]))
                })),
            )
            .expect_err("unknown argument");
        assert!(matches!(err, TreeError::UnknownPath(_)));
    }

    #[test]
    fn config_without_resolver_rejects_expressions() {
        let engine = engine();
        let config = TreeConfig::from_json(
            r#"{ "items": [
                { "name": "U", "kind": "domain_unit", "count": 2 },
                { "name": "A", "kind": "attribute", "domain": "U", "value_type": "int32",
                  "expr": "U * 2" }
            ] }"#,
        )
        .expect("parse");
        let err = engine
            .load_config(&config, &NoRules)
            .expect_err("expression needs a resolver");
        assert!(matches!(err, TreeError::Rule { .. }));
    }
}
