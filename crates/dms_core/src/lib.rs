//! Core of the item dependency and storage engine.
//!
//! Items (containers, domain units, attributes) form a named tree. Each item
//! advances lazily through a progress state machine, computing its values
//! from a calculation rule or reading them through a shared storage manager,
//! and falls back to `MetaReady` when its inputs or storage change.

pub mod engine;
pub mod logging;
pub mod model;
pub mod storage;
pub mod tree;

pub use engine::clock::{LogicalClock, LogicalTime};
pub use engine::context::{ContextFrame, ContextRole, SessionInfo};
pub use engine::interest::{InterestGuard, InterestLedger};
pub use engine::lock_registry::{
    LockError, LockHandle, LockKey, LockLevel, LockRegistry, LockResult, ResourceKind,
};
pub use engine::observer::{ObserverId, ProgressObserver};
pub use engine::rule::{
    ArgumentMeta, CalculationRule, ComputeFn, DomainCountRule, Evaluation, FnRule, NoRules,
    RuleError, RuleResolver, RuleShape, RuleTarget,
};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::failure::{FailureKind, FailureReport, ItemFailure};
pub use model::item::{
    DomainRange, ItemData, ItemId, ItemKind, MetaDescriptor, ValueType, Values,
};
pub use model::progress::{ProgressState, ProgressStatus};
pub use storage::{
    OpenMode, SharedStorage, StorageError, StorageFactory, StorageKind, StorageManager,
    StorageRegistry, StorageResult, StorageSession, TileRange,
};
pub use tree::{
    Engine, EngineConfig, EngineError, EngineResult, ItemConfig, ItemKindConfig, StorageConfig,
    TreeConfig, TreeError, TreeResult,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
