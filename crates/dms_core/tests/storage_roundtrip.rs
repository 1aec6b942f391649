use dms_core::storage::migrations::latest_version;
use dms_core::{
    DomainRange, Engine, EngineConfig, EngineError, FailureKind, FnRule, ItemId, ProgressState,
    StorageConfig, StorageError, StorageFactory, StorageKind, StorageManager, StorageResult,
    TileRange, TreeError, ValueType, Values,
};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn binding(kind: StorageKind, file: &str, role: Option<&str>, read_only: bool) -> StorageConfig {
    StorageConfig {
        kind,
        location: format!("%projDir%/{file}"),
        role: role.map(str::to_string),
        read_only,
    }
}

fn unit(engine: &Engine, count: u32) -> ItemId {
    engine
        .add_domain_unit(engine.root(), "U", Some(count), ValueType::UInt32)
        .unwrap()
}

fn invalidations(engine: &Engine, item: ItemId) -> Arc<Mutex<usize>> {
    let count = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&count);
    engine
        .subscribe(
            item,
            Arc::new(move |_, old, new| {
                if old != ProgressState::Created && new == ProgressState::MetaReady {
                    *sink.lock().unwrap() += 1;
                }
            }),
        )
        .unwrap();
    count
}

fn read_back(dir: &Path, kind: StorageKind, file: &str, value_type: ValueType) -> Values {
    let engine = Engine::new(EngineConfig::new(dir, "verify"));
    let u = unit(&engine, 3);
    let a = engine
        .add_attribute(engine.root(), "A", u, value_type, None)
        .unwrap();
    engine
        .bind_storage(a, &binding(kind, file, None, true))
        .unwrap();
    engine.values(a).unwrap().as_ref().clone()
}

#[test]
fn file_write_round_trips_without_invalidating_self_or_sibling() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("layer.json"),
        r#"{ "attributes": { "B": { "type": "text", "data": ["x", "y", "z"] } } }"#,
    )
    .unwrap();

    let engine = Engine::new(EngineConfig::new(dir.path(), "roundtrip"));
    let u = unit(&engine, 3);
    let a = engine
        .add_attribute(engine.root(), "A", u, ValueType::Int32, None)
        .unwrap();
    let b = engine
        .add_attribute(engine.root(), "B", u, ValueType::Text, None)
        .unwrap();
    engine
        .bind_storage(a, &binding(StorageKind::GenericFile, "layer.json", None, false))
        .unwrap();
    engine
        .bind_storage(b, &binding(StorageKind::GenericFile, "layer.json", None, true))
        .unwrap();
    let a_invalidations = invalidations(&engine, a);
    let b_invalidations = invalidations(&engine, b);

    let sibling = engine.values(b).unwrap();
    engine
        .write_attribute(a, Values::Int32(vec![1, 2, 3]))
        .unwrap();
    assert_eq!(engine.progress_state(a).unwrap(), ProgressState::Committed);

    assert_eq!(*engine.values(a).unwrap(), Values::Int32(vec![1, 2, 3]));
    assert!(Arc::ptr_eq(&sibling, &engine.values(b).unwrap()));
    assert_eq!(*a_invalidations.lock().unwrap(), 0);
    assert_eq!(*b_invalidations.lock().unwrap(), 0);

    assert_eq!(
        read_back(dir.path(), StorageKind::GenericFile, "layer.json", ValueType::Int32),
        Values::Int32(vec![1, 2, 3])
    );
    let text = std::fs::read_to_string(dir.path().join("layer.json")).unwrap();
    assert!(text.contains("\"B\""), "write keeps other roles");
}

#[test]
fn table_write_round_trips_through_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(EngineConfig::new(dir.path(), "roundtrip"));
    let u = unit(&engine, 3);
    let a = engine
        .add_attribute(engine.root(), "A", u, ValueType::Float64, None)
        .unwrap();
    engine
        .bind_storage(a, &binding(StorageKind::Tabular, "store.sqlite", None, false))
        .unwrap();
    let a_invalidations = invalidations(&engine, a);

    engine
        .write_attribute(a, Values::Float64(vec![0.5, 1.5, 2.5]))
        .unwrap();
    assert_eq!(
        *engine.values(a).unwrap(),
        Values::Float64(vec![0.5, 1.5, 2.5])
    );
    assert_eq!(*a_invalidations.lock().unwrap(), 0);

    let conn = Connection::open(dir.path().join("store.sqlite")).unwrap();
    let version: u32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(version, latest_version());
    drop(conn);

    assert_eq!(
        read_back(dir.path(), StorageKind::Tabular, "store.sqlite", ValueType::Float64),
        Values::Float64(vec![0.5, 1.5, 2.5])
    );
}

#[test]
fn computed_domain_count_is_written_through() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(EngineConfig::new(dir.path(), "roundtrip"));
    let u = unit(&engine, 4);
    engine
        .bind_storage(u, &binding(StorageKind::GenericFile, "domains.json", None, false))
        .unwrap();
    engine.ensure_data_ready(u).unwrap();

    let text = std::fs::read_to_string(dir.path().join("domains.json")).unwrap();
    let document: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(document["domains"]["U"]["count"], 4);
}

#[test]
fn writes_are_rejected_for_mismatched_or_read_only_targets() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("fixed.json"),
        r#"{ "attributes": { "A": { "type": "int32", "data": [7, 8, 9] } } }"#,
    )
    .unwrap();
    let engine = Engine::new(EngineConfig::new(dir.path(), "roundtrip"));
    let u = unit(&engine, 3);
    let a = engine
        .add_attribute(engine.root(), "A", u, ValueType::Int32, None)
        .unwrap();
    let free = engine
        .add_attribute(engine.root(), "free", u, ValueType::Int32, None)
        .unwrap();
    engine
        .bind_storage(a, &binding(StorageKind::GenericFile, "fixed.json", None, true))
        .unwrap();

    let err = engine
        .write_attribute(a, Values::Int32(vec![1, 2, 3]))
        .expect_err("read-only binding");
    assert!(matches!(err, EngineError::Tree(ref tree) if matches!(**tree, TreeError::ReadOnlyBinding(_))));

    let err = engine
        .write_attribute(free, Values::Int32(vec![1, 2]))
        .expect_err("short write");
    assert!(matches!(err, EngineError::Tree(ref tree) if matches!(**tree, TreeError::ValueShape { .. })));

    let err = engine
        .write_attribute(free, Values::Text(vec!["a".into(); 3]))
        .expect_err("wrong type");
    assert!(matches!(err, EngineError::Tree(ref tree) if matches!(**tree, TreeError::ValueShape { .. })));
    assert_eq!(engine.progress_state(free).unwrap(), ProgressState::MetaReady);

    assert_eq!(*engine.values(a).unwrap(), Values::Int32(vec![7, 8, 9]));
}

#[test]
fn binding_probes_reject_missing_and_conflicting_locations() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(EngineConfig::new(dir.path(), "roundtrip"));
    let u = unit(&engine, 3);
    let a = engine
        .add_attribute(engine.root(), "A", u, ValueType::Int32, None)
        .unwrap();
    let b = engine
        .add_attribute(engine.root(), "B", u, ValueType::Int32, None)
        .unwrap();

    let err = engine
        .bind_storage(a, &binding(StorageKind::GenericFile, "absent.json", None, true))
        .expect_err("read-only binding needs an existing file");
    assert!(matches!(err, TreeError::Storage(_)));

    engine
        .bind_storage(a, &binding(StorageKind::GenericFile, "shared.dat", None, false))
        .unwrap();
    let err = engine
        .bind_storage(b, &binding(StorageKind::Tabular, "shared.dat", None, false))
        .expect_err("one location, one kind");
    assert!(matches!(err, TreeError::Storage(_)));

    let err = engine
        .bind_storage(a, &binding(StorageKind::GenericFile, "%unknown%/x.json", None, false))
        .expect_err("unknown placeholder");
    assert!(matches!(err, TreeError::Location(_)));
}

#[derive(Default)]
struct DriftLog {
    writing: AtomicBool,
    stamps_while_writing: AtomicUsize,
    closes: Mutex<Vec<bool>>,
}

/// Raster backend whose file is touched by someone else right after a
/// write session opens.
struct DriftingFactory {
    log: Arc<DriftLog>,
}

struct DriftingBackend {
    location: PathBuf,
    log: Arc<DriftLog>,
}

impl StorageFactory for DriftingFactory {
    fn kind(&self) -> StorageKind {
        StorageKind::Raster
    }

    fn create(&self, location: &Path) -> StorageResult<Box<dyn StorageManager>> {
        Ok(Box::new(DriftingBackend {
            location: location.to_path_buf(),
            log: Arc::clone(&self.log),
        }))
    }

    fn does_exist(&self, _location: &Path) -> bool {
        true
    }

    fn is_writable(&self, _location: &Path) -> bool {
        true
    }
}

impl StorageManager for DriftingBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Raster
    }

    fn location(&self) -> &Path {
        &self.location
    }

    fn open_for_read(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn open_for_write(&mut self) -> StorageResult<()> {
        self.log.writing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close_storage(&mut self, commit: bool) -> StorageResult<()> {
        self.log.writing.store(false, Ordering::SeqCst);
        self.log.closes.lock().unwrap().push(commit);
        Ok(())
    }

    fn read_attribute(
        &mut self,
        role: &str,
        _tile: TileRange,
        _value_type: ValueType,
    ) -> StorageResult<Values> {
        Err(StorageError::MissingRole {
            location: self.location.clone(),
            role: role.to_string(),
        })
    }

    fn write_attribute(&mut self, _role: &str, _values: &Values) -> StorageResult<()> {
        Ok(())
    }

    fn read_domain_range(&mut self, role: &str) -> StorageResult<DomainRange> {
        Err(StorageError::MissingRole {
            location: self.location.clone(),
            role: role.to_string(),
        })
    }

    fn write_domain_range(&mut self, _role: &str, _range: DomainRange) -> StorageResult<()> {
        Ok(())
    }

    /// The first stamp of a write session is its baseline; every later one
    /// has moved.
    fn external_change_time(&self) -> StorageResult<Option<SystemTime>> {
        let moved = self.log.writing.load(Ordering::SeqCst)
            && self.log.stamps_while_writing.fetch_add(1, Ordering::SeqCst) > 0;
        let stamp = if moved {
            UNIX_EPOCH + Duration::from_secs(60)
        } else {
            UNIX_EPOCH
        };
        Ok(Some(stamp))
    }
}

#[test]
fn external_change_during_write_back_is_a_consistency_failure() {
    let log = Arc::new(DriftLog::default());
    let engine = Engine::new(EngineConfig::new("/virtual", "roundtrip"));
    engine
        .storage()
        .register_factory(Arc::new(DriftingFactory {
            log: Arc::clone(&log),
        }))
        .unwrap();
    let u = unit(&engine, 3);
    let a = engine
        .add_attribute(engine.root(), "A", u, ValueType::Int32, None)
        .unwrap();
    engine
        .set_rule(
            a,
            Arc::new(FnRule::new(vec![], ValueType::Int32, |_| {
                Ok(Values::Int32(vec![4, 5, 6]))
            })),
        )
        .unwrap();
    engine
        .bind_storage(a, &binding(StorageKind::Raster, "grid.tif", Some("A"), false))
        .unwrap();

    let err = engine.values(a).expect_err("write-back must not commit");
    assert_eq!(err.failure().unwrap().kind, FailureKind::Consistency);

    let failure = engine.failure(a).unwrap().unwrap();
    assert_eq!(failure.kind, FailureKind::Consistency);
    assert!(failure.is_root());
    assert_eq!(engine.origin_chain(a).unwrap(), vec!["/A"]);
    assert_eq!(engine.progress_state(a).unwrap(), ProgressState::Failed);
    assert_eq!(*log.closes.lock().unwrap(), vec![false]);
}
