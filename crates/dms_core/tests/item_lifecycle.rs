use dms_core::{
    Engine, EngineConfig, EngineError, FailureKind, FnRule, ItemId, ProgressState, StorageConfig,
    StorageKind, ValueType, Values,
};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

type Transitions = Arc<Mutex<Vec<(ProgressState, ProgressState)>>>;

fn engine_in(dir: &Path) -> Engine {
    Engine::new(EngineConfig::new(dir, "lifecycle"))
}

fn read_only(file: &str) -> StorageConfig {
    StorageConfig {
        kind: StorageKind::GenericFile,
        location: format!("%projDir%/{file}"),
        role: None,
        read_only: true,
    }
}

fn record_transitions(engine: &Engine, item: ItemId) -> Transitions {
    let seen: Transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine
        .subscribe(
            item,
            Arc::new(move |_, old, new| sink.lock().unwrap().push((old, new))),
        )
        .unwrap();
    seen
}

fn touch_later(path: &Path) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
}

fn unit_with_attribute(engine: &Engine) -> (ItemId, ItemId) {
    let root = engine.root();
    let unit = engine
        .add_domain_unit(root, "U", Some(3), ValueType::UInt32)
        .unwrap();
    let attribute = engine
        .add_attribute(root, "A", unit, ValueType::Int32, None)
        .unwrap();
    (unit, attribute)
}

#[test]
fn read_only_file_is_read_once_and_reread_after_external_change() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("values.json");
    std::fs::write(
        &path,
        r#"{ "attributes": { "A": { "type": "int32", "data": [10, 20, 30] } } }"#,
    )
    .unwrap();

    let engine = engine_in(dir.path());
    let (_, a) = unit_with_attribute(&engine);
    engine.bind_storage(a, &read_only("values.json")).unwrap();
    let manager = engine.storage().manager(&path).unwrap();
    let transitions = record_transitions(&engine, a);

    let first = engine.values(a).unwrap();
    assert_eq!(*first, Values::Int32(vec![10, 20, 30]));
    assert_eq!(engine.progress_state(a).unwrap(), ProgressState::Committed);
    assert_eq!(manager.backend_opens(), 1);
    assert_eq!(manager.open_count(), 0);
    assert_eq!(
        *transitions.lock().unwrap(),
        vec![
            (ProgressState::Created, ProgressState::MetaReady),
            (ProgressState::MetaReady, ProgressState::DataReady),
            (ProgressState::DataReady, ProgressState::Validated),
            (ProgressState::Validated, ProgressState::Committed),
        ]
    );

    let second = engine.values(a).unwrap();
    assert_eq!(second, first);
    assert_eq!(manager.backend_opens(), 1);

    std::fs::write(
        &path,
        r#"{ "attributes": { "A": { "type": "int32", "data": [11, 21, 31] } } }"#,
    )
    .unwrap();
    touch_later(&path);

    let third = engine.values(a).unwrap();
    assert_eq!(*third, Values::Int32(vec![11, 21, 31]));
    assert_eq!(manager.backend_opens(), 2);

    let fourth = engine.values(a).unwrap();
    assert_eq!(fourth, third);
    assert_eq!(manager.backend_opens(), 2);

    let revisits = transitions
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, new)| *new == ProgressState::MetaReady)
        .count();
    assert_eq!(revisits, 2, "initial meta plus exactly one invalidation");
}

#[test]
fn ensure_data_ready_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let (_, a) = unit_with_attribute(&engine);
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    engine
        .set_rule(
            a,
            Arc::new(FnRule::new(vec!["U".into()], ValueType::Int32, move |inputs| {
                counter.fetch_add(1, Ordering::SeqCst);
                match inputs[0].as_ref() {
                    Values::UInt32(index) => Ok(Values::Int32(
                        index.iter().map(|i| *i as i32 * 10).collect(),
                    )),
                    _ => Ok(Values::Int32(Vec::new())),
                }
            })),
        )
        .unwrap();

    let meta = engine.ensure_meta_ready(a).unwrap();
    assert_eq!(meta.element_count(), Some(3));
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let first = engine.ensure_data_ready(a).unwrap();
    let second = engine.ensure_data_ready(a).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        first.values().map(|values| values.as_ref().clone()),
        Some(Values::Int32(vec![0, 10, 20]))
    );
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    assert_eq!(engine.invalidate(a).unwrap(), 1);
    let status = engine.status(a).unwrap();
    assert_eq!(status.state, ProgressState::MetaReady);
    assert!(status.invalidated);
    engine.ensure_data_ready(a).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn explicit_invalidation_cascades_to_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let (unit, a) = unit_with_attribute(&engine);
    let root = engine.root();
    let b = engine
        .add_attribute(root, "B", unit, ValueType::Int32, None)
        .unwrap();
    engine
        .set_rule(
            a,
            Arc::new(FnRule::new(vec![], ValueType::Int32, |_| {
                Ok(Values::Int32(vec![1, 2, 3]))
            })),
        )
        .unwrap();
    engine
        .set_rule(
            b,
            Arc::new(FnRule::new(vec!["A".into()], ValueType::Int32, |inputs| {
                Ok(inputs[0].as_ref().clone())
            })),
        )
        .unwrap();

    assert_eq!(
        *engine.values(b).unwrap(),
        Values::Int32(vec![1, 2, 3])
    );
    assert_eq!(engine.progress_state(a).unwrap(), ProgressState::Committed);

    let moved = engine.invalidate(unit).unwrap();
    assert_eq!(moved, 3);
    assert_eq!(engine.progress_state(a).unwrap(), ProgressState::MetaReady);
    assert_eq!(engine.progress_state(b).unwrap(), ProgressState::MetaReady);
}

#[test]
fn storage_failure_is_shared_and_traced_downstream() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("empty.json"), r#"{ "attributes": {} }"#).unwrap();

    let engine = engine_in(dir.path());
    let (unit, a) = unit_with_attribute(&engine);
    engine.bind_storage(a, &read_only("empty.json")).unwrap();
    let b = engine
        .add_attribute(engine.root(), "B", unit, ValueType::Int32, None)
        .unwrap();
    engine
        .set_rule(
            b,
            Arc::new(FnRule::new(vec!["A".into()], ValueType::Int32, |inputs| {
                Ok(inputs[0].as_ref().clone())
            })),
        )
        .unwrap();

    let first = engine.values(a).expect_err("missing role must fail");
    let second = engine.values(a).expect_err("failure is sticky");
    let (first, second) = (first.failure().unwrap(), second.failure().unwrap());
    assert!(Arc::ptr_eq(first, second));
    assert_eq!(first.kind, FailureKind::Storage);
    assert!(first.is_root());
    assert!(first.diagnostic.contains("session="));
    assert_eq!(engine.progress_state(a).unwrap(), ProgressState::Failed);

    let downstream = engine.values(b).expect_err("upstream failure propagates");
    let failure = downstream.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Storage);
    assert_eq!(failure.cause, Some(a));
    assert_eq!(engine.origin_chain(b).unwrap(), vec!["/B", "/A"]);
    assert_eq!(engine.root_cause(b).unwrap().unwrap().item, a);

    let report = engine.failure_report(b).unwrap().unwrap();
    assert_eq!(report.root_cause_path(), "/A");
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["origin_chain"][1], "/A");
}

#[test]
fn dependency_cycle_fails_instead_of_deadlocking() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let (unit, a) = unit_with_attribute(&engine);
    let b = engine
        .add_attribute(engine.root(), "B", unit, ValueType::Int32, None)
        .unwrap();
    let copy_first = |inputs: &[Arc<Values>]| Ok(inputs[0].as_ref().clone());
    engine
        .set_rule(
            a,
            Arc::new(FnRule::new(vec!["B".into()], ValueType::Int32, copy_first)),
        )
        .unwrap();
    engine
        .set_rule(
            b,
            Arc::new(FnRule::new(vec!["A".into()], ValueType::Int32, copy_first)),
        )
        .unwrap();

    let err = engine.values(a).expect_err("cycle must fail");
    assert_eq!(err.failure().unwrap().kind, FailureKind::Configuration);
    assert_eq!(engine.progress_state(a).unwrap(), ProgressState::Failed);
    assert_eq!(engine.progress_state(b).unwrap(), ProgressState::Failed);

    let root = engine.root_cause(a).unwrap().unwrap();
    assert!(root.reason.contains("cycle"));
    let chain = engine.origin_chain(a).unwrap();
    assert_eq!(chain.first().map(String::as_str), Some("/A"));
    assert!(chain.iter().any(|path| path == "/B"));
}

#[test]
fn wrong_value_count_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    let (_, a) = unit_with_attribute(&engine);
    engine
        .set_rule(
            a,
            Arc::new(FnRule::new(vec![], ValueType::Int32, |_| {
                Ok(Values::Int32(vec![1]))
            })),
        )
        .unwrap();
    let transitions = record_transitions(&engine, a);

    let err = engine.values(a).expect_err("short output must fail");
    assert!(matches!(err, EngineError::Failed(_)));
    assert_eq!(err.failure().unwrap().kind, FailureKind::Computation);
    assert_eq!(
        transitions.lock().unwrap().last(),
        Some(&(ProgressState::DataReady, ProgressState::Failed))
    );
}
