use std::thread;
use std::time::Duration;

use serde_json::json;
use tempfile::tempdir;

use super::*;
use crate::activity::{Activity, ActivityDefinition, ActivityState, Context};
use crate::behaviours::SignalTaskBehaviour;
use crate::config::PersistenceSettings;

fn create_test_store(ttl_secs: i64, max_snapshots: usize) -> (SnapshotStore, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();
    let store = SnapshotStore::open(&path, ttl_secs, max_snapshots).unwrap();
    (store, dir)
}

fn waiting_state(id: &str) -> ActivityState {
    let activity = Activity::new(
        ActivityDefinition::new(id, "bpmn:Task"),
        &Context::default(),
        SignalTaskBehaviour::new(None),
    )
    .unwrap();
    activity.run(None).unwrap();
    activity.stop().unwrap();
    activity.get_state()
}

#[test]
fn test_save_and_load_latest() {
    let (store, _dir) = create_test_store(0, 0);
    let state = waiting_state("task");

    let saved = store.save("order-1", &state).unwrap();
    assert_eq!(saved.key, "order-1");

    let loaded = store.load_latest("order-1").unwrap().unwrap();
    assert_eq!(loaded.state.id, state.id);
    assert_eq!(loaded.state.execution_id, state.execution_id);
    assert!(loaded.state.stopped);
    assert_eq!(loaded.saved_at, saved.saved_at);
}

#[test]
fn test_unknown_key_has_no_snapshot() {
    let (store, _dir) = create_test_store(0, 0);
    assert!(store.load_latest("nothing").unwrap().is_none());
    assert!(store.load_all("nothing").unwrap().is_empty());
}

#[test]
fn test_keys_are_isolated() {
    let (store, _dir) = create_test_store(0, 0);
    store.save("a", &waiting_state("first")).unwrap();
    store.save("b", &waiting_state("second")).unwrap();

    assert_eq!(store.load_latest("a").unwrap().unwrap().state.id, "first");
    assert_eq!(store.load_latest("b").unwrap().unwrap().state.id, "second");
}

#[test]
fn test_retention_keeps_newest_snapshots() {
    let (store, _dir) = create_test_store(0, 2);

    for id in ["one", "two", "three"] {
        store.save("key", &waiting_state(id)).unwrap();
        thread::sleep(Duration::from_millis(2));
    }

    let ids: Vec<String> = store
        .load_all("key")
        .unwrap()
        .into_iter()
        .map(|snapshot| snapshot.state.id)
        .collect();
    assert_eq!(ids, vec!["two", "three"]);
}

#[test]
fn test_expired_snapshots_are_dropped() {
    let (store, _dir) = create_test_store(1, 0);
    store.save("key", &waiting_state("task")).unwrap();

    thread::sleep(Duration::from_millis(1100));

    assert!(store.load_latest("key").unwrap().is_none());
}

#[test]
fn test_remove_drops_key() {
    let (store, _dir) = create_test_store(0, 0);
    store.save("key", &waiting_state("task")).unwrap();

    assert!(store.remove("key").unwrap());
    assert!(store.load_latest("key").unwrap().is_none());
}

#[test]
fn test_stored_snapshot_recovers_activity() {
    let dir = tempdir().unwrap();
    let settings = PersistenceSettings {
        path: dir.path().to_str().unwrap().to_string(),
        ..PersistenceSettings::default()
    };
    let store = SnapshotStore::from_settings(&settings).unwrap();
    store.save("key", &waiting_state("task")).unwrap();

    let snapshot = store.load_latest("key").unwrap().unwrap();
    let activity = Activity::new(
        ActivityDefinition::new("task", "bpmn:Task"),
        &Context::default(),
        SignalTaskBehaviour::new(None),
    )
    .unwrap();
    activity.recover(&snapshot.state).unwrap();
    activity.resume().unwrap();
    activity.get_api(None).signal(json!("resumed")).unwrap();

    assert_eq!(activity.counters().taken, 1);
}
