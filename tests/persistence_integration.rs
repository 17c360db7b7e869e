//! Persistence integration: snapshot round-trips, the latest pointer,
//! and journal/aggregate agreement.

use capstan::core::machine::GuardContext;
use capstan::core::paths::StorePaths;
use capstan::core::run::{NewRunParams, ReleaseRun};
use capstan::core::types::{Actor, CommitSha, RiskThresholds, RunState};
use capstan::core::version::{BumpKind, Version};
use capstan::store::{RunStore, StoreError};

fn sha(c: char) -> CommitSha {
    CommitSha::new(c.to_string().repeat(40)).unwrap()
}

fn alice() -> Actor {
    Actor::human("alice")
}

fn new_run(root: &std::path::Path) -> ReleaseRun {
    ReleaseRun::new(NewRunParams {
        repo_id: "org/app".into(),
        repo_root: root.to_path_buf(),
        base_ref: "v1.0.0".into(),
        head_sha: sha('a'),
        commits: vec![sha('a'), sha('b')],
        config_hash: "cfg".into(),
        plugin_plan_hash: "plg".into(),
        actor: alice(),
        thresholds: RiskThresholds::default(),
    })
}

/// Drive a run through the full lifecycle in memory, saving at each
/// stage, and verify the final load equals the final in-memory state.
#[test]
fn full_lifecycle_round_trips() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = RunStore::new();
    let ctx = GuardContext::default();

    let mut run = new_run(temp.path());
    store.save(&mut run).unwrap();

    run.plan(&alice(), &ctx).unwrap();
    run.set_version_proposal(
        Version::parse("1.0.0").unwrap(),
        Version::parse("1.1.0").unwrap(),
        BumpKind::Minor,
        0.9,
    )
    .unwrap();
    run.bump(&alice(), &ctx).unwrap();
    store.save(&mut run).unwrap();

    let loaded = store.load_from_repo(temp.path(), &run.id).unwrap();
    assert_eq!(loaded, run);
    assert_eq!(loaded.plan_hash, run.plan_hash);
    assert_eq!(loaded.version_next, run.version_next);
    assert_eq!(loaded.state, RunState::Versioned);
}

/// The journal contains exactly the events the aggregate emitted, in
/// emission order, with monotone sequence numbers across saves.
#[test]
fn journal_matches_emissions_across_saves() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = RunStore::new();
    let paths = StorePaths::new(temp.path());
    let ctx = GuardContext::default();

    let mut run = new_run(temp.path());
    let mut expected: Vec<String> = run
        .domain_events
        .iter()
        .map(|e| e.name().to_string())
        .collect();
    store.save(&mut run).unwrap();

    run.plan(&alice(), &ctx).unwrap();
    expected.extend(run.domain_events.iter().map(|e| e.name().to_string()));
    store.save(&mut run).unwrap();

    run.cancel("done with it".into(), &alice()).unwrap();
    expected.extend(run.domain_events.iter().map(|e| e.name().to_string()));
    store.save(&mut run).unwrap();

    let events = store.journal().load_events(&paths, &run.id).unwrap();
    let names: Vec<String> = events.iter().map(|e| e.event_name.clone()).collect();
    assert_eq!(names, expected);

    let seqs: Vec<u64> = events.iter().map(|e| e.sequence_num).collect();
    assert_eq!(seqs, (1..=events.len() as u64).collect::<Vec<_>>());
}

/// Saving twice without new events appends nothing.
#[test]
fn save_without_events_appends_nothing() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = RunStore::new();
    let paths = StorePaths::new(temp.path());

    let mut run = new_run(temp.path());
    store.save(&mut run).unwrap();
    let before = store.journal().load_events(&paths, &run.id).unwrap().len();

    store.save(&mut run).unwrap();
    let after = store.journal().load_events(&paths, &run.id).unwrap().len();
    assert_eq!(before, after);
}

/// The latest pointer survives run turnover and dangles gracefully.
#[test]
fn latest_pointer_behavior() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = RunStore::new();

    let mut first = new_run(temp.path());
    store.save(&mut first).unwrap();
    store.set_latest(temp.path(), &first.id).unwrap();

    let mut second = new_run(temp.path());
    store.save(&mut second).unwrap();
    store.set_latest(temp.path(), &second.id).unwrap();

    assert_eq!(store.load_latest(temp.path()).unwrap().id, second.id);

    // Deleting the pointed-at run dangles the pointer.
    store.delete_from_repo(temp.path(), &second.id).unwrap();
    assert!(matches!(
        store.load_latest(temp.path()).unwrap_err(),
        StoreError::RunNotFound
    ));

    // The journal outlives the deletion.
    let paths = StorePaths::new(temp.path());
    assert!(!store
        .journal()
        .load_events(&paths, &second.id)
        .unwrap()
        .is_empty());
}

/// list() orders newest-first by modification time.
#[test]
fn list_orders_by_mtime() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = RunStore::new();

    let mut first = new_run(temp.path());
    store.save(&mut first).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));
    let mut second = new_run(temp.path());
    store.save(&mut second).unwrap();

    let ids = store.list(temp.path()).unwrap();
    assert_eq!(ids, vec![second.id.clone(), first.id.clone()]);

    // Touching the first run promotes it.
    std::thread::sleep(std::time::Duration::from_millis(20));
    store.save(&mut first).unwrap();
    let ids = store.list(temp.path()).unwrap();
    assert_eq!(ids, vec![first.id, second.id]);
}

/// Reading a snapshot written by a newer version (extra fields) works.
#[test]
fn forward_compatible_snapshot_read() {
    let temp = tempfile::TempDir::new().unwrap();
    let store = RunStore::new();
    let paths = StorePaths::new(temp.path());

    let mut run = new_run(temp.path());
    store.save(&mut run).unwrap();

    let path = paths.run_snapshot_path(&run.id);
    let mut value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    value["field_from_the_future"] = serde_json::json!({"nested": [1, 2, 3]});
    std::fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();

    let loaded = store.load_from_repo(temp.path(), &run.id).unwrap();
    assert_eq!(loaded, run);
}
