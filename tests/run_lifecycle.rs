//! End-to-end lifecycle tests over the release-run aggregate and the
//! orchestrators, using mock collaborators.

use std::sync::Arc;

use capstan::collab::mock::{MockInspector, MockNotesGenerator, MockPublisher, MockVersionWriter};
use capstan::core::config::RepoConfig;
use capstan::core::errors::RunError;
use capstan::core::types::{Actor, CommitSha, RunState};
use capstan::core::version::{BumpKind, Version};
use capstan::engine::plan::{plan, PlanInput, VersionProposal};
use capstan::engine::{approve, bump, notes, publish, Deps, EngineError};
use capstan::plugin::{AuditLog, PluginHost};
use capstan::store::{ReleaseLockManager, RunStore};

fn sha(c: char) -> CommitSha {
    CommitSha::new(c.to_string().repeat(40)).unwrap()
}

fn alice() -> Actor {
    Actor::human("alice")
}

struct Fixture {
    deps: Deps,
    inspector: MockInspector,
    publisher: MockPublisher,
    _temp: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let temp = tempfile::TempDir::new().unwrap();
    let inspector = MockInspector::new(sha('a'));
    inspector.set_commits(vec![sha('a'), sha('b')]);
    inspector.set_latest_tag("v1.0.0", Version::parse("1.0.0").unwrap());
    let publisher = MockPublisher::new();

    let deps = Deps {
        repo_root: temp.path().to_path_buf(),
        store: Arc::new(RunStore::new()),
        locks: ReleaseLockManager::new(),
        inspector: Arc::new(inspector.clone()),
        version_writer: Arc::new(MockVersionWriter::new()),
        notes: Arc::new(MockNotesGenerator::new()),
        publisher: Arc::new(publisher.clone()),
        plugins: Arc::new(PluginHost::new(
            temp.path(),
            &Default::default(),
            Arc::new(AuditLog::disabled()),
        )),
        config: RepoConfig::default(),
    };

    Fixture {
        deps,
        inspector,
        publisher,
        _temp: temp,
    }
}

fn minor_proposal() -> VersionProposal {
    VersionProposal {
        current: Version::parse("1.0.0").unwrap(),
        next: Version::parse("1.1.0").unwrap(),
        bump_kind: BumpKind::Minor,
        confidence: 0.9,
    }
}

/// Scenario: plan -> bump -> notes -> approve -> publish ends published
/// with the expected history, step status, and journal.
#[tokio::test]
async fn happy_path_publish() {
    let f = fixture();

    let mut input = PlanInput::for_actor(alice());
    input.proposal = Some(minor_proposal());
    let planned = plan(&f.deps, input).await.unwrap();
    assert_eq!(planned.version_next.as_deref(), Some("1.1.0"));

    bump::bump(&f.deps, bump::BumpInput::for_actor(alice()))
        .await
        .unwrap();
    notes::generate_notes(&f.deps, notes::NotesInput::for_actor(alice()))
        .await
        .unwrap();
    approve::approve(&f.deps, approve::ApproveInput::for_actor(alice()))
        .await
        .unwrap();
    let published = publish::publish(&f.deps, publish::PublishInput::for_actor(alice()))
        .await
        .unwrap();

    assert_eq!(published.state, RunState::Published);

    let run = f.deps.store.load_latest(&f.deps.repo_root).unwrap();
    assert_eq!(run.state, RunState::Published);
    assert_eq!(run.tag_name.as_deref(), Some("v1.1.0"));
    assert_eq!(run.history.len(), 6);
    let transitions: Vec<(RunState, RunState)> =
        run.history.iter().map(|t| (t.from, t.to)).collect();
    assert_eq!(
        transitions,
        vec![
            (RunState::Draft, RunState::Planned),
            (RunState::Planned, RunState::Versioned),
            (RunState::Versioned, RunState::NotesReady),
            (RunState::NotesReady, RunState::Approved),
            (RunState::Approved, RunState::Publishing),
            (RunState::Publishing, RunState::Published),
        ]
    );
    assert_eq!(run.step_status["tag"].attempts, 1);
    assert!(run.published_at.is_some());

    // The journal saw the whole story, in order, with monotone sequence.
    let events = f
        .deps
        .store
        .journal()
        .load_events(&f.deps.paths(), &run.id)
        .unwrap();
    let names: Vec<&str> = events.iter().map(|e| e.event_name.as_str()).collect();
    assert!(names.contains(&"run.created"));
    assert!(names.contains(&"run.publishing_started"));
    assert!(names.contains(&"run.step_completed"));
    assert!(names.contains(&"run.published"));
    assert_eq!(
        names.iter().filter(|n| **n == "run.state_transitioned").count(),
        6
    );
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.sequence_num, i as u64 + 1);
    }
}

/// Scenario: HEAD drifts after planning; bump is rejected without
/// force and succeeds with it.
#[tokio::test]
async fn head_drift_rejects_bump() {
    let f = fixture();
    plan(&f.deps, PlanInput::for_actor(alice())).await.unwrap();

    f.inspector.set_head(sha('b'));

    let err = bump::bump(&f.deps, bump::BumpInput::for_actor(alice()))
        .await
        .unwrap_err();
    match err {
        EngineError::Run(RunError::HeadShaChanged { expected, actual }) => {
            assert_eq!(expected, sha('a'));
            assert_eq!(actual, sha('b'));
        }
        other => panic!("unexpected error: {other}"),
    }

    // The run on disk is untouched.
    let run = f.deps.store.load_latest(&f.deps.repo_root).unwrap();
    assert_eq!(run.state, RunState::Planned);

    let mut forced = bump::BumpInput::for_actor(alice());
    forced.force = true;
    let output = bump::bump(&f.deps, forced).await.unwrap();
    assert_eq!(output.state, RunState::Versioned);
}

/// Scenario: an approval is invalidated when re-planning changes the
/// plan hash; publish then fails with the hash-binding error.
#[tokio::test]
async fn approval_invalidated_by_replan() {
    let f = fixture();
    plan(&f.deps, PlanInput::for_actor(alice())).await.unwrap();
    bump::bump(&f.deps, bump::BumpInput::for_actor(alice()))
        .await
        .unwrap();
    notes::generate_notes(&f.deps, notes::NotesInput::for_actor(alice()))
        .await
        .unwrap();
    approve::approve(&f.deps, approve::ApproveInput::for_actor(alice()))
        .await
        .unwrap();

    // Re-plan in place: a changed config hash shifts the plan hash.
    let mut run = f.deps.store.load_latest(&f.deps.repo_root).unwrap();
    let old_hash = run.plan_hash.clone();
    run.state = RunState::NotesReady;
    run.config_hash = "different".into();
    run.plan(&alice(), &Default::default()).unwrap();
    assert_ne!(run.plan_hash, old_hash);

    let err = run
        .start_publishing(&alice(), &Default::default())
        .unwrap_err();
    match err {
        RunError::ApprovalBoundToHash { bound, current } => {
            assert_eq!(bound, old_hash);
            assert_eq!(current, run.plan_hash);
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// Scenario: an idempotency-check hit skips the step with zero attempts
/// and no publisher execution.
#[tokio::test]
async fn idempotent_step_skipped() {
    let f = fixture();
    plan(&f.deps, PlanInput::for_actor(alice())).await.unwrap();
    bump::bump(&f.deps, bump::BumpInput::for_actor(alice()))
        .await
        .unwrap();
    notes::generate_notes(&f.deps, notes::NotesInput::for_actor(alice()))
        .await
        .unwrap();
    approve::approve(&f.deps, approve::ApproveInput::for_actor(alice()))
        .await
        .unwrap();

    f.publisher.mark_already_done("tag");
    let output = publish::publish(&f.deps, publish::PublishInput::for_actor(alice()))
        .await
        .unwrap();

    assert_eq!(output.state, RunState::Published);
    assert_eq!(output.steps[0].state, "skipped");
    assert_eq!(output.steps[0].attempts, 0);
    assert!(output.steps[0]
        .output
        .as_deref()
        .unwrap()
        .contains("already"));
    assert!(f.publisher.executed().is_empty());
}

/// A failed transition leaves no trace: state, history, and events all
/// unchanged.
#[tokio::test]
async fn rejected_transition_mutates_nothing() {
    let f = fixture();
    plan(&f.deps, PlanInput::for_actor(alice())).await.unwrap();

    let before = f.deps.store.load_latest(&f.deps.repo_root).unwrap();
    let mut attempt = before.clone();
    assert!(attempt
        .approve(&alice(), false, &Default::default())
        .is_err());
    assert_eq!(attempt, before);
}
