//! Concurrency: gapless sequencing and the frame invariant under racing
//! writers, both on a shared store handle and across separate connections
//! to the same database file.

use dossier_core::{audit_types, AppendMove, AuditSpec, PublishFrame, Store};
use dossier_common::{Actor, MoveType, RunId};
use serial_test::serial;
use std::collections::BTreeSet;
use std::thread;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn spec(t: &str) -> AuditSpec {
    AuditSpec::new(t, serde_json::json!({}))
}

fn run_on(store: &Store) -> RunId {
    store
        .create_run(
            "local-plan-2026",
            None,
            &Actor::agent("planner"),
            spec(audit_types::RUN_CREATED),
        )
        .unwrap()
        .id
}

#[test]
fn shared_store_appends_stay_gapless() {
    init_tracing();
    let store = Store::memory().unwrap();
    let run = run_on(&store);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            let run = run.clone();
            thread::spawn(move || {
                let actor = Actor::agent(format!("worker-{i}"));
                let mut seqs = Vec::new();
                for _ in 0..5 {
                    let ev = store
                        .append_move(
                            &AppendMove::new(run.clone(), MoveType::Evidence),
                            &actor,
                            spec(audit_types::MOVE_APPENDED),
                        )
                        .unwrap();
                    seqs.push(ev.seq);
                }
                seqs
            })
        })
        .collect();

    let mut all: Vec<i64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();
    assert_eq!(all, (1..=40).collect::<Vec<i64>>());
}

#[test]
#[serial(file_db)]
fn separate_connections_append_without_gaps_or_duplicates() {
    init_tracing();
    let db = tempfile::NamedTempFile::new().unwrap();
    let path = db.path().to_path_buf();

    let setup = Store::open(&path).unwrap();
    let run = run_on(&setup);
    drop(setup);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let path = path.clone();
            let run = run.clone();
            thread::spawn(move || {
                let store = Store::open(&path).unwrap();
                let actor = Actor::agent(format!("conn-{i}"));
                let mut seqs = Vec::new();
                for _ in 0..6 {
                    let ev = store
                        .append_move(
                            &AppendMove::new(run.clone(), MoveType::Issues),
                            &actor,
                            spec(audit_types::MOVE_APPENDED),
                        )
                        .unwrap();
                    seqs.push(ev.seq);
                }
                seqs
            })
        })
        .collect();

    let mut all: Vec<i64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let distinct: BTreeSet<i64> = all.iter().copied().collect();
    assert_eq!(distinct.len(), all.len(), "duplicate sequence numbers");
    all.sort_unstable();
    assert_eq!(all, (1..=24).collect::<Vec<i64>>());

    let verify = Store::open(&path).unwrap();
    assert_eq!(verify.log_version(&run).unwrap(), 1 + 24);
}

#[test]
fn racing_frame_publishers_leave_exactly_one_current() {
    init_tracing();
    let store = Store::memory().unwrap();
    let run = run_on(&store);

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let store = store.clone();
            let run = run.clone();
            thread::spawn(move || {
                let actor = Actor::agent(format!("retriever-{i}"));
                for j in 0..4 {
                    store
                        .publish_frame(
                            &PublishFrame {
                                run_id: run.clone(),
                                move_type: MoveType::Evidence,
                                content: serde_json::json!({"writer": i, "round": j}),
                                from_invocation: None,
                            },
                            &actor,
                            spec(audit_types::FRAME_PUBLISHED),
                        )
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert!(store.check_frame_consistency().unwrap().is_empty());

    let history = store.frame_history(&run, MoveType::Evidence).unwrap();
    assert_eq!(history.len(), 24);
    assert_eq!(history.iter().filter(|f| f.current).count(), 1);
    // Versions are dense and every superseded frame points at a successor.
    let versions: Vec<i64> = history.iter().map(|f| f.version).collect();
    assert_eq!(versions, (1..=24).rev().collect::<Vec<i64>>());
    assert!(history
        .iter()
        .filter(|f| !f.current)
        .all(|f| f.superseded_by.is_some()));
}
