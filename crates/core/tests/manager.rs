mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use pretty_assertions::assert_eq;
use quorum::storage::{shared, MemoryLog, StateLog as _};
use quorum::{ApplyOutcome, NullResourceMonitor, ServiceManager, SnapshotStore as _, StateError};
use quorum_primitives::SessionId;

#[tokio::test]
async fn open_session_is_assigned_the_entry_index() {
    let f = fixture();
    let outcome = f.apply(open_session(1, "registry")).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Session(SessionId(1)));
}

#[tokio::test]
async fn commands_execute_against_the_service() {
    let f = fixture();
    f.apply(open_session(1, "registry")).await.unwrap();
    let outcome = f.apply(command(2, 1, 1, "put k v")).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Output(Bytes::from_static(b"ok k")));
    let value = f.manager.query(SessionId(1), 1, 2, "get k").await.unwrap();
    assert_eq!(value, Bytes::from_static(b"v"));
}

#[tokio::test]
async fn duplicate_commands_return_the_cached_result() {
    let f = fixture();
    f.apply(open_session(1, "registry")).await.unwrap();
    f.apply(command(2, 1, 1, "put k v")).await.unwrap();
    let executions = f.executions.load(Ordering::SeqCst);

    // Same sequence, different payload: the retry must not re-execute.
    let outcome = f.apply(command(3, 1, 1, "put k z")).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Output(Bytes::from_static(b"ok k")));
    assert_eq!(f.executions.load(Ordering::SeqCst), executions);

    let value = f.manager.query(SessionId(1), 2, 3, "get k").await.unwrap();
    assert_eq!(value, Bytes::from_static(b"v"));
}

#[tokio::test]
async fn keep_alive_acknowledges_and_releases_cached_results() {
    let f = fixture();
    f.apply(open_session(1, "registry")).await.unwrap();
    f.apply(command(2, 1, 1, "put k v")).await.unwrap();

    let outcome = f.apply(keep_alive(3, &[(1, 1, 0)])).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Sessions(vec![SessionId(1)]));

    // The cached output for sequence 1 was released; a late retry gets an
    // empty result instead of the original output.
    let outcome = f.apply(command(4, 1, 1, "put k z")).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Output(Bytes::new()));
}

#[tokio::test]
async fn keep_alive_ignores_unknown_sessions() {
    let f = fixture();
    f.apply(open_session(1, "registry")).await.unwrap();
    let outcome = f.apply(keep_alive(2, &[(1, 0, 0), (42, 0, 0)])).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Sessions(vec![SessionId(1)]));
}

#[tokio::test]
async fn forced_compaction_snapshots_and_truncates_the_log() {
    let f = fixture();
    f.apply(open_session(1, "registry")).await.unwrap();
    f.apply(command(2, 1, 1, "put k v")).await.unwrap();
    f.apply(keep_alive(3, &[(1, 1, 0)])).await.unwrap();

    f.manager.compact().await.unwrap();
    let snapshot = f.store.current().expect("snapshot should be finalized");
    assert_eq!(snapshot.index, 3);
    assert_eq!(f.log.lock().first_index(), 4);

    // Nothing new to compact: resolves immediately, log untouched.
    f.manager.compact().await.unwrap();
    assert_eq!(f.log.lock().first_index(), 4);
}

#[tokio::test]
async fn concurrent_compact_calls_share_the_in_flight_cycle() {
    let f = fixture();
    f.apply(open_session(1, "registry")).await.unwrap();
    f.apply(command(2, 1, 1, "put k v")).await.unwrap();
    f.apply(keep_alive(3, &[(1, 1, 0)])).await.unwrap();

    let (a, b) = tokio::join!(f.manager.compact(), f.manager.compact());
    a.unwrap();
    b.unwrap();
    assert_eq!(f.log.lock().first_index(), 4);
}

#[tokio::test]
async fn compaction_waits_for_event_acknowledgement() {
    let f = fixture();
    f.apply(open_session(1, "registry")).await.unwrap();
    // Publishes an event at index 2 which the client has not acknowledged.
    f.apply(command(2, 1, 1, "note hello")).await.unwrap();
    f.apply(keep_alive(3, &[(1, 1, 0)])).await.unwrap();

    // The snapshot cannot finalize while the event is outstanding; the cycle
    // gives up after the completion timeout and leaves the log alone.
    f.manager.compact().await.unwrap();
    assert!(f.store.current().is_none());
    assert_eq!(f.log.lock().first_index(), 1);

    // Acknowledging the event unblocks the next cycle.
    f.apply(keep_alive(4, &[(1, 1, 2)])).await.unwrap();
    f.manager.compact().await.unwrap();
    assert_eq!(f.store.current().unwrap().index, 4);
    assert_eq!(f.log.lock().first_index(), 5);
}

#[tokio::test]
async fn deleting_a_service_removes_its_sessions_for_recreation() {
    let f = fixture();
    f.apply(open_session(1, "registry")).await.unwrap();
    f.apply(command(2, 1, 1, "put k v")).await.unwrap();
    f.apply(close_session(3, 1, true)).await.unwrap();

    let outcome = f.apply(open_session(4, "registry")).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Session(SessionId(4)));

    // Fresh instance: the previous state is gone.
    let value = f.manager.query(SessionId(4), 1, 4, "get k").await.unwrap();
    assert_eq!(value, Bytes::new());

    let ApplyOutcome::Metadata(infos) = f.apply(metadata(5, None)).await.unwrap() else {
        panic!("expected metadata outcome");
    };
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].session, SessionId(4));
    assert_eq!(infos[0].service_name, "registry");
}

#[tokio::test]
async fn closing_an_unknown_session_fails_but_consumes_the_entry() {
    let f = fixture();
    f.apply(open_session(1, "registry")).await.unwrap();
    let err = f.apply(close_session(2, 42, false)).await.unwrap_err();
    assert!(matches!(err, StateError::UnknownSession(SessionId(42))));
    // The log still advanced past the failed entry.
    let outcome = f.apply(command(3, 1, 1, "put k v")).await.unwrap();
    assert!(matches!(outcome, ApplyOutcome::Output(_)));
}

#[tokio::test]
async fn commands_for_unknown_sessions_fail_but_consume_the_entry() {
    let f = fixture();
    f.apply(open_session(1, "registry")).await.unwrap();
    let err = f.apply(command(2, 99, 1, "put k v")).await.unwrap_err();
    assert!(matches!(err, StateError::UnknownSession(SessionId(99))));
    let outcome = f.apply(command(3, 1, 1, "put k v")).await.unwrap();
    assert!(matches!(outcome, ApplyOutcome::Output(_)));
}

#[tokio::test]
async fn reapplying_a_consumed_index_is_out_of_range() {
    let f = fixture();
    f.apply(open_session(1, "registry")).await.unwrap();
    let err = f.manager.apply(1).await.unwrap_err();
    assert!(matches!(err, StateError::IndexOutOfBounds { index: 1, next: 2 }));
}

#[tokio::test]
async fn applying_an_unappended_index_fails() {
    let f = fixture();
    let err = f.manager.apply(1).await.unwrap_err();
    assert!(matches!(err, StateError::IndexOutOfBounds { index: 1, .. }));
}

#[tokio::test]
async fn apply_all_drains_everything_up_to_the_index() {
    let f = fixture();
    f.append(open_session(1, "registry"));
    for i in 2..=20u64 {
        f.append(command(i, 1, i - 1, format!("put k{i} v{i}")));
    }
    // Overlapping drains must not double-apply or reorder anything.
    f.manager.apply_all(10);
    let outcome = f.manager.apply(20).await.unwrap();
    assert!(matches!(outcome, ApplyOutcome::Output(_)));
    assert_eq!(f.executions.load(Ordering::SeqCst), 19);

    let value = f.manager.query(SessionId(1), 100, 20, "get k20").await.unwrap();
    assert_eq!(value, Bytes::from_static(b"v20"));
}

#[tokio::test]
async fn queries_wait_for_the_requested_version() {
    let f = fixture();
    f.apply(open_session(1, "registry")).await.unwrap();

    let manager = f.manager.clone();
    let pending = tokio::spawn(async move { manager.query(SessionId(1), 1, 2, "get k").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished(), "query should be parked at version 2");

    f.apply(command(2, 1, 1, "put k v")).await.unwrap();
    let value = pending.await.unwrap().unwrap();
    assert_eq!(value, Bytes::from_static(b"v"));
}

#[tokio::test]
async fn queries_for_unknown_sessions_fail() {
    let f = fixture();
    f.apply(open_session(1, "registry")).await.unwrap();
    let err = f.manager.query(SessionId(7), 1, 0, "get k").await.unwrap_err();
    assert!(matches!(err, StateError::UnknownSession(SessionId(7))));
}

#[tokio::test]
async fn keep_alive_expires_sessions_past_their_timeout() {
    let f = fixture();
    f.apply(open_session_at(1, 0, "registry", Duration::from_millis(100)))
        .await
        .unwrap();
    f.apply(open_session_at(2, 0, "registry", Duration::from_secs(3_600)))
        .await
        .unwrap();

    // Only session 2 keeps alive, ten seconds later by log time.
    f.apply(keep_alive_at(3, 10_000, &[(2, 0, 0)])).await.unwrap();

    let ApplyOutcome::Metadata(infos) = f.apply(metadata(4, None)).await.unwrap() else {
        panic!("expected metadata outcome");
    };
    let sessions: Vec<_> = infos.iter().map(|i| i.session).collect();
    assert_eq!(sessions, vec![SessionId(2)]);
}

#[tokio::test]
async fn restart_installs_the_snapshot_and_resumes() {
    let f = fixture();
    f.apply(open_session(1, "registry")).await.unwrap();
    f.apply(command(2, 1, 1, "put k v")).await.unwrap();
    f.apply(keep_alive(3, &[(1, 1, 0)])).await.unwrap();
    f.manager.compact().await.unwrap();
    assert_eq!(f.log.lock().first_index(), 4);
    f.manager.shutdown();

    let (restarted, executions) = f.respawn();
    f.append(command(4, 1, 2, "put k w"));
    let outcome = restarted.apply(4).await.unwrap();
    assert!(matches!(outcome, ApplyOutcome::Output(_)));
    // Only the post-snapshot entry executed on the restarted node.
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    let value = restarted.query(SessionId(1), 3, 4, "get k").await.unwrap();
    assert_eq!(value, Bytes::from_static(b"w"));
}

#[tokio::test]
async fn replay_covered_by_a_snapshot_is_skipped_exactly_once() {
    let f = fixture();
    f.apply(open_session(1, "registry")).await.unwrap();
    f.apply(command(2, 1, 1, "put k v")).await.unwrap();
    f.apply(keep_alive(3, &[(1, 1, 0)])).await.unwrap();
    f.manager.compact().await.unwrap();

    // A follower that still holds the full prefix but shares the snapshot.
    let log = shared(MemoryLog::new());
    {
        let mut guard = log.lock();
        guard.append(open_session(1, "registry")).unwrap();
        guard.append(command(2, 1, 1, "put k v")).unwrap();
        guard.append(keep_alive(3, &[(1, 1, 0)])).unwrap();
    }
    let executions = Arc::new(AtomicUsize::new(0));
    let follower = ServiceManager::spawn(
        log.clone(),
        kv_catalog(executions.clone()),
        f.store.clone(),
        Arc::new(NullResourceMonitor),
        test_config(),
    );

    // Entries covered by the snapshot are consumed without re-execution.
    assert_eq!(follower.apply(1).await.unwrap(), ApplyOutcome::None);
    assert_eq!(follower.apply(2).await.unwrap(), ApplyOutcome::None);
    assert_eq!(follower.apply(3).await.unwrap(), ApplyOutcome::None);
    assert_eq!(executions.load(Ordering::SeqCst), 0);

    // The next entry installs the snapshot, then applies normally.
    log.lock().append(command(4, 1, 2, "put k w")).unwrap();
    let outcome = follower.apply(4).await.unwrap();
    assert!(matches!(outcome, ApplyOutcome::Output(_)));
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    let value = follower.query(SessionId(1), 3, 4, "get k").await.unwrap();
    assert_eq!(value, Bytes::from_static(b"w"));
}

#[tokio::test]
async fn shutdown_fails_pending_callers() {
    let f = fixture();
    f.apply(open_session(1, "registry")).await.unwrap();
    f.manager.shutdown();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let err = f.manager.apply(2).await.unwrap_err();
    assert!(matches!(err, StateError::Closed));
}
