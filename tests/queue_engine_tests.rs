mod common;

use chrono::Utc;
use common::{
    ScriptedTransport, end_shift, open_harness, open_with, push_token, quiet_policy,
    record_location, start_shift, status, upload_photo,
};
use futures::StreamExt;
use serde_json::json;
use shiftsync::{
    CommandType, Connectivity, EngineDeps, EnqueueOutcome, LocalShift, MemoryLocalStore,
    MutationState, QueueStore, QueuedMutation, RemoteEnvelope, ShiftStatus, SyncEngine,
    SyncStatus, TransportError,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::tempdir;

fn queued_id(outcome: EnqueueOutcome) -> String {
    match outcome {
        EnqueueOutcome::Queued { id } => id,
        other => panic!("expected queued, got {:?}", other),
    }
}

#[tokio::test]
async fn offline_enqueue_persists_without_executing() {
    let dir = tempdir().unwrap();
    let h = open_harness(dir.path(), quiet_policy(), false).await;

    let id = queued_id(h.engine.enqueue(start_shift("temp_1"), None, None).await.unwrap());

    assert!(h.transport.calls().is_empty());
    assert_eq!(*h.engine.pending_count().borrow(), 1);
    let backlog = h.engine.reconciliation_backlog().borrow().clone();
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog[0].temp_entity_id.as_deref(), Some("temp_1"));

    let stored = h.engine.get(&id).await.unwrap();
    assert_eq!(stored.state, MutationState::Pending);
    assert_eq!(stored.idempotency_key.as_deref(), Some("start_shift:temp_1"));
    assert!(!h.engine.execute_next().await.unwrap());
}

#[tokio::test]
async fn duplicate_idempotency_key_is_dropped() {
    let dir = tempdir().unwrap();
    let h = open_harness(dir.path(), quiet_policy(), false).await;

    let first = queued_id(h.engine.enqueue(start_shift("temp_1"), None, None).await.unwrap());
    let second = h.engine.enqueue(start_shift("temp_1"), None, None).await.unwrap();
    assert_eq!(
        second,
        EnqueueOutcome::Duplicate {
            existing_id: Some(first.clone())
        }
    );

    let explicit = h
        .engine
        .enqueue(push_token("a"), Some("token-refresh".to_string()), None)
        .await
        .unwrap();
    assert!(matches!(explicit, EnqueueOutcome::Queued { .. }));
    let explicit_again = h
        .engine
        .enqueue(push_token("b"), Some("token-refresh".to_string()), None)
        .await
        .unwrap();
    assert!(matches!(explicit_again, EnqueueOutcome::Duplicate { .. }));

    assert_eq!(*h.engine.pending_count().borrow(), 2);
}

#[tokio::test]
async fn started_shift_is_reconciled_with_server_id() {
    let dir = tempdir().unwrap();
    let local = Arc::new(MemoryLocalStore::new());
    local
        .insert_shift(LocalShift::started_offline("temp_1", "site_1", Utc::now()))
        .unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(CommandType::StartShift, Ok(RemoteEnvelope::ok(json!({"id": 42}))));

    let h = open_with(dir.path(), quiet_policy(), false, transport, local).await;
    let id = queued_id(h.engine.enqueue(start_shift("temp_1"), None, None).await.unwrap());

    h.connectivity.set_online(true);
    assert_eq!(h.engine.drain_all().await.unwrap(), 1);

    assert_eq!(*h.engine.pending_count().borrow(), 0);
    assert!(h.engine.reconciliation_backlog().borrow().is_empty());
    assert!(h.engine.get(&id).await.is_none());
    assert!(h.engine.reconciliation_misses().await.is_empty());

    let shift = h.local.shift("temp_1").unwrap().unwrap();
    assert_eq!(shift.server_id.as_deref(), Some("42"));
    assert_eq!(shift.sync_status, SyncStatus::Synced);
    assert_eq!(shift.status, ShiftStatus::Active);
}

#[tokio::test]
async fn online_enqueue_executes_immediately() {
    let dir = tempdir().unwrap();
    let h = open_harness(dir.path(), quiet_policy(), true).await;

    let id = queued_id(h.engine.enqueue(record_location("s1"), None, None).await.unwrap());

    assert_eq!(h.transport.calls_for(CommandType::RecordLocation), vec!["s1"]);
    assert!(h.engine.get(&id).await.is_none());
    assert_eq!(*h.engine.pending_count().borrow(), 0);
}

#[tokio::test]
async fn end_shift_waits_for_start_to_be_confirmed() {
    let dir = tempdir().unwrap();
    let local = Arc::new(MemoryLocalStore::new());
    local
        .insert_shift(LocalShift::started_offline("temp_1", "site_1", Utc::now()))
        .unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(
        CommandType::StartShift,
        Err(TransportError::Network("connection reset".to_string())),
    );

    let h = open_with(dir.path(), quiet_policy(), false, transport, local).await;
    let start_id = queued_id(h.engine.enqueue(start_shift("temp_1"), None, None).await.unwrap());
    h.engine.enqueue(end_shift("temp_1"), None, None).await.unwrap();

    h.connectivity.set_online(true);
    assert_eq!(h.engine.drain_all().await.unwrap(), 0);
    assert!(h.transport.calls_for(CommandType::EndShift).is_empty());
    let start = h.engine.get(&start_id).await.unwrap();
    assert_eq!(start.retry_count, 1);
    assert!(start.last_error.unwrap().contains("connection reset"));

    assert_eq!(h.engine.drain_all().await.unwrap(), 2);
    assert_eq!(h.transport.calls_for(CommandType::EndShift), vec!["srv_temp_1"]);
    assert_eq!(*h.engine.pending_count().borrow(), 0);
}

#[tokio::test]
async fn end_shift_without_server_id_is_retried() {
    let dir = tempdir().unwrap();
    let local = Arc::new(MemoryLocalStore::new());
    local
        .insert_shift(LocalShift::started_offline("temp_9", "site_1", Utc::now()))
        .unwrap();
    let h = open_with(
        dir.path(),
        quiet_policy(),
        false,
        Arc::new(ScriptedTransport::new()),
        local,
    )
    .await;
    let id = queued_id(h.engine.enqueue(end_shift("temp_9"), None, None).await.unwrap());

    h.connectivity.set_online(true);
    assert!(h.engine.execute_next().await.unwrap());

    let row = h.engine.get(&id).await.unwrap();
    assert!(row.is_pending());
    assert_eq!(row.retry_count, 1);
    assert!(row.last_error.unwrap().contains("not yet confirmed"));
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn retryable_failures_quarantine_after_max_retries() {
    let dir = tempdir().unwrap();
    let h = open_harness(dir.path(), quiet_policy().max_retries(3), false).await;
    h.transport.always(CommandType::UploadPhoto, status(503));
    let id = queued_id(h.engine.enqueue(upload_photo("photo_1"), None, None).await.unwrap());

    h.connectivity.set_online(true);
    for attempt in 1..=2 {
        assert!(h.engine.execute_next().await.unwrap());
        let row = h.engine.get(&id).await.unwrap();
        assert!(row.is_pending());
        assert_eq!(row.retry_count, attempt);
    }

    assert!(h.engine.execute_next().await.unwrap());
    let row = h.engine.get(&id).await.unwrap();
    assert!(row.is_quarantined());
    assert!(row.retry_count > row.max_retries);
    assert!(row.last_error.unwrap().contains("HTTP 503"));

    assert!(!h.engine.execute_next().await.unwrap());
    assert_eq!(h.transport.calls_for(CommandType::UploadPhoto).len(), 3);
    assert_eq!(*h.engine.pending_count().borrow(), 0);
    let backlog = h.engine.reconciliation_backlog().borrow().clone();
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog[0].id, id);

    let stats = h.engine.quarantine_stats().await;
    assert_eq!(stats.total, 1);
    assert_eq!(stats.by_type.get(&CommandType::UploadPhoto), Some(&1));
}

#[tokio::test]
async fn quarantined_creation_stays_in_reconciliation_backlog() {
    let dir = tempdir().unwrap();
    let h = open_harness(dir.path(), quiet_policy(), false).await;
    h.transport.script(CommandType::StartShift, status(400));
    let id = queued_id(h.engine.enqueue(start_shift("temp_1"), None, None).await.unwrap());

    h.connectivity.set_online(true);
    assert!(h.engine.execute_next().await.unwrap());
    assert_eq!(h.engine.quarantine_stats().await.total, 1);

    let backlog = h.engine.reconciliation_backlog().borrow().clone();
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog[0].id, id);
    assert!(backlog[0].is_quarantined());
    assert_eq!(backlog[0].temp_entity_id.as_deref(), Some("temp_1"));
    assert_eq!(backlog[0].server_entity_id(), None);
    assert_eq!(h.engine.stats().await.reconciliation_backlog, 1);

    h.engine.quarantine_discard(&id).await.unwrap();
    assert!(h.engine.reconciliation_backlog().borrow().is_empty());
}

#[tokio::test]
async fn non_retryable_failure_quarantines_on_first_attempt() {
    let dir = tempdir().unwrap();
    let h = open_harness(dir.path(), quiet_policy(), false).await;
    h.transport.script(
        CommandType::UpdatePushToken,
        Ok(RemoteEnvelope::new(400, Some(json!({"message": "bad token"})))),
    );
    let id = queued_id(h.engine.enqueue(push_token("tok"), None, None).await.unwrap());

    h.connectivity.set_online(true);
    assert_eq!(h.engine.drain_all().await.unwrap(), 0);

    let row = h.engine.get(&id).await.unwrap();
    assert!(row.is_quarantined());
    assert!(row.last_error.unwrap().contains("bad token"));
    assert_eq!(h.transport.calls().len(), 1);
}

#[tokio::test]
async fn drain_stops_at_first_retryable_failure() {
    let dir = tempdir().unwrap();
    let h = open_harness(dir.path(), quiet_policy(), false).await;
    h.transport.script(CommandType::RecordLocation, status(500));
    for sample in ["s1", "s2", "s3"] {
        h.engine.enqueue(record_location(sample), None, None).await.unwrap();
    }

    h.connectivity.set_online(true);
    assert_eq!(h.engine.drain_all().await.unwrap(), 0);
    assert_eq!(h.transport.calls_for(CommandType::RecordLocation), vec!["s1"]);

    assert_eq!(h.engine.drain_all().await.unwrap(), 3);
    assert_eq!(
        h.transport.calls_for(CommandType::RecordLocation),
        vec!["s1", "s1", "s2", "s3"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_execution_is_single_flight() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::with_delay(Duration::from_millis(20)));
    let h = open_with(
        dir.path(),
        quiet_policy(),
        false,
        transport.clone(),
        Arc::new(MemoryLocalStore::new()),
    )
    .await;
    for token in ["a", "b", "c", "d", "e"] {
        h.engine.enqueue(push_token(token), None, None).await.unwrap();
    }
    h.connectivity.set_online(true);

    let engine = Arc::new(h.engine);
    let mut handles = Vec::new();
    for _ in 0..5 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { engine.execute_next().await.unwrap() }));
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }

    assert_eq!(transport.max_in_flight(), 1);
    assert_eq!(
        transport.calls_for(CommandType::UpdatePushToken),
        vec!["a", "b", "c", "d", "e"]
    );
    assert_eq!(*engine.pending_count().borrow(), 0);
}

/// Reports online for a fixed number of checks, then offline.
struct OnlineFor(AtomicUsize);

impl Connectivity for OnlineFor {
    fn is_online(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[tokio::test]
async fn panicking_execution_counts_as_retryable_failure() {
    let dir = tempdir().unwrap();
    let h = open_harness(dir.path(), quiet_policy().max_retries(3), false).await;
    h.transport.panic_on(CommandType::UploadPhoto);
    let id = queued_id(h.engine.enqueue(upload_photo("photo_1"), None, None).await.unwrap());

    h.connectivity.set_online(true);
    for attempt in 1..=2 {
        assert!(h.engine.execute_next().await.unwrap());
        let row = h.engine.get(&id).await.unwrap();
        assert!(row.is_pending());
        assert_eq!(row.retry_count, attempt);
        assert!(
            row.last_error
                .as_deref()
                .unwrap()
                .contains("execution panicked: transport blew up on UPLOAD_PHOTO")
        );
    }

    assert!(h.engine.execute_next().await.unwrap());
    let row = h.engine.get(&id).await.unwrap();
    assert!(row.is_quarantined());
    assert!(row.retry_count > row.max_retries);
    assert_eq!(h.transport.calls_for(CommandType::UploadPhoto).len(), 3);
    assert_eq!(h.engine.quarantine_stats().await.total, 1);
}

#[tokio::test]
async fn connectivity_lost_after_claim_releases_without_retry_cost() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new());
    let connectivity = Arc::new(OnlineFor(AtomicUsize::new(0)));
    let deps = EngineDeps {
        transport: transport.clone(),
        local: Arc::new(MemoryLocalStore::new()),
        connectivity: connectivity.clone(),
    };
    let engine = SyncEngine::open(dir.path(), quiet_policy(), deps).await.unwrap();
    let id = queued_id(engine.enqueue(push_token("tok"), None, None).await.unwrap());

    // Online for the claim, offline again before dispatch.
    connectivity.0.store(1, Ordering::SeqCst);
    assert!(!engine.execute_next().await.unwrap());

    let row = engine.get(&id).await.unwrap();
    assert!(row.is_pending());
    assert_eq!(row.retry_count, 0);
    assert!(row.last_error.is_none());
    assert!(transport.calls().is_empty());
    assert_eq!(*engine.pending_count().borrow(), 1);

    connectivity.0.store(2, Ordering::SeqCst);
    assert!(engine.execute_next().await.unwrap());
    assert!(engine.get(&id).await.is_none());
    assert_eq!(transport.calls_for(CommandType::UpdatePushToken), vec!["tok".to_string()]);
}

#[tokio::test]
async fn interrupted_execution_returns_to_pending_without_retry_cost() {
    let dir = tempdir().unwrap();
    let policy = quiet_policy();

    let id = {
        let mut store = QueueStore::open(dir.path(), policy.clone()).await.unwrap();
        let mutation = QueuedMutation::new(&push_token("tok"), None, None, 3).unwrap();
        let id = mutation.id.clone();
        assert!(store.insert(mutation).await.unwrap());
        let claimed = store.claim_next().await.unwrap().unwrap();
        assert!(claimed.is_executing());
        id
    };

    let h = open_harness(dir.path(), policy, false).await;
    let row = h.engine.get(&id).await.unwrap();
    assert!(row.is_pending());
    assert_eq!(row.retry_count, 0);

    h.connectivity.set_online(true);
    assert_eq!(h.engine.drain_all().await.unwrap(), 1);
    assert!(h.engine.get(&id).await.is_none());
}

#[tokio::test]
async fn reopen_replays_queue_in_order() {
    let dir = tempdir().unwrap();
    let policy = quiet_policy().snapshot_every_ops(2);

    let ids = {
        let h = open_harness(dir.path(), policy.clone(), false).await;
        let mut ids = Vec::new();
        for sample in ["s1", "s2", "s3", "s4", "s5"] {
            ids.push(queued_id(
                h.engine.enqueue(record_location(sample), None, None).await.unwrap(),
            ));
        }
        ids
    };
    assert!(dir.path().join("queue_snapshot.json").exists());

    let h = open_harness(dir.path(), policy, false).await;
    let pending = h.engine.list_pending().await;
    assert_eq!(pending.iter().map(|m| m.id.clone()).collect::<Vec<_>>(), ids);
    assert_eq!(*h.engine.pending_count().borrow(), 5);

    let duplicate = h.engine.enqueue(record_location("s3"), None, None).await.unwrap();
    assert_eq!(
        duplicate,
        EnqueueOutcome::Duplicate {
            existing_id: Some(ids[2].clone())
        }
    );

    h.connectivity.set_online(true);
    assert_eq!(h.engine.drain_all().await.unwrap(), 5);
    assert_eq!(
        h.transport.calls_for(CommandType::RecordLocation),
        vec!["s1", "s2", "s3", "s4", "s5"]
    );
}

#[tokio::test]
async fn interrupted_reconciliation_resumes_on_open() {
    let dir = tempdir().unwrap();
    let policy = quiet_policy();

    {
        let mut store = QueueStore::open(dir.path(), policy.clone()).await.unwrap();
        let mut mutation =
            QueuedMutation::new(&start_shift("temp_5"), None, Some("temp_5".to_string()), 3)
                .unwrap();
        mutation.state = MutationState::Reconciling {
            server_entity_id: "500".to_string(),
        };
        store.insert(mutation).await.unwrap();
    }

    let local = Arc::new(MemoryLocalStore::new());
    local
        .insert_shift(LocalShift::started_offline("temp_5", "site_1", Utc::now()))
        .unwrap();
    let h = open_with(
        dir.path(),
        policy,
        false,
        Arc::new(ScriptedTransport::new()),
        local,
    )
    .await;

    assert_eq!(*h.engine.pending_count().borrow(), 0);
    let shift = h.local.shift("temp_5").unwrap().unwrap();
    assert_eq!(shift.server_id.as_deref(), Some("500"));
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn unmapped_server_ids_are_recorded_as_misses() {
    let dir = tempdir().unwrap();
    let h = open_harness(dir.path(), quiet_policy(), false).await;
    h.transport.script(
        CommandType::UploadPhoto,
        Ok(RemoteEnvelope::ok(json!({"serverId": "p-1"}))),
    );
    h.engine.enqueue(upload_photo("photo_1"), None, None).await.unwrap();
    h.engine.enqueue(start_shift("ghost"), None, None).await.unwrap();

    h.connectivity.set_online(true);
    assert_eq!(h.engine.drain_all().await.unwrap(), 2);

    let misses = h.engine.reconciliation_misses().await;
    assert_eq!(misses.len(), 2);
    assert_eq!(misses[0].command_type, CommandType::UploadPhoto);
    assert_eq!(misses[0].server_entity_id.as_deref(), Some("p-1"));
    assert_eq!(misses[1].command_type, CommandType::StartShift);
    assert_eq!(misses[1].temp_entity_id.as_deref(), Some("ghost"));
    assert_eq!(*h.engine.pending_count().borrow(), 0);
}

#[tokio::test]
async fn undecodable_payload_is_quarantined_without_dispatch() {
    let dir = tempdir().unwrap();
    let h = open_harness(dir.path(), quiet_policy(), false).await;

    let mut broken = QueuedMutation::new(&push_token("tok"), None, None, 3).unwrap();
    broken.command_type = CommandType::StartShift;
    let id = broken.id.clone();
    h.engine.store().lock().await.insert(broken).await.unwrap();

    h.connectivity.set_online(true);
    assert!(h.engine.execute_next().await.unwrap());

    let row = h.engine.get(&id).await.unwrap();
    assert!(row.is_quarantined());
    assert!(row.last_error.unwrap().contains("undecodable"));
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn pending_count_stream_follows_queue() {
    let dir = tempdir().unwrap();
    let h = open_harness(dir.path(), quiet_policy(), false).await;
    let mut counts = Box::pin(h.engine.pending_count_stream());
    let mut backlog = Box::pin(h.engine.reconciliation_backlog_stream());

    assert_eq!(counts.next().await, Some(0));
    assert_eq!(backlog.next().await.map(|rows| rows.len()), Some(0));

    h.engine.enqueue(start_shift("temp_1"), None, None).await.unwrap();
    assert_eq!(counts.next().await, Some(1));
    assert_eq!(backlog.next().await.map(|rows| rows.len()), Some(1));

    h.connectivity.set_online(true);
    h.engine.drain_all().await.unwrap();
    let settled = tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(count) = counts.next().await {
            if count == 0 {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(settled);
}
