use std::time::Duration as StdDuration;

use haulage::{
    retry_delay, FailureKind, LoadStatus, NotificationEvent, Proposal, RelayReport,
};
use haulage_testing::{assert_accepted, Harness, InMemoryStore, OutboxState};
use uuid::Uuid;

/// Commits posted → requested, which enqueues one notification for the owner.
async fn requested_load(h: &Harness) -> Uuid {
    let load_id = h
        .store
        .insert_load(h.cast.load().status(LoadStatus::Posted).build());
    let outcome = h
        .service
        .transition_load(
            load_id,
            Proposal::new(LoadStatus::Requested, h.cast.company.clone()),
        )
        .await
        .unwrap();
    assert_accepted(&outcome);
    load_id
}

#[tokio::test]
async fn relay_delivers_and_marks_records() {
    let h = Harness::new();
    requested_load(&h).await;

    let report = h.relay().run_once().await.unwrap();
    assert_eq!(
        report,
        RelayReport {
            claimed: 1,
            delivered: 1,
            failed: 0
        }
    );
    assert_eq!(h.sink.events().await, vec![NotificationEvent::LoadRequested]);
    assert_eq!(h.store.outbox_in(OutboxState::Delivered).len(), 1);

    let idle = h.relay().run_once().await.unwrap();
    assert_eq!(idle, RelayReport::default());
}

#[tokio::test]
async fn failed_delivery_retries_without_touching_status() {
    let h = Harness::new();
    let load_id = requested_load(&h).await;
    h.sink.fail_next(1, FailureKind::Retryable).await;
    let relay = h.relay();

    let report = relay.run_once().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.store.load(load_id).unwrap().status, LoadStatus::Requested);

    let pending = h.store.outbox_in(OutboxState::Pending);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].last_error.is_some());

    // Backed off: nothing is ready yet.
    assert_eq!(relay.run_once().await.unwrap().claimed, 0);

    h.store.advance_clock(retry_delay(1));
    let report = relay.run_once().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(h.sink.events().await, vec![NotificationEvent::LoadRequested]);
}

#[tokio::test]
async fn permanent_failure_dead_letters_immediately() {
    let h = Harness::new();
    let load_id = requested_load(&h).await;
    h.sink.fail_next(1, FailureKind::NonRetryable).await;

    h.relay().run_once().await.unwrap();

    let dead = h.store.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 1);
    assert!(h.sink.notifications().await.is_empty());
    assert_eq!(h.store.load(load_id).unwrap().status, LoadStatus::Requested);
}

#[tokio::test]
async fn exhausted_retries_dead_letter() {
    let h = Harness::with_store(InMemoryStore::new().with_max_attempts(3));
    requested_load(&h).await;
    h.sink.fail_next(3, FailureKind::Retryable).await;
    let relay = h.relay();

    for attempt in 1..=3 {
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.failed, 1, "attempt {attempt}");
        h.store.advance_clock(retry_delay(attempt));
    }

    assert_eq!(h.store.dead_letters().len(), 1);
    assert_eq!(relay.run_once().await.unwrap().claimed, 0);
    assert!(h.sink.notifications().await.is_empty());
}

#[tokio::test]
async fn two_relays_never_deliver_the_same_record() {
    let h = Harness::new();
    for _ in 0..10 {
        requested_load(&h).await;
    }
    let (a, b) = (h.relay(), h.relay());

    let (ra, rb) = tokio::join!(a.run_once(), b.run_once());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.delivered + rb.delivered, 10);
    assert_eq!(h.sink.notifications().await.len(), 10);
}

#[tokio::test]
async fn running_relay_drains_until_shutdown() {
    let h = Harness::new();
    requested_load(&h).await;
    requested_load(&h).await;

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let relay = tokio::spawn(h.relay().run(StdDuration::from_millis(5), async move {
        let _ = stopped.await;
    }));

    let drained = tokio::time::timeout(StdDuration::from_secs(5), async {
        while h.sink.notifications().await.len() < 2 {
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "relay did not drain the outbox");

    let _ = stop.send(());
    relay.await.unwrap();
    assert_eq!(h.store.outbox_in(OutboxState::Delivered).len(), 2);
}
