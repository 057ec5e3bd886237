use haulage::{
    EntityRef, LifecycleEngine, LoadEvidence, LoadStatus, NotificationEvent, Proposal,
    RecalculationTrigger, RejectionReason, ServiceError, TripEvidence, TripStatus,
};
use haulage_testing::{assert_accepted, assert_rejected, Harness, InMemoryStore};
use uuid::Uuid;

#[tokio::test]
async fn load_and_trip_walk_to_completion() {
    let h = Harness::new();
    let cast = h.cast.clone();
    let load_id = h.store.insert_load(cast.load().build());
    let trip_id = h.store.insert_trip(cast.trip().build());

    let steps = [
        (LoadStatus::Posted, &cast.owner, LoadEvidence::default()),
        (LoadStatus::Requested, &cast.company, LoadEvidence::default()),
        (LoadStatus::Assigned, &cast.owner, LoadEvidence::driver(cast.driver.id)),
    ];
    for (target, actor, evidence) in steps {
        let outcome = h
            .service
            .transition_load(load_id, Proposal::new(target, actor.clone()).with_evidence(evidence))
            .await
            .unwrap();
        assert_accepted(&outcome);
    }

    let planned = h
        .service
        .plan_load_on_trip(load_id, trip_id, cast.owner.clone(), Some("first stop"))
        .await
        .unwrap();
    assert_eq!(assert_accepted(&planned).next.trip_id, Some(trip_id));

    // The trip has not started yet.
    let pickup = || {
        Proposal::new(LoadStatus::InTransit, cast.driver.clone())
            .with_evidence(LoadEvidence::pickup_photo("s3://bol/1.jpg"))
    };
    let early = h.service.transition_load(load_id, pickup()).await.unwrap();
    assert_rejected(&early, RejectionReason::TripNotActive);

    let started = h
        .service
        .transition_trip(
            trip_id,
            Proposal::new(TripStatus::Active, cast.driver.clone())
                .with_evidence(TripEvidence::start(104_233, "s3://odo/start.jpg")),
        )
        .await
        .unwrap();
    assert_accepted(&started);

    assert_accepted(&h.service.transition_load(load_id, pickup()).await.unwrap());
    let delivered = h
        .service
        .transition_load(
            load_id,
            Proposal::new(LoadStatus::Delivered, cast.driver.clone())
                .with_evidence(LoadEvidence::delivery_photo("s3://pod/1.jpg")),
        )
        .await
        .unwrap();
    assert_eq!(
        assert_accepted(&delivered).side_effects.recalculations.as_slice(),
        &[
            RecalculationTrigger::LoadReceivable { load_id },
            RecalculationTrigger::TripSettlement {
                trip_id,
                settlement_id: None
            },
        ]
    );

    let completed = h
        .service
        .transition_trip(
            trip_id,
            Proposal::new(TripStatus::Completed, cast.driver.clone())
                .with_evidence(TripEvidence::end(104_871, "s3://odo/end.jpg")),
        )
        .await
        .unwrap();
    assert_eq!(assert_accepted(&completed).next.distance(), Some(638));

    let load = h.store.load(load_id).unwrap();
    assert_eq!(load.status, LoadStatus::Delivered);
    assert_eq!(load.revision.get(), 7);
    let trip = h.store.trip(trip_id).unwrap();
    assert_eq!(trip.status, TripStatus::Completed);
    assert_eq!(trip.revision.get(), 3);

    let history = h.service.history(EntityRef::load(load_id)).await.unwrap();
    let revisions: Vec<i64> = history.iter().map(|entry| entry.revision.get()).collect();
    assert_eq!(revisions, vec![2, 3, 4, 5, 6, 7]);
    assert_eq!(history[3].note.as_deref(), Some("first stop"));
    assert_eq!(h.service.history(EntityRef::trip(trip_id)).await.unwrap().len(), 2);

    assert_eq!(h.store.outbox_records().len(), 11);
}

#[tokio::test]
async fn rejection_writes_nothing() {
    let h = Harness::new();
    let load_id = h.store.insert_load(h.cast.load().build());

    let outcome = h
        .service
        .transition_load(load_id, Proposal::new(LoadStatus::Posted, h.cast.driver.clone()))
        .await
        .unwrap();
    assert_rejected(&outcome, RejectionReason::Unauthorized);

    assert_eq!(h.store.load(load_id).unwrap().status, LoadStatus::Draft);
    assert_eq!(h.store.history_len(), 0);
    assert!(h.store.outbox_records().is_empty());
}

#[tokio::test]
async fn unknown_entity_is_not_found() {
    let h = Harness::new();
    let missing = Uuid::new_v4();

    let err = h
        .service
        .transition_trip(missing, Proposal::new(TripStatus::Cancelled, h.cast.owner.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(entity) if entity == EntityRef::trip(missing)));
}

#[tokio::test]
async fn load_pointing_at_a_missing_trip_is_not_found() {
    let h = Harness::new();
    let dangling = Uuid::new_v4();
    let load_id = h.store.insert_load(
        h.cast
            .load()
            .assigned_to(h.cast.driver.id)
            .on_trip(dangling)
            .build(),
    );

    let err = h
        .service
        .transition_load(load_id, Proposal::new(LoadStatus::Cancelled, h.cast.owner.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(entity) if entity == EntityRef::trip(dangling)));
}

#[tokio::test]
async fn relaxed_policy_flows_through_the_service() {
    let engine = LifecycleEngine::builder().require_delivery_photo(false).build();
    let h = Harness::with_engine(engine, InMemoryStore::new());
    let load_id = h.store.insert_load(
        h.cast
            .load()
            .status(LoadStatus::InTransit)
            .assigned_to(h.cast.driver.id)
            .build(),
    );

    let outcome = h
        .service
        .transition_load(load_id, Proposal::new(LoadStatus::Delivered, h.cast.driver.clone()))
        .await
        .unwrap();
    let accepted = assert_accepted(&outcome);
    assert_eq!(
        accepted.side_effects.notifications[0].event,
        NotificationEvent::LoadDelivered
    );
}

#[tokio::test]
async fn cancelled_trip_load_triggers_settlement_recalculation() {
    let h = Harness::new();
    let trip_id = h.store.insert_trip(h.cast.trip().active(500, "odo.jpg").build());
    let load_id = h.store.insert_load(
        h.cast
            .load()
            .assigned_to(h.cast.driver.id)
            .on_trip(trip_id)
            .build(),
    );

    let outcome = h
        .service
        .transition_load(
            load_id,
            Proposal::new(LoadStatus::Cancelled, h.cast.owner.clone()).with_note("shipper cancelled"),
        )
        .await
        .unwrap();
    let accepted = assert_accepted(&outcome);
    assert_eq!(
        accepted.side_effects.recalculations.as_slice(),
        &[RecalculationTrigger::TripSettlement {
            trip_id,
            settlement_id: None
        }]
    );
    assert_eq!(
        accepted.side_effects.notifications[0].recipient.user_id,
        Some(h.cast.driver.id)
    );
}
