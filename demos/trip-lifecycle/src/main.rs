//! # Trip Lifecycle Example
//!
//! One load, one trip, from draft to settlement trigger.
//! The engine decides, the in-memory store commits, the relay delivers.
//!
//! Run with `RUST_LOG=haulage=debug,trip_lifecycle_demo=info` to see every
//! decision.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use haulage::{
    retry_delay, Actor, Categorizable, DeliveryError, EntityRef, LifecycleService, LoadEvidence,
    LoadStatus, NotificationSink, NotificationTrigger, Outcome, Proposal, RecalculationSink,
    RecalculationTrigger, Relay, TripEvidence, TripStatus,
};
use haulage_testing::{InMemoryStore, LoadBuilder, TripBuilder};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ============================================================================
// Collaborators (Delivery only)
// ============================================================================

/// Logs notifications. The first delivery fails to show the outbox retry.
struct PushGateway {
    warmed_up: AtomicBool,
}

#[async_trait]
impl NotificationSink for PushGateway {
    async fn notify(&self, trigger: &NotificationTrigger) -> Result<(), DeliveryError> {
        if !self.warmed_up.swap(true, Ordering::SeqCst) {
            return Err(DeliveryError::retryable(anyhow::anyhow!("push gateway cold start")));
        }
        info!(
            event = trigger.event.as_str(),
            role = trigger.recipient.role.as_str(),
            entity = %trigger.entity,
            "push sent"
        );
        Ok(())
    }
}

/// Stands in for the settlement service.
struct Ledger;

#[async_trait]
impl RecalculationSink for Ledger {
    async fn recalculate(&self, trigger: &RecalculationTrigger) -> Result<(), DeliveryError> {
        match trigger {
            RecalculationTrigger::LoadReceivable { load_id } => {
                info!(%load_id, "receivable recalculated")
            }
            RecalculationTrigger::TripSettlement { trip_id, .. } => {
                info!(%trip_id, "settlement recalculated")
            }
        }
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn report<E: haulage::Lifecycle>(step: &str, outcome: &Outcome<E>) {
    match outcome {
        Outcome::Accepted(accepted) => {
            println!("  {step}: {} -> {} ({})", accepted.from, accepted.to, accepted.edge)
        }
        Outcome::Rejected(rejection) => {
            println!("  {step}: rejected, {}", rejection.user_message())
        }
    }
}

fn expect_accepted<E: haulage::Lifecycle>(step: &str, outcome: &Outcome<E>) -> Result<()> {
    report(step, outcome);
    if let Outcome::Rejected(rejection) = outcome {
        bail!("{step} was rejected: {rejection}");
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let owner = Actor::owner(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());
    let company = Actor::company(Uuid::new_v4());

    let store = Arc::new(InMemoryStore::new());
    let load_id = store.insert_load(
        LoadBuilder::new()
            .owner(owner.id)
            .rate_cents(240_000)
            .accessorial("detention", 7_500)
            .build(),
    );
    let trip_id = store.insert_trip(TripBuilder::new().owner(owner.id).driver(driver.id).build());

    let service = LifecycleService::new(store.clone());

    println!("Load {load_id}");
    let outcome = service
        .transition_load(load_id, Proposal::new(LoadStatus::Posted, owner.clone()))
        .await?;
    expect_accepted("publish", &outcome)?;

    let outcome = service
        .transition_load(load_id, Proposal::new(LoadStatus::Requested, company.clone()))
        .await?;
    expect_accepted("request", &outcome)?;

    let outcome = service
        .transition_load(
            load_id,
            Proposal::new(LoadStatus::Assigned, owner.clone())
                .with_evidence(LoadEvidence::driver(driver.id)),
        )
        .await?;
    expect_accepted("accept", &outcome)?;

    let outcome = service
        .plan_load_on_trip(load_id, trip_id, owner.clone(), Some("morning run"))
        .await?;
    expect_accepted("plan on trip", &outcome)?;

    // Pickup before the trip starts is refused.
    let pickup = Proposal::new(LoadStatus::InTransit, driver.clone())
        .with_evidence(LoadEvidence::pickup_photo("s3://bol/7731.jpg"));
    let outcome = service.transition_load(load_id, pickup.clone()).await?;
    report("early pickup", &outcome);

    println!("Trip {trip_id}");
    let outcome = service
        .transition_trip(
            trip_id,
            Proposal::new(TripStatus::Active, driver.clone())
                .with_evidence(TripEvidence::start(104_233, "s3://odo/start.jpg")),
        )
        .await?;
    expect_accepted("start", &outcome)?;

    let outcome = service.transition_load(load_id, pickup).await?;
    expect_accepted("pickup", &outcome)?;

    let outcome = service
        .transition_load(
            load_id,
            Proposal::new(LoadStatus::Delivered, driver.clone())
                .with_evidence(LoadEvidence::delivery_photo("s3://pod/7731.jpg")),
        )
        .await?;
    expect_accepted("deliver", &outcome)?;

    // A typo on the closing reading.
    let outcome = service
        .transition_trip(
            trip_id,
            Proposal::new(TripStatus::Completed, driver.clone())
                .with_evidence(TripEvidence::end(10_487, "s3://odo/end.jpg")),
        )
        .await?;
    report("complete (typo)", &outcome);
    if let Some(rejection) = outcome.rejection() {
        println!("    category: {:?}", rejection.category());
    }

    let outcome = service
        .transition_trip(
            trip_id,
            Proposal::new(TripStatus::Completed, driver.clone())
                .with_evidence(TripEvidence::end(104_871, "s3://odo/end.jpg")),
        )
        .await?;
    expect_accepted("complete", &outcome)?;

    println!("History");
    for entity in [EntityRef::load(load_id), EntityRef::trip(trip_id)] {
        for entry in service.history(entity).await? {
            println!(
                "  {} {} {} by {} ({})",
                entry.revision,
                entity,
                entry.edge,
                entry.actor_role.as_str(),
                entry.note.as_deref().unwrap_or("-")
            );
        }
    }

    println!("Relay");
    let relay = Relay::new(
        store.clone(),
        Arc::new(PushGateway {
            warmed_up: AtomicBool::new(false),
        }),
        Arc::new(Ledger),
    );
    let first = relay.run_once().await?;
    println!(
        "  pass 1: claimed {}, delivered {}, failed {}",
        first.claimed, first.delivered, first.failed
    );

    store.advance_clock(retry_delay(1));
    let second = relay.run_once().await?;
    println!(
        "  pass 2: claimed {}, delivered {}, failed {}",
        second.claimed, second.delivered, second.failed
    );
    println!("  dead letters: {}", store.dead_letters().len());

    Ok(())
}
