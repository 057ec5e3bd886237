//! Testing utilities for haulage.
//!
//! - [`InMemoryStore`]: lifecycle store and outbox with a movable clock
//! - [`RecordingSink`]: notification and recalculation sink with scripted failures
//! - [`Cast`]: one owner, driver, company and carrier that know each other
//! - [`Harness`]: store, sink, service and relay wired together
//!
//! # Example
//!
//! ```ignore
//! let harness = Harness::new();
//! let load = harness.store.insert_load(harness.cast.load().build());
//!
//! let outcome = harness
//!     .service
//!     .transition_load(load, Proposal::new(LoadStatus::Posted, harness.cast.owner.clone()))
//!     .await?;
//! assert_accepted(&outcome);
//!
//! harness.relay().run_once().await?;
//! ```

mod sink;
mod store;

use std::sync::Arc;

use uuid::Uuid;

use haulage::{
    Accepted, Actor, Lifecycle, LifecycleEngine, LifecycleService, Outcome, Rejection,
    RejectionReason, Relay, RelayConfig,
};

pub use haulage::testing::{LoadBuilder, TripBuilder};
pub use sink::RecordingSink;
pub use store::{InMemoryStore, OutboxRecord, OutboxState};

/// A fixed set of parties for one test.
#[derive(Debug, Clone)]
pub struct Cast {
    pub owner: Actor,
    pub driver: Actor,
    pub company: Actor,
    pub carrier: Actor,
}

impl Default for Cast {
    fn default() -> Self {
        Self::new()
    }
}

impl Cast {
    pub fn new() -> Self {
        Self {
            owner: Actor::owner(Uuid::new_v4()),
            driver: Actor::driver(Uuid::new_v4()),
            company: Actor::company(Uuid::new_v4()),
            carrier: Actor::carrier(Uuid::new_v4()),
        }
    }

    /// A draft load owned by the cast's owner.
    pub fn load(&self) -> LoadBuilder {
        LoadBuilder::new().owner(self.owner.id)
    }

    /// A planned trip owned by the cast's owner, driven by the cast's driver.
    pub fn trip(&self) -> TripBuilder {
        TripBuilder::new().owner(self.owner.id).driver(self.driver.id)
    }
}

/// Everything a service-level test needs.
pub struct Harness {
    pub cast: Cast,
    pub store: Arc<InMemoryStore>,
    pub sink: Arc<RecordingSink>,
    pub service: LifecycleService,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(InMemoryStore::new())
    }

    pub fn with_store(store: InMemoryStore) -> Self {
        Self::with_engine(LifecycleEngine::new(), store)
    }

    pub fn with_engine(engine: LifecycleEngine, store: InMemoryStore) -> Self {
        let store = Arc::new(store);
        Self {
            cast: Cast::new(),
            service: LifecycleService::with_engine(engine, store.clone()),
            sink: Arc::new(RecordingSink::new()),
            store,
        }
    }

    /// A relay delivering this harness's outbox into its sink.
    pub fn relay(&self) -> Relay {
        Relay::new(self.store.clone(), self.sink.clone(), self.sink.clone()).with_config(
            RelayConfig {
                worker_id: "test-relay".to_string(),
                ..RelayConfig::default()
            },
        )
    }
}

/// Unwrap an accepted outcome, panicking with the rejection otherwise.
#[track_caller]
pub fn assert_accepted<E: Lifecycle>(outcome: &Outcome<E>) -> &Accepted<E> {
    match outcome {
        Outcome::Accepted(accepted) => accepted,
        Outcome::Rejected(rejection) => panic!("expected acceptance, got rejection: {rejection}"),
    }
}

/// Unwrap a rejection and check its reason.
#[track_caller]
pub fn assert_rejected<E: Lifecycle>(outcome: &Outcome<E>, reason: RejectionReason) -> &Rejection {
    match outcome {
        Outcome::Rejected(rejection) => {
            assert_eq!(rejection.reason(), reason, "wrong rejection: {rejection}");
            rejection
        }
        Outcome::Accepted(accepted) => panic!(
            "expected {} rejection, got {} -> {}",
            reason.as_str(),
            accepted.from,
            accepted.to
        ),
    }
}
