//! Engine: the primary entry point for pure lifecycle decisions.

use chrono::{DateTime, Utc};

use crate::core::Actor;
use crate::error::LifecycleError;
use crate::load::{Load, LoadContext, LoadEvidence, LoadMachine, LoadStatus};
use crate::machine::{Machine, Outcome, Proposal};
use crate::policy::Policy;
use crate::trip::{Trip, TripEvidence, TripMachine, TripStatus};

/// Both state machines under one policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LifecycleEngine {
    policy: Policy,
    loads: LoadMachine,
    trips: TripMachine,
}

impl LifecycleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn with_policy(policy: Policy) -> Self {
        Self {
            policy,
            loads: LoadMachine::new(policy),
            trips: TripMachine::new(policy),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Decide a load transition. `trip` must be the load's owning trip when
    /// it has one and the edge depends on it (pickup, delivery).
    pub fn propose_load(
        &self,
        load: &Load,
        proposal: &Proposal<Load>,
        trip: Option<&Trip>,
    ) -> Result<Outcome<Load>, LifecycleError> {
        self.loads
            .decide(load, proposal, &LoadContext::with_trip(trip))
    }

    pub fn propose_trip(
        &self,
        trip: &Trip,
        proposal: &Proposal<Trip>,
    ) -> Result<Outcome<Trip>, LifecycleError> {
        self.trips.decide(trip, proposal, &())
    }

    pub fn plan_load_on_trip(
        &self,
        load: &Load,
        trip: &Trip,
        actor: &Actor,
        at: DateTime<Utc>,
        note: Option<&str>,
    ) -> Result<Outcome<Load>, LifecycleError> {
        self.loads.plan_on_trip(load, trip, actor, at, note)
    }
}

/// Builder for [`LifecycleEngine`], starting from the strict default policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineBuilder {
    policy: Policy,
}

impl EngineBuilder {
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn require_pickup_photo(mut self, required: bool) -> Self {
        self.policy.require_pickup_photo = required;
        self
    }

    pub fn require_delivery_photo(mut self, required: bool) -> Self {
        self.policy.require_delivery_photo = required;
        self
    }

    pub fn driver_must_be_assigned(mut self, required: bool) -> Self {
        self.policy.driver_must_be_assigned = required;
        self
    }

    pub fn owner_must_own(mut self, required: bool) -> Self {
        self.policy.owner_must_own = required;
        self
    }

    pub fn build(self) -> LifecycleEngine {
        LifecycleEngine::with_policy(self.policy)
    }
}

/// Decide a load transition with the default policy, stamped now.
///
/// Shorthand for callers that have no trip context and no note.
pub fn propose_load_transition(
    load: &Load,
    target: LoadStatus,
    actor: &Actor,
    evidence: LoadEvidence,
) -> Result<Outcome<Load>, LifecycleError> {
    let proposal = Proposal::new(target, actor.clone()).with_evidence(evidence);
    LifecycleEngine::default().propose_load(load, &proposal, None)
}

/// Decide a trip transition with the default policy, stamped now.
pub fn propose_trip_transition(
    trip: &Trip,
    target: TripStatus,
    actor: &Actor,
    evidence: TripEvidence,
) -> Result<Outcome<Trip>, LifecycleError> {
    let proposal = Proposal::new(target, actor.clone()).with_evidence(evidence);
    LifecycleEngine::default().propose_trip(trip, &proposal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoadBuilder;
    use uuid::Uuid;

    #[test]
    fn builder_relaxes_only_what_it_is_told() {
        let engine = LifecycleEngine::builder()
            .require_delivery_photo(false)
            .build();
        assert!(!engine.policy().require_delivery_photo);
        assert!(engine.policy().require_pickup_photo);
        assert!(engine.policy().owner_must_own);
    }

    #[test]
    fn relaxed_ownership_lets_any_owner_publish() {
        let load = LoadBuilder::new().build();
        let stranger = Actor::owner(Uuid::new_v4());
        let proposal = Proposal::new(LoadStatus::Posted, stranger);

        let strict = LifecycleEngine::new().propose_load(&load, &proposal, None).unwrap();
        assert!(!strict.is_accepted());

        let relaxed = LifecycleEngine::builder()
            .owner_must_own(false)
            .build()
            .propose_load(&load, &proposal, None)
            .unwrap();
        assert!(relaxed.is_accepted());
    }
}
