//! # Haulage
//!
//! Lifecycle engine for loads and trips: the machine decides, the store
//! commits, the relay delivers.
//!
//! ## Core Concepts
//!
//! Haulage separates **decisions** from **IO**:
//! - [`Machine`] = Decision (pure: snapshot + proposal → outcome)
//! - [`LifecycleStore`] = Authority (one atomic, revision-checked commit)
//! - [`Relay`] = Delivery (outbox → notification and financial collaborators)
//!
//! The key principle: **One Transition = One Commit**. The new status, the
//! history entry and the outbox records land together or not at all.
//!
//! ## Architecture
//!
//! ```text
//! Edge (server action / API route / driver app)
//!     │
//!     ▼ transition_load() / transition_trip()
//! LifecycleService
//!     │
//!     ├─► store.fetch_*()            snapshot + revision
//!     │
//!     ├─► LifecycleEngine            pure, no IO
//!     │       │
//!     │       ├─► Rejected(reason) ──────────────► caller
//!     │       │
//!     │       └─► Accepted{next, side_effects}
//!     │
//!     └─► store.commit_*()           CAS on revision
//!             │                      status + history + outbox
//!             ├─► ConcurrentModification ────────► caller
//!             └─► committed
//!
//! Relay.run() ──► outbox.claim_ready() ──► NotificationSink / RecalculationSink
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Machines are pure** - No IO, no async, no state between calls
//! 2. **Rejections are values** - Only malformed snapshots return `Err`
//! 3. **Terminal is terminal** - `deleted`, `completed` and `cancelled` refuse
//!    further edges (a cancelled load may still be soft-deleted)
//! 4. **Commits are conditional** - A stale revision writes nothing
//! 5. **Delivery never rolls back** - Failed notifications retry from the
//!    outbox; the committed status stands
//!
//! ## Example
//!
//! ```ignore
//! use haulage::{Actor, LifecycleService, Outcome, Proposal, TripEvidence, TripStatus};
//!
//! let service = LifecycleService::new(store.clone());
//!
//! let proposal = Proposal::new(TripStatus::Active, Actor::driver(driver_id))
//!     .with_evidence(TripEvidence::start(104_233, "s3://odo/start.jpg"));
//!
//! match service.transition_trip(trip_id, proposal).await? {
//!     Outcome::Accepted(accepted) => println!("trip is {}", accepted.new_status()),
//!     Outcome::Rejected(rejection) => println!("{}", rejection.user_message()),
//! }
//! ```
//!
//! ## What This Is Not
//!
//! Haulage does not render pages, authenticate users, store photos, send
//! email, or compute settlements. Those are collaborators; it only tells
//! them what must happen.

#[macro_use]
mod status_macro;

// Core modules
mod core;
mod effects;
mod engine;
mod error;
mod load;
mod machine;
mod policy;
mod relay;
mod service;
mod store;
mod trip;

// Outbox interfaces (policy-light)
pub mod outbox;

// Snapshot builders (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;



// Re-export core types
pub use crate::core::{
    Accessorial, Actor, Edge, EntityKind, EntityRef, EntityStatus, Field, LoadSource, Location,
    Revision, Role,
};

// Re-export machine types
pub use machine::{Accepted, Lifecycle, Machine, Outcome, Proposal, TripGuard};

// Re-export entity types
pub use load::{Load, LoadContext, LoadEdge, LoadEvidence, LoadMachine, LoadStatus, TripView};
pub use trip::{Trip, TripEdge, TripEvidence, TripMachine, TripStatus};

// Re-export policy
pub use policy::Policy;

// Re-export side-effect types
pub use effects::{
    Effect, NotificationEvent, NotificationTrigger, RecalculationTrigger, Recipient,
    SideEffects, StatusHistoryEntry,
};

// Re-export error types
pub use crate::error::{
    Categorizable, LifecycleError, ParseStatusError, Rejection, RejectionCategory,
    RejectionReason,
};

// Re-export engine types (primary entry point for pure decisions)
pub use engine::{propose_load_transition, propose_trip_transition, EngineBuilder, LifecycleEngine};

// Re-export outbox types
pub use outbox::{
    retry_delay, ClaimedMessage, DeliveryError, FailureKind, NotificationSink, OutboxMessage,
    OutboxStore, RecalculationSink, DEFAULT_MAX_ATTEMPTS,
};

// Re-export store and service types
pub use relay::{Relay, RelayConfig, RelayReport};
pub use service::{LifecycleService, ServiceError};
pub use store::{LifecycleStore, StoreError};

// Re-export commonly used external types
pub use async_trait::async_trait;
