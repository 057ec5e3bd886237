//! Who may take which edge.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{Actor, Role};

/// Tunable rules applied by the machines.
///
/// Every flag defaults to the strict setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Pickup needs a bill-of-lading photo reference.
    pub require_pickup_photo: bool,
    /// Delivery needs a proof-of-delivery photo reference.
    pub require_delivery_photo: bool,
    /// Driver edges are only open to the driver assigned to the entity.
    pub driver_must_be_assigned: bool,
    /// Owner edges are only open to the owner of record.
    pub owner_must_own: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            require_pickup_photo: true,
            require_delivery_photo: true,
            driver_must_be_assigned: true,
            owner_must_own: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    /// Anyone holding the role.
    Anyone,
    /// The role holder must be the entity's owner of record.
    OwnerOfRecord,
    /// The role holder must be the entity's assigned driver.
    AssignedDriver,
}

/// One role allowed on an edge, and how far that permission reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Grant {
    pub role: Role,
    pub scope: Scope,
}

impl Grant {
    pub const fn owner() -> Self {
        Self {
            role: Role::Owner,
            scope: Scope::OwnerOfRecord,
        }
    }

    pub const fn driver() -> Self {
        Self {
            role: Role::Driver,
            scope: Scope::AssignedDriver,
        }
    }

    pub const fn any(role: Role) -> Self {
        Self {
            role,
            scope: Scope::Anyone,
        }
    }
}

/// Parties the scopes are checked against.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Parties {
    pub owner_id: Uuid,
    pub driver_id: Option<Uuid>,
}

impl Policy {
    /// Returns the first granted role the actor can use, in grant order.
    pub(crate) fn authorize(&self, actor: &Actor, grants: &[Grant], parties: Parties) -> Option<Role> {
        grants
            .iter()
            .find(|grant| actor.has_role(grant.role) && self.in_scope(actor, grant.scope, parties))
            .map(|grant| grant.role)
    }

    fn in_scope(&self, actor: &Actor, scope: Scope, parties: Parties) -> bool {
        match scope {
            Scope::Anyone => true,
            Scope::OwnerOfRecord => !self.owner_must_own || parties.owner_id == actor.id,
            Scope::AssignedDriver => {
                !self.driver_must_be_assigned || parties.driver_id == Some(actor.id)
            }
        }
    }
}
