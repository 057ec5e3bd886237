//! Shared vocabulary: entity references, revisions, actors, edges and fields.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use uuid::Uuid;

use crate::load::{LoadEdge, LoadStatus};
use crate::trip::{TripEdge, TripStatus};

/// Optimistic-concurrency version of a stored entity.
///
/// Every accepted transition targets `revision.next()`; the store applies it
/// only while the stored revision still equals the one that was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub i64);

impl Revision {
    /// Revision of a freshly created entity.
    pub const INITIAL: Revision = Revision(1);

    pub const fn next(self) -> Revision {
        Revision(self.0 + 1)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl Default for Revision {
    fn default() -> Self {
        Revision::INITIAL
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Load,
    Trip,
}

impl EntityKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityKind::Load => "load",
            EntityKind::Trip => "trip",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed pointer to a load or a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl EntityRef {
    pub const fn load(id: Uuid) -> Self {
        Self {
            kind: EntityKind::Load,
            id,
        }
    }

    pub const fn trip(id: Uuid) -> Self {
        Self {
            kind: EntityKind::Trip,
            id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// A status of either entity, used where loads and trips share a channel
/// (history entries, rejections, storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "entity", content = "status", rename_all = "snake_case")]
pub enum EntityStatus {
    Load(LoadStatus),
    Trip(TripStatus),
}

impl EntityStatus {
    pub const fn kind(self) -> EntityKind {
        match self {
            EntityStatus::Load(_) => EntityKind::Load,
            EntityStatus::Trip(_) => EntityKind::Trip,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            EntityStatus::Load(status) => status.as_str(),
            EntityStatus::Trip(status) => status.as_str(),
        }
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<LoadStatus> for EntityStatus {
    fn from(status: LoadStatus) -> Self {
        EntityStatus::Load(status)
    }
}

impl From<TripStatus> for EntityStatus {
    fn from(status: TripStatus) -> Self {
        EntityStatus::Trip(status)
    }
}

/// Named lifecycle edge. Rejections and history entries carry it so callers
/// can phrase messages without re-deriving what was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Load(LoadEdge),
    Trip(TripEdge),
    /// Attaching an assigned load to a trip. Not a status change.
    PlanOnTrip,
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Load(edge) => write!(f, "load.{}", edge.as_str()),
            Edge::Trip(edge) => write!(f, "trip.{}", edge.as_str()),
            Edge::PlanOnTrip => f.write_str("load.plan_on_trip"),
        }
    }
}

/// Snapshot or evidence field named by a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    OdometerStart,
    OdometerStartPhoto,
    OdometerEnd,
    OdometerEndPhoto,
    DriverId,
    PickupPhoto,
    DeliveryPhoto,
    TripId,
    Status,
}

impl Field {
    pub const fn as_str(self) -> &'static str {
        match self {
            Field::OdometerStart => "odometer_start",
            Field::OdometerStartPhoto => "odometer_start_photo",
            Field::OdometerEnd => "odometer_end",
            Field::OdometerEndPhoto => "odometer_end_photo",
            Field::DriverId => "driver_id",
            Field::PickupPhoto => "pickup_photo",
            Field::DeliveryPhoto => "delivery_photo",
            Field::TripId => "trip_id",
            Field::Status => "status",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Company,
    Driver,
    Carrier,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Company => "company",
            Role::Driver => "driver",
            Role::Carrier => "carrier",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The acting user, as resolved by the identity provider.
///
/// The engine never looks roles up itself; whatever the caller supplies is
/// what gets checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Uuid,
    pub roles: SmallVec<[Role; 2]>,
}

impl Actor {
    pub fn new(id: Uuid, roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            id,
            roles: roles.into_iter().collect(),
        }
    }

    pub fn owner(id: Uuid) -> Self {
        Self::new(id, [Role::Owner])
    }

    pub fn driver(id: Uuid) -> Self {
        Self::new(id, [Role::Driver])
    }

    pub fn company(id: Uuid) -> Self {
        Self::new(id, [Role::Company])
    }

    pub fn carrier(id: Uuid) -> Self {
        Self::new(id, [Role::Carrier])
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

/// Pickup or delivery point.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub label: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Location {
    pub fn named(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            latitude: None,
            longitude: None,
        }
    }

    pub fn at(label: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            label: label.into(),
            latitude: Some(latitude),
            longitude: Some(longitude),
        }
    }
}

/// Extra charge billed on top of a load's line-haul rate (detention, lumper...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accessorial {
    pub description: String,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    #[default]
    Internal,
    Marketplace,
}

impl LoadSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            LoadSource::Internal => "internal",
            LoadSource::Marketplace => "marketplace",
        }
    }
}

impl std::str::FromStr for LoadSource {
    type Err = crate::error::ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(LoadSource::Internal),
            "marketplace" => Ok(LoadSource::Marketplace),
            other => Err(crate::error::ParseStatusError::new("LoadSource", other)),
        }
    }
}

/// Photo reference supplied by the evidence collaborator. Blank strings count
/// as absent.
pub(crate) fn present(photo: Option<&str>) -> Option<&str> {
    photo.filter(|p| !p.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_advances_by_one() {
        assert_eq!(Revision::INITIAL.next(), Revision(2));
        assert_eq!(Revision::default(), Revision::INITIAL);
    }

    #[test]
    fn edge_display_names_entity_and_edge() {
        assert_eq!(Edge::Load(LoadEdge::Publish).to_string(), "load.publish");
        assert_eq!(Edge::Trip(TripEdge::Complete).to_string(), "trip.complete");
        assert_eq!(Edge::PlanOnTrip.to_string(), "load.plan_on_trip");
    }

    #[test]
    fn blank_photo_is_absent() {
        assert_eq!(present(Some("  ")), None);
        assert_eq!(present(Some("s3://odo.jpg")), Some("s3://odo.jpg"));
        assert_eq!(present(None), None);
    }

    #[test]
    fn entity_status_serializes_with_its_kind() {
        let json = serde_json::to_value(EntityStatus::Load(LoadStatus::InTransit)).unwrap();
        assert_eq!(json["entity"], "load");
        assert_eq!(json["status"], "in_transit");
    }
}
