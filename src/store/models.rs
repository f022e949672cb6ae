//! Entity records owned by the store
//!
//! The serde shape of each record is also its canonical external
//! representation on the bus (see `sync::topics`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type AmbulanceId = u64;
pub type HospitalId = u64;
pub type EquipmentId = u64;
pub type CallId = u64;

// ============================================================================
// Ambulances
// ============================================================================

/// Operational status, serialized by name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AmbulanceStatus {
    #[default]
    Unknown,
    OutOfService,
    Available,
    EnRoute,
    AtScene,
    HospitalBound,
    AtHospital,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AmbulanceCapability {
    #[default]
    Basic,
    Advanced,
    Rescue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ambulance {
    pub id: AmbulanceId,
    pub identifier: String,
    #[serde(default)]
    pub status: AmbulanceStatus,
    #[serde(default)]
    pub orientation: f64,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub capability: AmbulanceCapability,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub updated_by: String,
    #[serde(default)]
    pub updated_on: DateTime<Utc>,
}

impl Ambulance {
    pub fn new(id: AmbulanceId, identifier: impl Into<String>) -> Self {
        Self {
            id,
            identifier: identifier.into(),
            status: AmbulanceStatus::default(),
            orientation: 0.0,
            location: Location::default(),
            capability: AmbulanceCapability::default(),
            comment: String::new(),
            updated_by: String::new(),
            updated_on: DateTime::<Utc>::default(),
        }
    }
}

/// Field-level partial update of an ambulance.
///
/// Absent fields are left untouched. Identity fields (`id`, `identifier`)
/// are not writable through a patch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AmbulancePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AmbulanceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<AmbulanceCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl AmbulancePatch {
    pub fn status(status: AmbulanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply(&self, ambulance: &mut Ambulance) {
        if let Some(status) = self.status {
            ambulance.status = status;
        }
        if let Some(orientation) = self.orientation {
            ambulance.orientation = orientation;
        }
        if let Some(location) = self.location {
            ambulance.location = location;
        }
        if let Some(capability) = self.capability {
            ambulance.capability = capability;
        }
        if let Some(comment) = &self.comment {
            ambulance.comment = comment.clone();
        }
    }
}

/// Immutable snapshot of an ambulance's mutable fields, appended on every save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbulanceUpdate {
    pub ambulance_id: AmbulanceId,
    pub status: AmbulanceStatus,
    pub orientation: f64,
    pub location: Location,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub updated_by: String,
    pub timestamp: DateTime<Utc>,
}

impl AmbulanceUpdate {
    pub fn snapshot(ambulance: &Ambulance) -> Self {
        Self {
            ambulance_id: ambulance.id,
            status: ambulance.status,
            orientation: ambulance.orientation,
            location: ambulance.location,
            comment: ambulance.comment.clone(),
            updated_by: ambulance.updated_by.clone(),
            timestamp: ambulance.updated_on,
        }
    }
}

// ============================================================================
// Calls
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub id: CallId,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Call {
    /// Check `ended_at => started_at` and `started_at <= ended_at`
    pub fn validate(&self) -> Result<(), String> {
        match (self.started_at, self.ended_at) {
            (None, Some(_)) => Err("ended_at is set but started_at is not".into()),
            (Some(start), Some(end)) if start > end => {
                Err(format!("started_at {} is after ended_at {}", start, end))
            }
            _ => Ok(()),
        }
    }
}

/// Assignment phase recorded for an ambulance on a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Ongoing,
    Suspended,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHistoryEntry {
    pub phase: CallPhase,
    pub timestamp: DateTime<Utc>,
}

/// Phase transitions of one ambulance on one call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbulanceCallHistory {
    pub ambulance_id: AmbulanceId,
    pub call_id: CallId,
    #[serde(default)]
    pub entries: Vec<CallHistoryEntry>,
}

// ============================================================================
// Hospitals and equipment
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hospital {
    pub id: HospitalId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub updated_by: String,
    #[serde(default)]
    pub updated_on: DateTime<Utc>,
}

impl Hospital {
    pub fn new(id: HospitalId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            address: String::new(),
            comment: String::new(),
            updated_by: String::new(),
            updated_on: DateTime::<Utc>::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HospitalPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl HospitalPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply(&self, hospital: &mut Hospital) {
        if let Some(name) = &self.name {
            hospital.name = name.clone();
        }
        if let Some(address) = &self.address {
            hospital.address = address.clone();
        }
        if let Some(comment) = &self.comment {
            hospital.comment = comment.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EquipmentType {
    #[default]
    Boolean,
    Integer,
    String,
}

/// Catalog entry, shared by every hospital that carries it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equipment {
    pub id: EquipmentId,
    pub name: String,
    #[serde(default)]
    pub etype: EquipmentType,
}

/// Value of one catalog entry at one hospital; unique per (hospital, equipment)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HospitalEquipment {
    pub hospital_id: HospitalId,
    pub equipment_id: EquipmentId,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub updated_by: String,
    #[serde(default)]
    pub updated_on: DateTime<Utc>,
}

impl HospitalEquipment {
    pub fn new(hospital_id: HospitalId, equipment_id: EquipmentId, value: impl Into<String>) -> Self {
        Self {
            hospital_id,
            equipment_id,
            value: value.into(),
            comment: String::new(),
            updated_by: String::new(),
            updated_on: DateTime::<Utc>::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HospitalEquipmentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl HospitalEquipmentPatch {
    pub fn value(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            comment: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply(&self, item: &mut HospitalEquipment) {
        if let Some(value) = &self.value {
            item.value = value.clone();
        }
        if let Some(comment) = &self.comment {
            item.comment = comment.clone();
        }
    }
}

// ============================================================================
// Profiles and principals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbulanceGrant {
    pub ambulance_id: AmbulanceId,
    #[serde(default)]
    pub can_read: bool,
    #[serde(default)]
    pub can_write: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HospitalGrant {
    pub hospital_id: HospitalId,
    #[serde(default)]
    pub can_read: bool,
    #[serde(default)]
    pub can_write: bool,
}

/// Permission grants of one principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub username: String,
    #[serde(default)]
    pub ambulances: Vec<AmbulanceGrant>,
    #[serde(default)]
    pub hospitals: Vec<HospitalGrant>,
}

impl Profile {
    /// Profile with no grants (default-deny)
    pub fn empty(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ambulances: Vec::new(),
            hospitals: Vec::new(),
        }
    }
}

/// Authenticated actor, as established by the authentication layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub username: String,
    #[serde(default)]
    pub is_admin: bool,
}

impl Principal {
    pub fn user(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            is_admin: false,
        }
    }

    pub fn admin(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            is_admin: true,
        }
    }
}

// ============================================================================
// Fixture snapshot
// ============================================================================

/// Whole-store contents, used to load a `MemoryStore` from YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSnapshot {
    pub ambulances: Vec<Ambulance>,
    pub ambulance_updates: Vec<AmbulanceUpdate>,
    pub calls: Vec<Call>,
    pub call_histories: Vec<AmbulanceCallHistory>,
    pub hospitals: Vec<Hospital>,
    pub equipment: Vec<Equipment>,
    pub hospital_equipment: Vec<HospitalEquipment>,
    pub profiles: Vec<Profile>,
}
