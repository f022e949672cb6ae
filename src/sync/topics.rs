//! Topic codec
//!
//! Maps entity references to canonical topic strings, entity values to
//! payloads, and inbound command payloads back to partial updates.
//!
//! Topic shapes:
//! - `ambulance/{id}/data`
//! - `hospital/{id}/data`, `hospital/{id}/metadata`
//! - `hospital/{id}/equipment/{name}/data`
//! - `user/{username}/profile`
//! - commands: `user/{username}/ambulance/{id}/data`,
//!   `user/{username}/hospital/{id}/data`,
//!   `user/{username}/hospital/{id}/equipment/{name}/data`
//!
//! Entity topics are keyed by identifier, never by mutable names. The only
//! name segment is the equipment name, which is a catalog key.

use crate::error::{Result, SyncError};
use crate::events::EntityKind;
use crate::store::models::*;
use serde::Serialize;
use std::fmt;

/// Target of an inbound command
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandTarget {
    Ambulance(AmbulanceId),
    Hospital(HospitalId),
    HospitalEquipment {
        hospital_id: HospitalId,
        equipment: String,
    },
}

impl CommandTarget {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Ambulance(_) => EntityKind::Ambulance,
            Self::Hospital(_) => EntityKind::Hospital,
            Self::HospitalEquipment { .. } => EntityKind::HospitalEquipment,
        }
    }
}

/// A parsed topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    AmbulanceData(AmbulanceId),
    HospitalData(HospitalId),
    HospitalMetadata(HospitalId),
    HospitalEquipmentData {
        hospital_id: HospitalId,
        equipment: String,
    },
    UserProfile(String),
    Command {
        username: String,
        target: CommandTarget,
    },
}

impl Topic {
    pub fn ambulance(id: AmbulanceId) -> Self {
        Self::AmbulanceData(id)
    }

    pub fn hospital(id: HospitalId) -> Self {
        Self::HospitalData(id)
    }

    pub fn hospital_metadata(id: HospitalId) -> Self {
        Self::HospitalMetadata(id)
    }

    pub fn hospital_equipment(hospital_id: HospitalId, equipment: impl Into<String>) -> Self {
        Self::HospitalEquipmentData {
            hospital_id,
            equipment: equipment.into(),
        }
    }

    pub fn profile(username: impl Into<String>) -> Self {
        Self::UserProfile(username.into())
    }

    pub fn command(username: impl Into<String>, target: CommandTarget) -> Self {
        Self::Command {
            username: username.into(),
            target,
        }
    }

    /// Parse a topic string into one of the recognized shapes
    pub fn parse(topic: &str) -> Result<Self> {
        let invalid = || SyncError::InvalidTopic(topic.to_string());
        let id = |s: &str| s.parse::<u64>().map_err(|_| invalid());
        let segments: Vec<&str> = topic.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid());
        }

        match segments.as_slice() {
            ["ambulance", a, "data"] => Ok(Self::AmbulanceData(id(a)?)),
            ["hospital", h, "data"] => Ok(Self::HospitalData(id(h)?)),
            ["hospital", h, "metadata"] => Ok(Self::HospitalMetadata(id(h)?)),
            ["hospital", h, "equipment", name, "data"] => {
                Ok(Self::hospital_equipment(id(h)?, *name))
            }
            ["user", username, "profile"] => Ok(Self::UserProfile(username.to_string())),
            ["user", username, "ambulance", a, "data"] => Ok(Self::command(
                *username,
                CommandTarget::Ambulance(id(a)?),
            )),
            ["user", username, "hospital", h, "data"] => {
                Ok(Self::command(*username, CommandTarget::Hospital(id(h)?)))
            }
            ["user", username, "hospital", h, "equipment", name, "data"] => Ok(Self::command(
                *username,
                CommandTarget::HospitalEquipment {
                    hospital_id: id(h)?,
                    equipment: name.to_string(),
                },
            )),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AmbulanceData(id) => write!(f, "ambulance/{}/data", id),
            Self::HospitalData(id) => write!(f, "hospital/{}/data", id),
            Self::HospitalMetadata(id) => write!(f, "hospital/{}/metadata", id),
            Self::HospitalEquipmentData {
                hospital_id,
                equipment,
            } => write!(f, "hospital/{}/equipment/{}/data", hospital_id, equipment),
            Self::UserProfile(username) => write!(f, "user/{}/profile", username),
            Self::Command { username, target } => match target {
                CommandTarget::Ambulance(id) => write!(f, "user/{}/ambulance/{}/data", username, id),
                CommandTarget::Hospital(id) => write!(f, "user/{}/hospital/{}/data", username, id),
                CommandTarget::HospitalEquipment {
                    hospital_id,
                    equipment,
                } => write!(
                    f,
                    "user/{}/hospital/{}/equipment/{}/data",
                    username, hospital_id, equipment
                ),
            },
        }
    }
}

/// Subscription filters covering every command topic of `username`
pub fn command_filters(username: &str) -> Vec<String> {
    vec![
        format!("user/{}/ambulance/+/data", username),
        format!("user/{}/hospital/+/data", username),
        format!("user/{}/hospital/+/equipment/+/data", username),
    ]
}

/// MQTT-style filter matching: `+` matches one level, a trailing `#` matches
/// the remaining levels (including none).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ============================================================================
// Payload encoding
// ============================================================================

#[derive(Serialize)]
struct HospitalEquipmentPayload<'a> {
    hospital_id: HospitalId,
    equipment_id: EquipmentId,
    equipment_name: &'a str,
    equipment_etype: EquipmentType,
    value: &'a str,
    comment: &'a str,
    updated_by: &'a str,
    updated_on: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
struct ProfilePayload<'a> {
    ambulances: &'a [AmbulanceGrant],
    hospitals: &'a [HospitalGrant],
}

fn to_payload<T: Serialize + ?Sized>(kind: EntityKind, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| SyncError::Encode {
        kind,
        reason: e.to_string(),
    })
}

pub fn encode_ambulance(ambulance: &Ambulance) -> Result<Vec<u8>> {
    to_payload(EntityKind::Ambulance, ambulance)
}

pub fn encode_hospital(hospital: &Hospital) -> Result<Vec<u8>> {
    to_payload(EntityKind::Hospital, hospital)
}

/// Encode the equipment catalog subset of a hospital (an array, sorted by id)
pub fn encode_metadata(equipment: &[Equipment]) -> Result<Vec<u8>> {
    let mut sorted: Vec<&Equipment> = equipment.iter().collect();
    sorted.sort_by_key(|e| e.id);
    to_payload(EntityKind::Equipment, &sorted)
}

pub fn encode_hospital_equipment(item: &HospitalEquipment, equipment: &Equipment) -> Result<Vec<u8>> {
    let payload = HospitalEquipmentPayload {
        hospital_id: item.hospital_id,
        equipment_id: item.equipment_id,
        equipment_name: &equipment.name,
        equipment_etype: equipment.etype,
        value: &item.value,
        comment: &item.comment,
        updated_by: &item.updated_by,
        updated_on: item.updated_on,
    };
    to_payload(EntityKind::HospitalEquipment, &payload)
}

pub fn encode_profile(profile: &Profile) -> Result<Vec<u8>> {
    let payload = ProfilePayload {
        ambulances: &profile.ambulances,
        hospitals: &profile.hospitals,
    };
    to_payload(EntityKind::Profile, &payload)
}

// ============================================================================
// Inbound decoding
// ============================================================================

/// Partial update decoded from a command payload
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    Ambulance(AmbulancePatch),
    Hospital(HospitalPatch),
    HospitalEquipment(HospitalEquipmentPatch),
}

/// Decode a command payload for `kind` into a partial update.
///
/// The payload must be a JSON object holding only writable fields of the
/// target kind, and at least one of them.
pub fn decode(kind: EntityKind, payload: &[u8]) -> Result<Patch> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| SyncError::decode(kind, e))?;
    if !value.is_object() {
        return Err(SyncError::decode(kind, "payload is not a JSON object"));
    }

    let patch = match kind {
        EntityKind::Ambulance => {
            let patch: AmbulancePatch =
                serde_json::from_value(value).map_err(|e| SyncError::decode(kind, e))?;
            if let Some(orientation) = patch.orientation {
                if !orientation.is_finite() {
                    return Err(SyncError::decode(kind, "orientation is not finite"));
                }
            }
            (!patch.is_empty()).then_some(Patch::Ambulance(patch))
        }
        EntityKind::Hospital => {
            let patch: HospitalPatch =
                serde_json::from_value(value).map_err(|e| SyncError::decode(kind, e))?;
            (!patch.is_empty()).then_some(Patch::Hospital(patch))
        }
        EntityKind::HospitalEquipment => {
            let patch: HospitalEquipmentPatch =
                serde_json::from_value(value).map_err(|e| SyncError::decode(kind, e))?;
            (!patch.is_empty()).then_some(Patch::HospitalEquipment(patch))
        }
        other => {
            return Err(SyncError::decode(other, "kind does not accept commands"));
        }
    };

    patch.ok_or_else(|| SyncError::decode(kind, "payload carries no writable field"))
}
