//! Change notification and bus message types

use crate::store::models::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of entity a record or topic refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Ambulance,
    AmbulanceUpdate,
    Call,
    AmbulanceCallHistory,
    Hospital,
    Equipment,
    HospitalEquipment,
    Profile,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ambulance => "ambulance",
            Self::AmbulanceUpdate => "ambulance_update",
            Self::Call => "call",
            Self::AmbulanceCallHistory => "ambulance_call_history",
            Self::Hospital => "hospital",
            Self::Equipment => "equipment",
            Self::HospitalEquipment => "hospital_equipment",
            Self::Profile => "profile",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The write performed by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrudAction {
    Created,
    Updated,
    Deleted,
}

/// Committed value of a written record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Entity {
    Ambulance(Ambulance),
    AmbulanceUpdate(AmbulanceUpdate),
    Call(Call),
    AmbulanceCallHistory(AmbulanceCallHistory),
    Hospital(Hospital),
    Equipment(Equipment),
    HospitalEquipment(HospitalEquipment),
    Profile(Profile),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Ambulance(_) => EntityKind::Ambulance,
            Self::AmbulanceUpdate(_) => EntityKind::AmbulanceUpdate,
            Self::Call(_) => EntityKind::Call,
            Self::AmbulanceCallHistory(_) => EntityKind::AmbulanceCallHistory,
            Self::Hospital(_) => EntityKind::Hospital,
            Self::Equipment(_) => EntityKind::Equipment,
            Self::HospitalEquipment(_) => EntityKind::HospitalEquipment,
            Self::Profile(_) => EntityKind::Profile,
        }
    }

    /// Stable identity of the record, used in logs
    pub fn id(&self) -> String {
        match self {
            Self::Ambulance(a) => a.id.to_string(),
            Self::AmbulanceUpdate(u) => format!("{}@{}", u.ambulance_id, u.timestamp.to_rfc3339()),
            Self::Call(c) => c.id.to_string(),
            Self::AmbulanceCallHistory(h) => format!("{}:{}", h.ambulance_id, h.call_id),
            Self::Hospital(h) => h.id.to_string(),
            Self::Equipment(e) => e.id.to_string(),
            Self::HospitalEquipment(he) => format!("{}:{}", he.hospital_id, he.equipment_id),
            Self::Profile(p) => p.username.clone(),
        }
    }
}

/// Notification fired by the store after each committed write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub action: CrudAction,
    pub entity: Entity,
    /// Value replaced by an update, when the store records it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Entity>,
    /// Catalog entry a hospital equipment row referred to at commit time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equipment: Option<Equipment>,
    pub committed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(action: CrudAction, entity: Entity) -> Self {
        Self {
            action,
            entity,
            previous: None,
            equipment: None,
            committed_at: Utc::now(),
        }
    }

    pub fn with_previous(mut self, previous: Entity) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn with_equipment(mut self, equipment: Equipment) -> Self {
        self.equipment = Some(equipment);
        self
    }

    pub fn created(entity: Entity) -> Self {
        Self::new(CrudAction::Created, entity)
    }

    pub fn updated(entity: Entity) -> Self {
        Self::new(CrudAction::Updated, entity)
    }

    pub fn deleted(entity: Entity) -> Self {
        Self::new(CrudAction::Deleted, entity)
    }

    pub fn kind(&self) -> EntityKind {
        self.entity.kind()
    }
}

/// Delivery guarantee requested for a publication
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(format!("invalid QoS level {} (expected 0, 1 or 2)", other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// A message as seen on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retained: bool,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS, retained: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retained,
        }
    }

    /// Empty retained payload: clears the retained value of the topic
    pub fn is_clear(&self) -> bool {
        self.retained && self.payload.is_empty()
    }
}
