//! Inbound command processor
//!
//! Turns one message received on a session's command topics into a
//! field-level store update, or discards it. Discarded commands produce no
//! reply on the bus. Accepted updates are never republished from here: the
//! store notifies the outbound publisher, which publishes the canonical
//! topic.

use crate::error::{Result, SyncError};
use crate::events::{BusMessage, EntityKind};
use crate::store::models::*;
use crate::store::traits::EntityStore;
use crate::sync::permissions::PermissionResolver;
use crate::sync::topics::{self, CommandTarget, Patch, Topic};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of handling one inbound command
#[derive(Debug)]
pub enum CommandOutcome {
    Applied { kind: EntityKind, id: String },
    Discarded(SyncError),
}

impl CommandOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Applies commands on behalf of one authenticated principal
#[derive(Clone)]
pub struct CommandProcessor {
    principal: Principal,
    store: Arc<dyn EntityStore>,
    permissions: PermissionResolver,
}

impl CommandProcessor {
    pub fn new(
        principal: Principal,
        store: Arc<dyn EntityStore>,
        permissions: PermissionResolver,
    ) -> Self {
        Self {
            principal,
            store,
            permissions,
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn handle(&self, message: &BusMessage) -> CommandOutcome {
        match self.apply(message) {
            Ok((kind, id)) => {
                debug!(
                    username = %self.principal.username,
                    topic = %message.topic,
                    "Command applied"
                );
                CommandOutcome::Applied { kind, id }
            }
            Err(e) => {
                warn!(
                    username = %self.principal.username,
                    topic = %message.topic,
                    "Command discarded: {}",
                    e
                );
                CommandOutcome::Discarded(e)
            }
        }
    }

    fn apply(&self, message: &BusMessage) -> Result<(EntityKind, String)> {
        let (username, target) = match Topic::parse(&message.topic)? {
            Topic::Command { username, target } => (username, target),
            _ => return Err(SyncError::InvalidTopic(message.topic.clone())),
        };

        if username != self.principal.username {
            return Err(SyncError::AuthorizationDenied {
                username: self.principal.username.clone(),
                action: "command",
                kind: target.kind(),
                id: format!("user/{}", username),
            });
        }

        match &target {
            CommandTarget::Ambulance(id) => {
                self.permissions.authorize_write_ambulance(&self.principal, *id)?
            }
            CommandTarget::Hospital(id)
            | CommandTarget::HospitalEquipment {
                hospital_id: id, ..
            } => self.permissions.authorize_write_hospital(&self.principal, *id)?,
        }

        let patch = topics::decode(target.kind(), &message.payload)?;
        let actor = self.principal.username.as_str();

        match (target, patch) {
            (CommandTarget::Ambulance(id), Patch::Ambulance(patch)) => {
                self.store.update_ambulance(id, &patch, actor)?;
                Ok((EntityKind::Ambulance, id.to_string()))
            }
            (CommandTarget::Hospital(id), Patch::Hospital(patch)) => {
                self.store.update_hospital(id, &patch, actor)?;
                Ok((EntityKind::Hospital, id.to_string()))
            }
            (
                CommandTarget::HospitalEquipment {
                    hospital_id,
                    equipment,
                },
                Patch::HospitalEquipment(patch),
            ) => {
                let equipment_id = self.equipment_by_name(hospital_id, &equipment)?;
                self.store
                    .update_hospital_equipment(hospital_id, equipment_id, &patch, actor)?;
                Ok((
                    EntityKind::HospitalEquipment,
                    format!("{}:{}", hospital_id, equipment_id),
                ))
            }
            (target, _) => Err(SyncError::decode(target.kind(), "payload does not match target")),
        }
    }

    /// Catalog id of the equipment named `name` within a hospital
    fn equipment_by_name(&self, hospital_id: HospitalId, name: &str) -> Result<EquipmentId> {
        for item in self.store.hospital_equipment(hospital_id)? {
            if let Some(equipment) = self.store.get_equipment(item.equipment_id)? {
                if equipment.name == name {
                    return Ok(equipment.id);
                }
            }
        }
        Err(SyncError::not_found(
            EntityKind::HospitalEquipment,
            format!("{}:{}", hospital_id, name),
        ))
    }
}
