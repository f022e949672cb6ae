//! In-memory implementation of EntityStore.
//!
//! All tables sit behind one `RwLock`; observers are notified while the
//! write lock is still held, so notifications reach observers in commit
//! order. Observers therefore must not call back into the store from
//! `on_change`.

use crate::error::{Result, SyncError};
use crate::events::{ChangeEvent, Entity, EntityKind};
use crate::store::models::*;
use crate::store::traits::{ChangeObserver, EntityStore};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct Tables {
    ambulances: BTreeMap<AmbulanceId, Ambulance>,
    ambulance_updates: BTreeMap<AmbulanceId, Vec<AmbulanceUpdate>>,
    calls: BTreeMap<CallId, Call>,
    call_histories: BTreeMap<(AmbulanceId, CallId), AmbulanceCallHistory>,
    hospitals: BTreeMap<HospitalId, Hospital>,
    equipment: BTreeMap<EquipmentId, Equipment>,
    hospital_equipment: BTreeMap<(HospitalId, EquipmentId), HospitalEquipment>,
    profiles: BTreeMap<String, Profile>,
}

/// In-memory entity store with synchronous change notification
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    observers: RwLock<Vec<Arc<dyn ChangeObserver>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store from a snapshot. No notifications are fired.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Result<Self> {
        let mut tables = Tables::default();

        for ambulance in snapshot.ambulances {
            tables.ambulances.insert(ambulance.id, ambulance);
        }
        for update in snapshot.ambulance_updates {
            if !tables.ambulances.contains_key(&update.ambulance_id) {
                return Err(SyncError::not_found(EntityKind::Ambulance, update.ambulance_id));
            }
            tables
                .ambulance_updates
                .entry(update.ambulance_id)
                .or_default()
                .push(update);
        }
        for call in snapshot.calls {
            call.validate().map_err(|reason| SyncError::InvalidCall {
                id: call.id,
                reason,
            })?;
            tables.calls.insert(call.id, call);
        }
        for history in snapshot.call_histories {
            tables
                .call_histories
                .insert((history.ambulance_id, history.call_id), history);
        }
        for hospital in snapshot.hospitals {
            tables.hospitals.insert(hospital.id, hospital);
        }
        for equipment in snapshot.equipment {
            tables.equipment.insert(equipment.id, equipment);
        }
        for item in snapshot.hospital_equipment {
            if !tables.hospitals.contains_key(&item.hospital_id) {
                return Err(SyncError::not_found(EntityKind::Hospital, item.hospital_id));
            }
            if !tables.equipment.contains_key(&item.equipment_id) {
                return Err(SyncError::not_found(EntityKind::Equipment, item.equipment_id));
            }
            tables
                .hospital_equipment
                .insert((item.hospital_id, item.equipment_id), item);
        }
        for profile in snapshot.profiles {
            tables.profiles.insert(profile.username.clone(), profile);
        }

        Ok(Self {
            tables: RwLock::new(tables),
            observers: RwLock::new(Vec::new()),
        })
    }

    /// Load a store from a YAML snapshot file
    pub fn from_yaml_file(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixtures {}", path.display()))?;
        let snapshot: StoreSnapshot = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse fixtures {}", path.display()))?;
        Ok(Self::from_snapshot(snapshot)?)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| SyncError::Store("store lock poisoned".into()))
    }

    /// Run a write under the table lock and notify observers before releasing it
    fn commit<T>(
        &self,
        write: impl FnOnce(&mut Tables) -> Result<(T, Vec<ChangeEvent>)>,
    ) -> Result<T> {
        let mut tables: RwLockWriteGuard<'_, Tables> = self
            .tables
            .write()
            .map_err(|_| SyncError::Store("store lock poisoned".into()))?;
        let (value, events) = write(&mut *tables)?;

        let observers = self
            .observers
            .read()
            .map_err(|_| SyncError::Store("observer lock poisoned".into()))?;
        for event in &events {
            for observer in observers.iter() {
                observer.on_change(event);
            }
        }
        drop(tables);
        Ok(value)
    }
}

fn write_ambulance(
    tables: &mut Tables,
    mut ambulance: Ambulance,
    actor: &str,
) -> (Ambulance, Vec<ChangeEvent>) {
    ambulance.updated_by = actor.to_string();
    ambulance.updated_on = Utc::now();

    let existed = tables
        .ambulances
        .insert(ambulance.id, ambulance.clone())
        .is_some();
    let update = AmbulanceUpdate::snapshot(&ambulance);
    tables
        .ambulance_updates
        .entry(ambulance.id)
        .or_default()
        .push(update.clone());

    let event = if existed {
        ChangeEvent::updated(Entity::Ambulance(ambulance.clone()))
    } else {
        ChangeEvent::created(Entity::Ambulance(ambulance.clone()))
    };
    (
        ambulance,
        vec![event, ChangeEvent::created(Entity::AmbulanceUpdate(update))],
    )
}

fn write_hospital(tables: &mut Tables, mut hospital: Hospital, actor: &str) -> (Hospital, Vec<ChangeEvent>) {
    hospital.updated_by = actor.to_string();
    hospital.updated_on = Utc::now();

    let existed = tables.hospitals.insert(hospital.id, hospital.clone()).is_some();
    let entity = Entity::Hospital(hospital.clone());
    let event = if existed {
        ChangeEvent::updated(entity)
    } else {
        ChangeEvent::created(entity)
    };
    (hospital, vec![event])
}

fn write_hospital_equipment(
    tables: &mut Tables,
    mut item: HospitalEquipment,
    actor: &str,
) -> Result<(HospitalEquipment, Vec<ChangeEvent>)> {
    if !tables.hospitals.contains_key(&item.hospital_id) {
        return Err(SyncError::not_found(EntityKind::Hospital, item.hospital_id));
    }
    let equipment = tables
        .equipment
        .get(&item.equipment_id)
        .cloned()
        .ok_or_else(|| SyncError::not_found(EntityKind::Equipment, item.equipment_id))?;
    item.updated_by = actor.to_string();
    item.updated_on = Utc::now();

    let existed = tables
        .hospital_equipment
        .insert((item.hospital_id, item.equipment_id), item.clone())
        .is_some();
    let entity = Entity::HospitalEquipment(item.clone());
    let event = if existed {
        ChangeEvent::updated(entity)
    } else {
        ChangeEvent::created(entity)
    };
    Ok((item, vec![event.with_equipment(equipment)]))
}

impl EntityStore for MemoryStore {
    fn get_ambulance(&self, id: AmbulanceId) -> Result<Option<Ambulance>> {
        Ok(self.read()?.ambulances.get(&id).cloned())
    }

    fn filter_ambulances(&self, predicate: &dyn Fn(&Ambulance) -> bool) -> Result<Vec<Ambulance>> {
        Ok(self
            .read()?
            .ambulances
            .values()
            .filter(|&a| predicate(a))
            .cloned()
            .collect())
    }

    fn save_ambulance(&self, ambulance: Ambulance, actor: &str) -> Result<Ambulance> {
        self.commit(|tables| Ok(write_ambulance(tables, ambulance, actor)))
    }

    fn update_ambulance(
        &self,
        id: AmbulanceId,
        patch: &AmbulancePatch,
        actor: &str,
    ) -> Result<Ambulance> {
        self.commit(|tables| {
            let mut ambulance = tables
                .ambulances
                .get(&id)
                .cloned()
                .ok_or_else(|| SyncError::not_found(EntityKind::Ambulance, id))?;
            patch.apply(&mut ambulance);
            Ok(write_ambulance(tables, ambulance, actor))
        })
    }

    fn ambulance_updates(&self, id: AmbulanceId) -> Result<Vec<AmbulanceUpdate>> {
        Ok(self
            .read()?
            .ambulance_updates
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    fn get_call(&self, id: CallId) -> Result<Option<Call>> {
        Ok(self.read()?.calls.get(&id).cloned())
    }

    fn save_call(&self, call: Call) -> Result<Call> {
        call.validate().map_err(|reason| SyncError::InvalidCall {
            id: call.id,
            reason,
        })?;
        self.commit(|tables| {
            let existed = tables.calls.insert(call.id, call.clone()).is_some();
            let entity = Entity::Call(call.clone());
            let event = if existed {
                ChangeEvent::updated(entity)
            } else {
                ChangeEvent::created(entity)
            };
            Ok((call, vec![event]))
        })
    }

    fn ambulance_call_history(
        &self,
        ambulance_id: AmbulanceId,
        call_id: CallId,
    ) -> Result<Option<AmbulanceCallHistory>> {
        Ok(self
            .read()?
            .call_histories
            .get(&(ambulance_id, call_id))
            .cloned())
    }

    fn save_ambulance_call_history(&self, history: AmbulanceCallHistory) -> Result<()> {
        self.commit(|tables| {
            if !tables.ambulances.contains_key(&history.ambulance_id) {
                return Err(SyncError::not_found(EntityKind::Ambulance, history.ambulance_id));
            }
            if !tables.calls.contains_key(&history.call_id) {
                return Err(SyncError::not_found(EntityKind::Call, history.call_id));
            }
            let key = (history.ambulance_id, history.call_id);
            let existed = tables.call_histories.insert(key, history.clone()).is_some();
            let entity = Entity::AmbulanceCallHistory(history);
            let event = if existed {
                ChangeEvent::updated(entity)
            } else {
                ChangeEvent::created(entity)
            };
            Ok(((), vec![event]))
        })
    }

    fn get_hospital(&self, id: HospitalId) -> Result<Option<Hospital>> {
        Ok(self.read()?.hospitals.get(&id).cloned())
    }

    fn filter_hospitals(&self, predicate: &dyn Fn(&Hospital) -> bool) -> Result<Vec<Hospital>> {
        Ok(self
            .read()?
            .hospitals
            .values()
            .filter(|&h| predicate(h))
            .cloned()
            .collect())
    }

    fn save_hospital(&self, hospital: Hospital, actor: &str) -> Result<Hospital> {
        self.commit(|tables| Ok(write_hospital(tables, hospital, actor)))
    }

    fn update_hospital(&self, id: HospitalId, patch: &HospitalPatch, actor: &str) -> Result<Hospital> {
        self.commit(|tables| {
            let mut hospital = tables
                .hospitals
                .get(&id)
                .cloned()
                .ok_or_else(|| SyncError::not_found(EntityKind::Hospital, id))?;
            patch.apply(&mut hospital);
            Ok(write_hospital(tables, hospital, actor))
        })
    }

    fn get_equipment(&self, id: EquipmentId) -> Result<Option<Equipment>> {
        Ok(self.read()?.equipment.get(&id).cloned())
    }

    fn filter_equipment(&self, predicate: &dyn Fn(&Equipment) -> bool) -> Result<Vec<Equipment>> {
        Ok(self
            .read()?
            .equipment
            .values()
            .filter(|&e| predicate(e))
            .cloned()
            .collect())
    }

    fn save_equipment(&self, equipment: Equipment) -> Result<Equipment> {
        self.commit(|tables| {
            let previous = tables.equipment.insert(equipment.id, equipment.clone());
            let entity = Entity::Equipment(equipment.clone());
            let event = match previous {
                Some(previous) => {
                    ChangeEvent::updated(entity).with_previous(Entity::Equipment(previous))
                }
                None => ChangeEvent::created(entity),
            };
            Ok((equipment, vec![event]))
        })
    }

    fn hospital_equipment(&self, hospital_id: HospitalId) -> Result<Vec<HospitalEquipment>> {
        Ok(self
            .read()?
            .hospital_equipment
            .range((hospital_id, EquipmentId::MIN)..=(hospital_id, EquipmentId::MAX))
            .map(|(_, item)| item.clone())
            .collect())
    }

    fn hospitals_with_equipment(&self, equipment_id: EquipmentId) -> Result<Vec<HospitalId>> {
        Ok(self
            .read()?
            .hospital_equipment
            .keys()
            .filter(|(_, e)| *e == equipment_id)
            .map(|(h, _)| *h)
            .collect())
    }

    fn get_hospital_equipment(
        &self,
        hospital_id: HospitalId,
        equipment_id: EquipmentId,
    ) -> Result<Option<HospitalEquipment>> {
        Ok(self
            .read()?
            .hospital_equipment
            .get(&(hospital_id, equipment_id))
            .cloned())
    }

    fn save_hospital_equipment(
        &self,
        item: HospitalEquipment,
        actor: &str,
    ) -> Result<HospitalEquipment> {
        self.commit(|tables| write_hospital_equipment(tables, item, actor))
    }

    fn update_hospital_equipment(
        &self,
        hospital_id: HospitalId,
        equipment_id: EquipmentId,
        patch: &HospitalEquipmentPatch,
        actor: &str,
    ) -> Result<HospitalEquipment> {
        self.commit(|tables| {
            let mut item = tables
                .hospital_equipment
                .get(&(hospital_id, equipment_id))
                .cloned()
                .ok_or_else(|| {
                    SyncError::not_found(
                        EntityKind::HospitalEquipment,
                        format!("{}:{}", hospital_id, equipment_id),
                    )
                })?;
            patch.apply(&mut item);
            write_hospital_equipment(tables, item, actor)
        })
    }

    fn delete_hospital_equipment(
        &self,
        hospital_id: HospitalId,
        equipment_id: EquipmentId,
    ) -> Result<HospitalEquipment> {
        self.commit(|tables| {
            let item = tables
                .hospital_equipment
                .remove(&(hospital_id, equipment_id))
                .ok_or_else(|| {
                    SyncError::not_found(
                        EntityKind::HospitalEquipment,
                        format!("{}:{}", hospital_id, equipment_id),
                    )
                })?;
            let mut event = ChangeEvent::deleted(Entity::HospitalEquipment(item.clone()));
            event.equipment = tables.equipment.get(&equipment_id).cloned();
            Ok((item, vec![event]))
        })
    }

    fn get_profile(&self, username: &str) -> Result<Option<Profile>> {
        Ok(self.read()?.profiles.get(username).cloned())
    }

    fn filter_profiles(&self, predicate: &dyn Fn(&Profile) -> bool) -> Result<Vec<Profile>> {
        Ok(self
            .read()?
            .profiles
            .values()
            .filter(|&p| predicate(p))
            .cloned()
            .collect())
    }

    fn save_profile(&self, profile: Profile) -> Result<Profile> {
        self.commit(|tables| {
            let existed = tables
                .profiles
                .insert(profile.username.clone(), profile.clone())
                .is_some();
            let entity = Entity::Profile(profile.clone());
            let event = if existed {
                ChangeEvent::updated(entity)
            } else {
                ChangeEvent::created(entity)
            };
            Ok((profile, vec![event]))
        })
    }

    fn on_change(&self, observer: Arc<dyn ChangeObserver>) {
        match self.observers.write() {
            Ok(mut observers) => observers.push(observer),
            Err(_) => tracing::error!("Observer lock poisoned, change observer not registered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CrudAction;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ChangeEvent>>,
    }

    impl ChangeObserver for Recorder {
        fn on_change(&self, event: &ChangeEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn recorded(recorder: &Recorder) -> Vec<(EntityKind, CrudAction, String)> {
        recorder
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.kind(), e.action, e.entity.id()))
            .collect()
    }

    #[test]
    fn test_save_ambulance_notifies_and_records_update() {
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        store.on_change(recorder.clone());

        store
            .save_ambulance(Ambulance::new(1, "BC-179"), "admin")
            .unwrap();
        let saved = store
            .update_ambulance(1, &AmbulancePatch::status(AmbulanceStatus::OutOfService), "admin")
            .unwrap();

        assert_eq!(saved.status, AmbulanceStatus::OutOfService);
        assert_eq!(saved.updated_by, "admin");

        let kinds: Vec<(EntityKind, CrudAction)> =
            recorded(&recorder).into_iter().map(|(k, a, _)| (k, a)).collect();
        assert_eq!(
            kinds,
            vec![
                (EntityKind::Ambulance, CrudAction::Created),
                (EntityKind::AmbulanceUpdate, CrudAction::Created),
                (EntityKind::Ambulance, CrudAction::Updated),
                (EntityKind::AmbulanceUpdate, CrudAction::Created),
            ]
        );
        assert_eq!(store.ambulance_updates(1).unwrap().len(), 2);
    }

    #[test]
    fn test_update_missing_ambulance_is_not_found() {
        let store = MemoryStore::new();
        let recorder = Arc::new(Recorder::default());
        store.on_change(recorder.clone());

        let err = store
            .update_ambulance(9, &AmbulancePatch::status(AmbulanceStatus::Available), "admin")
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound { kind: EntityKind::Ambulance, .. }));
        assert!(recorded(&recorder).is_empty());
    }

    #[test]
    fn test_hospital_equipment_lifecycle() {
        let store = MemoryStore::new();
        store.save_hospital(Hospital::new(1, "General"), "admin").unwrap();
        store
            .save_equipment(Equipment {
                id: 1,
                name: "rx".into(),
                etype: EquipmentType::Boolean,
            })
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        store.on_change(recorder.clone());

        store
            .save_hospital_equipment(HospitalEquipment::new(1, 1, "True"), "admin")
            .unwrap();
        store
            .update_hospital_equipment(1, 1, &HospitalEquipmentPatch::value("False"), "admin")
            .unwrap();
        assert_eq!(store.hospitals_with_equipment(1).unwrap(), vec![1]);
        store.delete_hospital_equipment(1, 1).unwrap();

        let actions: Vec<CrudAction> = recorded(&recorder).into_iter().map(|(_, a, _)| a).collect();
        assert_eq!(
            actions,
            vec![CrudAction::Created, CrudAction::Updated, CrudAction::Deleted]
        );
        assert!(store.hospital_equipment(1).unwrap().is_empty());
    }

    #[test]
    fn test_equipment_events_carry_catalog_context() {
        let store = MemoryStore::from_snapshot(crate::test_helpers::sample_snapshot()).unwrap();
        let recorder = Arc::new(Recorder::default());
        store.on_change(recorder.clone());

        store
            .update_hospital_equipment(1, 1, &HospitalEquipmentPatch::value("False"), "admin")
            .unwrap();
        store
            .save_equipment(Equipment {
                id: 1,
                name: "x-ray".into(),
                etype: EquipmentType::Boolean,
            })
            .unwrap();
        store.delete_hospital_equipment(1, 1).unwrap();

        let events = recorder.events.lock().unwrap();
        assert_eq!(events[0].equipment.as_ref().unwrap().name, "rx");
        match &events[1].previous {
            Some(Entity::Equipment(previous)) => assert_eq!(previous.name, "rx"),
            other => panic!("expected previous catalog entry, got {:?}", other),
        }
        assert_eq!(events[2].equipment.as_ref().unwrap().name, "x-ray");
    }

    #[test]
    fn test_hospital_equipment_requires_catalog_entry() {
        let store = MemoryStore::new();
        store.save_hospital(Hospital::new(1, "General"), "admin").unwrap();
        let err = store
            .save_hospital_equipment(HospitalEquipment::new(1, 5, "3"), "admin")
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound { kind: EntityKind::Equipment, .. }));
    }

    #[test]
    fn test_save_call_validates_window() {
        let store = MemoryStore::new();
        let err = store
            .save_call(Call {
                id: 1,
                started_at: None,
                ended_at: Some(Utc::now()),
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidCall { id: 1, .. }));
    }

    #[test]
    fn test_from_snapshot_rejects_dangling_rows() {
        let snapshot = StoreSnapshot {
            hospital_equipment: vec![HospitalEquipment::new(1, 1, "True")],
            ..Default::default()
        };
        assert!(MemoryStore::from_snapshot(snapshot).is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixtures.yaml");
        std::fs::write(
            &path,
            "ambulances:\n  - id: 1\n    identifier: BC-179\nhospitals:\n  - id: 1\n    name: General\n",
        )
        .unwrap();

        let store = MemoryStore::from_yaml_file(&path).unwrap();
        assert_eq!(store.get_ambulance(1).unwrap().unwrap().identifier, "BC-179");
        assert_eq!(store.filter_hospitals(&|_| true).unwrap().len(), 1);
    }
}
