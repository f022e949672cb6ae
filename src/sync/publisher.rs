//! Outbound publisher
//!
//! Registered as a store observer. Every committed change is queued on an
//! unbounded channel and published as a retained message by a single
//! background task, so publications leave in commit order and the writer is
//! never blocked on the bus.
//!
//! Topics whose publication failed are remembered and republished from the
//! store's current state once the bus accepts publications again.

use crate::error::{Result, SyncError};
use crate::events::{ChangeEvent, CrudAction, Entity, EntityKind, MessageBus, QoS};
use crate::store::models::*;
use crate::store::traits::{ChangeObserver, EntityStore};
use crate::sync::topics::{self, Topic};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A retained message ready to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Publication {
    fn new(topic: Topic, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.to_string(),
            payload,
        }
    }

    /// Empty retained payload: removes the topic from the bus
    fn clear(topic: Topic) -> Self {
        Self::new(topic, Vec::new())
    }
}

/// Lock shared by every writer of retained topics.
///
/// Whoever holds it reads the store and publishes without another writer
/// interleaving, so a value read under the gate can only be superseded by a
/// publication of a later commit.
#[derive(Clone, Default)]
pub struct PublishGate(Arc<tokio::sync::Mutex<()>>);

impl PublishGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.0.lock().await
    }
}

// ============================================================================
// Rendering
// ============================================================================

pub(crate) fn ambulance_publication(ambulance: &Ambulance) -> Result<Publication> {
    Ok(Publication::new(
        Topic::ambulance(ambulance.id),
        topics::encode_ambulance(ambulance)?,
    ))
}

pub(crate) fn hospital_publication(hospital: &Hospital) -> Result<Publication> {
    Ok(Publication::new(
        Topic::hospital(hospital.id),
        topics::encode_hospital(hospital)?,
    ))
}

fn catalog_entry(store: &dyn EntityStore, id: EquipmentId) -> Result<Equipment> {
    store
        .get_equipment(id)?
        .ok_or_else(|| SyncError::not_found(EntityKind::Equipment, id))
}

/// Current equipment catalog subset of a hospital
pub(crate) fn metadata_publication(
    store: &dyn EntityStore,
    hospital_id: HospitalId,
) -> Result<Publication> {
    let equipment = store
        .hospital_equipment(hospital_id)?
        .iter()
        .map(|item| catalog_entry(store, item.equipment_id))
        .collect::<Result<Vec<_>>>()?;
    Ok(Publication::new(
        Topic::hospital_metadata(hospital_id),
        topics::encode_metadata(&equipment)?,
    ))
}

pub(crate) fn equipment_publication(
    item: &HospitalEquipment,
    equipment: &Equipment,
) -> Result<Publication> {
    Ok(Publication::new(
        Topic::hospital_equipment(item.hospital_id, &equipment.name),
        topics::encode_hospital_equipment(item, equipment)?,
    ))
}

/// Equipment row rendered under the catalog's current name
pub(crate) fn current_equipment_publication(
    store: &dyn EntityStore,
    item: &HospitalEquipment,
) -> Result<Publication> {
    equipment_publication(item, &catalog_entry(store, item.equipment_id)?)
}

pub(crate) fn profile_publication(profile: &Profile) -> Result<Publication> {
    Ok(Publication::new(
        Topic::profile(&profile.username),
        topics::encode_profile(profile)?,
    ))
}

/// Catalog entry as of the commit that produced `event`
fn committed_equipment(
    event: &ChangeEvent,
    store: &dyn EntityStore,
    item: &HospitalEquipment,
) -> Result<Equipment> {
    match &event.equipment {
        Some(equipment) => Ok(equipment.clone()),
        None => catalog_entry(store, item.equipment_id),
    }
}

/// A catalog edit touches every hospital carrying the entry. A rename moves
/// each row to its new sub-topic.
fn catalog_publications(
    event: &ChangeEvent,
    equipment: &Equipment,
    store: &dyn EntityStore,
) -> Result<Vec<Publication>> {
    let renamed_from = match &event.previous {
        Some(Entity::Equipment(previous)) if previous.name != equipment.name => {
            Some(previous.name.as_str())
        }
        _ => None,
    };

    let mut publications = Vec::new();
    for hospital_id in store.hospitals_with_equipment(equipment.id)? {
        if let Some(old_name) = renamed_from {
            publications.push(Publication::clear(Topic::hospital_equipment(hospital_id, old_name)));
        }
        if let Some(item) = store.get_hospital_equipment(hospital_id, equipment.id)? {
            publications.push(equipment_publication(&item, equipment)?);
        }
        publications.push(metadata_publication(store, hospital_id)?);
    }
    Ok(publications)
}

/// Retained messages a committed change translates into.
///
/// Entity values and equipment names come from the event itself; hospital
/// metadata reads the store's current state.
pub fn publications_for(event: &ChangeEvent, store: &dyn EntityStore) -> Result<Vec<Publication>> {
    let publications = match (&event.entity, event.action) {
        (Entity::Ambulance(ambulance), _) => vec![ambulance_publication(ambulance)?],
        (Entity::Hospital(hospital), _) => vec![hospital_publication(hospital)?],
        (Entity::HospitalEquipment(item), CrudAction::Updated) => {
            let equipment = committed_equipment(event, store, item)?;
            vec![equipment_publication(item, &equipment)?]
        }
        (Entity::HospitalEquipment(item), CrudAction::Created) => {
            let equipment = committed_equipment(event, store, item)?;
            vec![
                equipment_publication(item, &equipment)?,
                metadata_publication(store, item.hospital_id)?,
            ]
        }
        (Entity::HospitalEquipment(item), CrudAction::Deleted) => {
            let equipment = committed_equipment(event, store, item)?;
            vec![
                Publication::clear(Topic::hospital_equipment(item.hospital_id, &equipment.name)),
                metadata_publication(store, item.hospital_id)?,
            ]
        }
        (Entity::Equipment(equipment), CrudAction::Updated) => {
            catalog_publications(event, equipment, store)?
        }
        (Entity::Profile(profile), _) => vec![profile_publication(profile)?],
        _ => Vec::new(),
    };
    Ok(publications)
}

/// Retained message a topic should carry given the store's current state.
/// Topics whose entity no longer exists are cleared.
pub fn current_publication(store: &dyn EntityStore, topic: &Topic) -> Result<Publication> {
    let cleared = || -> Result<Publication> { Ok(Publication::clear(topic.clone())) };
    match topic {
        Topic::AmbulanceData(id) => match store.get_ambulance(*id)? {
            Some(ambulance) => ambulance_publication(&ambulance),
            None => cleared(),
        },
        Topic::HospitalData(id) => match store.get_hospital(*id)? {
            Some(hospital) => hospital_publication(&hospital),
            None => cleared(),
        },
        Topic::HospitalMetadata(id) => match store.get_hospital(*id)? {
            Some(_) => metadata_publication(store, *id),
            None => cleared(),
        },
        Topic::HospitalEquipmentData {
            hospital_id,
            equipment,
        } => {
            let entry = store
                .filter_equipment(&|e| e.name == *equipment)?
                .into_iter()
                .next();
            let row = match entry {
                Some(entry) => store
                    .get_hospital_equipment(*hospital_id, entry.id)?
                    .map(|item| (item, entry)),
                None => None,
            };
            match row {
                Some((item, entry)) => equipment_publication(&item, &entry),
                None => cleared(),
            }
        }
        Topic::UserProfile(username) => {
            let profile = store
                .get_profile(username)?
                .unwrap_or_else(|| Profile::empty(username));
            profile_publication(&profile)
        }
        Topic::Command { .. } => Err(SyncError::InvalidTopic(topic.to_string())),
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// Store observer that republishes every committed change on the bus
pub struct OutboundPublisher {
    sender: mpsc::UnboundedSender<ChangeEvent>,
    pending: watch::Sender<usize>,
    gate: PublishGate,
    failed: Arc<Mutex<BTreeSet<String>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OutboundPublisher {
    /// Spawn the publishing task. The caller registers the returned
    /// publisher with the store (`store.on_change(publisher.clone())`).
    ///
    /// Failed topics are retried every `retry_interval`.
    pub fn spawn(
        store: Arc<dyn EntityStore>,
        bus: Arc<dyn MessageBus>,
        qos: QoS,
        retry_interval: Duration,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0usize);
        let gate = PublishGate::new();
        let failed = Arc::new(Mutex::new(BTreeSet::new()));
        let cancel = CancellationToken::new();

        let worker = Worker {
            store,
            bus,
            qos,
            gate: gate.clone(),
            failed: failed.clone(),
        };
        let task = tokio::spawn(run(
            receiver,
            worker,
            retry_interval,
            pending.clone(),
            cancel.clone(),
        ));
        info!(qos = u8::from(qos), "Outbound publisher started");

        Arc::new(Self {
            sender,
            pending,
            gate,
            failed,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Number of changes queued or being published
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Gate to share with anything else publishing retained topics
    pub fn gate(&self) -> PublishGate {
        self.gate.clone()
    }

    /// Topics whose last publication failed and await a retry
    pub fn failed_topics(&self) -> Vec<String> {
        self.failed
            .lock()
            .map(|failed| failed.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Wait until every queued change has been handed to the bus.
    /// Failed topics are retried in the background and not waited for.
    pub async fn wait_idle(&self) {
        let mut pending = self.pending.subscribe();
        tokio::select! {
            _ = pending.wait_for(|n| *n == 0) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Stop publishing; changes still queued are dropped
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Outbound publisher task failed: {}", e);
            }
        }
        info!("Outbound publisher stopped");
    }
}

impl ChangeObserver for OutboundPublisher {
    fn on_change(&self, event: &ChangeEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.pending.send_modify(|n| *n += 1);
        if self.sender.send(event.clone()).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            warn!(kind = %event.kind(), "Outbound publisher closed, change dropped");
        }
    }
}

impl Drop for OutboundPublisher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    store: Arc<dyn EntityStore>,
    bus: Arc<dyn MessageBus>,
    qos: QoS,
    gate: PublishGate,
    failed: Arc<Mutex<BTreeSet<String>>>,
}

impl Worker {
    async fn publish_change(&self, event: &ChangeEvent) {
        let _gate = self.gate.lock().await;
        match publications_for(event, self.store.as_ref()) {
            Ok(publications) => {
                for publication in publications {
                    self.publish(publication).await;
                }
            }
            Err(e) => warn!(kind = %event.kind(), id = %event.entity.id(), "Failed to render change: {}", e),
        }
    }

    /// Publish and track the outcome; false if the bus refused it
    async fn publish(&self, publication: Publication) -> bool {
        let Publication { topic, payload } = publication;
        match self.bus.publish(&topic, payload, self.qos, true).await {
            Ok(()) => {
                debug!(topic = %topic, "Change published");
                self.mark_failed(&topic, false);
                true
            }
            Err(e) => {
                warn!(topic = %topic, "Failed to publish change, will retry: {}", e);
                self.mark_failed(&topic, true);
                false
            }
        }
    }

    fn mark_failed(&self, topic: &str, failed: bool) {
        if let Ok(mut topics) = self.failed.lock() {
            if failed {
                topics.insert(topic.to_string());
            } else {
                topics.remove(topic);
            }
        }
    }

    fn has_failed(&self) -> bool {
        self.failed
            .lock()
            .map(|topics| !topics.is_empty())
            .unwrap_or(false)
    }

    /// Republish the current store value of every failed topic
    async fn retry_failed(&self) {
        if let Err(e) = self.bus.connect().await {
            debug!("Bus still unreachable: {}", e);
            return;
        }

        let _gate = self.gate.lock().await;
        let topics: Vec<String> = self
            .failed
            .lock()
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default();
        let mut repaired = 0usize;
        for topic in topics {
            let publication = Topic::parse(&topic)
                .and_then(|parsed| current_publication(self.store.as_ref(), &parsed));
            match publication {
                Ok(publication) => {
                    if !self.publish(publication).await {
                        break;
                    }
                    repaired += 1;
                }
                Err(e) => {
                    warn!(topic = %topic, "Dropping failed topic: {}", e);
                    self.mark_failed(&topic, false);
                }
            }
        }
        if repaired > 0 {
            info!(repaired, "Republished topics after bus outage");
        }
    }
}

async fn run(
    mut receiver: mpsc::UnboundedReceiver<ChangeEvent>,
    worker: Worker,
    retry_interval: Duration,
    pending: watch::Sender<usize>,
    cancel: CancellationToken,
) {
    let mut retry = tokio::time::interval(retry_interval.max(Duration::from_millis(1)));
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = receiver.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = retry.tick(), if worker.has_failed() => {
                worker.retry_failed().await;
                continue;
            }
        };

        worker.publish_change(&event).await;
        pending.send_modify(|n| *n = n.saturating_sub(1));
    }
    pending.send_replace(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryBus;
    use crate::store::MemoryStore;
    use crate::test_helpers::sample_store;

    fn start(store: Arc<MemoryStore>, bus: &MemoryBus) -> Arc<OutboundPublisher> {
        let publisher = OutboundPublisher::spawn(
            store.clone(),
            Arc::new(bus.clone()),
            QoS::AtLeastOnce,
            Duration::from_millis(5),
        );
        store.on_change(publisher.clone());
        publisher
    }

    #[tokio::test]
    async fn test_ambulance_change_published_retained() {
        let store = sample_store();
        let bus = MemoryBus::new();
        let publisher = start(store.clone(), &bus);

        store
            .update_ambulance(1, &AmbulancePatch::status(AmbulanceStatus::OutOfService), "admin")
            .unwrap();
        publisher.wait_idle().await;

        let published = bus.published_on("ambulance/1/data");
        assert_eq!(published.len(), 1);
        assert!(published[0].retained);
        assert_eq!(published[0].qos, QoS::AtLeastOnce);
        assert_eq!(
            bus.retained_json("ambulance/1/data").unwrap()["status"],
            "out-of-service"
        );
    }

    #[tokio::test]
    async fn test_successive_updates_keep_write_order() {
        let store = sample_store();
        let bus = MemoryBus::new();
        let publisher = start(store.clone(), &bus);

        for status in [
            AmbulanceStatus::Available,
            AmbulanceStatus::EnRoute,
            AmbulanceStatus::AtScene,
        ] {
            store
                .update_ambulance(2, &AmbulancePatch::status(status), "admin")
                .unwrap();
        }
        publisher.wait_idle().await;

        let statuses: Vec<String> = bus
            .published_on("ambulance/2/data")
            .iter()
            .map(|m| {
                let json: serde_json::Value = serde_json::from_slice(&m.payload).unwrap();
                json["status"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(statuses, vec!["available", "en-route", "at-scene"]);
        assert_eq!(bus.retained_json("ambulance/2/data").unwrap()["status"], "at-scene");
    }

    #[tokio::test]
    async fn test_equipment_value_change_skips_metadata() {
        let store = sample_store();
        let bus = MemoryBus::new();
        let publisher = start(store.clone(), &bus);

        store
            .update_hospital_equipment(1, 1, &HospitalEquipmentPatch::value("False"), "admin")
            .unwrap();
        publisher.wait_idle().await;

        let topics: Vec<String> = bus.published().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["hospital/1/equipment/rx/data".to_string()]);
        assert_eq!(
            bus.retained_json("hospital/1/equipment/rx/data").unwrap()["value"],
            "False"
        );
    }

    #[tokio::test]
    async fn test_equipment_membership_change_republishes_metadata() {
        let store = sample_store();
        let bus = MemoryBus::new();
        let publisher = start(store.clone(), &bus);

        store
            .save_hospital_equipment(HospitalEquipment::new(1, 2, "12"), "admin")
            .unwrap();
        publisher.wait_idle().await;

        let topics: Vec<String> = bus.published().into_iter().map(|m| m.topic).collect();
        assert_eq!(
            topics,
            vec![
                "hospital/1/equipment/beds/data".to_string(),
                "hospital/1/metadata".to_string()
            ]
        );
        let metadata = bus.retained_json("hospital/1/metadata").unwrap();
        assert_eq!(metadata.as_array().unwrap().len(), 2);

        store.delete_hospital_equipment(1, 2).unwrap();
        publisher.wait_idle().await;

        assert!(bus.retained("hospital/1/equipment/beds/data").is_none());
        let metadata = bus.retained_json("hospital/1/metadata").unwrap();
        assert_eq!(metadata.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_catalog_rename_republishes_referencing_hospitals() {
        let store = sample_store();
        let bus = MemoryBus::new();
        let publisher = start(store.clone(), &bus);

        store
            .save_equipment(Equipment {
                id: 1,
                name: "x-ray".into(),
                etype: EquipmentType::Boolean,
            })
            .unwrap();
        publisher.wait_idle().await;

        let metadata = bus.retained_json("hospital/1/metadata").unwrap();
        assert_eq!(metadata[0]["name"], "x-ray");
        assert!(bus.published_on("hospital/2/metadata").is_empty());
    }

    #[tokio::test]
    async fn test_catalog_rename_moves_equipment_subtopic() {
        let store = sample_store();
        let bus = MemoryBus::new();
        let publisher = start(store.clone(), &bus);

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
        publisher.wait_idle().await;

        // the row update committed before the rename goes out under the old name
        let old = bus.published_on("hospital/1/equipment/rx/data");
        assert_eq!(old.len(), 2);
        assert!(!old[0].payload.is_empty());
        assert!(old[1].payload.is_empty());

        assert!(bus.retained("hospital/1/equipment/rx/data").is_none());
        let moved = bus.retained_json("hospital/1/equipment/x-ray/data").unwrap();
        assert_eq!(moved["value"], "False");
        assert!(bus.published_on("hospital/2/equipment/x-ray/data").is_empty());
    }

    #[tokio::test]
    async fn test_failed_publication_repaired_after_outage() {
        let store = sample_store();
        let bus = MemoryBus::new();
        let publisher = start(store.clone(), &bus);

        bus.set_online(false);
        store
            .update_ambulance(3, &AmbulancePatch::status(AmbulanceStatus::AtHospital), "admin")
            .unwrap();
        publisher.wait_idle().await;
        assert_eq!(publisher.failed_topics(), vec!["ambulance/3/data".to_string()]);
        assert!(bus.retained("ambulance/3/data").is_none());

        bus.set_online(true);
        for _ in 0..200 {
            if publisher.failed_topics().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(publisher.failed_topics().is_empty());
        assert_eq!(
            bus.retained_json("ambulance/3/data").unwrap()["status"],
            "at-hospital"
        );
    }

    #[test]
    fn test_current_publication_clears_missing_entities() {
        let store = sample_store();

        let gone = current_publication(store.as_ref(), &Topic::ambulance(42)).unwrap();
        assert_eq!(gone.topic, "ambulance/42/data");
        assert!(gone.payload.is_empty());

        let renamed = current_publication(
            store.as_ref(),
            &Topic::hospital_equipment(1, "x-ray"),
        )
        .unwrap();
        assert!(renamed.payload.is_empty());

        let row = current_publication(store.as_ref(), &Topic::hospital_equipment(1, "rx")).unwrap();
        assert!(!row.payload.is_empty());

        let profile = current_publication(store.as_ref(), &Topic::profile("nobody")).unwrap();
        assert!(!profile.payload.is_empty());
    }

    #[tokio::test]
    async fn test_calls_and_update_records_not_published() {
        let store = sample_store();
        let bus = MemoryBus::new();
        let publisher = start(store.clone(), &bus);

        store
            .save_call(Call {
                id: 7,
                started_at: None,
                ended_at: None,
            })
            .unwrap();
        publisher.wait_idle().await;
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_publication() {
        let store = sample_store();
        let bus = MemoryBus::new();
        let publisher = start(store.clone(), &bus);

        publisher.shutdown().await;
        store
            .update_ambulance(1, &AmbulancePatch::status(AmbulanceStatus::Available), "admin")
            .unwrap();
        publisher.wait_idle().await;

        assert!(bus.published().is_empty());
        assert_eq!(publisher.pending(), 0);
    }
}
