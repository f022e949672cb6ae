//! Seeder
//!
//! Publishes the full current value of everything a principal may read, in
//! the same retained shape the outbound publisher uses, so a freshly
//! (re)connected session starts from a complete snapshot. Publications are
//! deterministic: seeding twice leaves byte-identical retained messages.
//!
//! Each entity is read and published while holding the publish gate shared
//! with the outbound publisher, so a write committed mid-seed is never
//! overwritten by the value seeding read before it.

use crate::error::Result;
use crate::events::{MessageBus, QoS};
use crate::store::models::*;
use crate::store::traits::EntityStore;
use crate::sync::permissions::PermissionResolver;
use crate::sync::publisher::{self, Publication, PublishGate};
use std::sync::Arc;
use tracing::{debug, info};

/// Counts of what a seeding pass published
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub ambulances: usize,
    pub hospitals: usize,
    pub equipment: usize,
    pub profiles: usize,
}

impl SeedReport {
    pub fn total(&self) -> usize {
        // metadata topics are one per hospital
        self.ambulances + self.hospitals * 2 + self.equipment + self.profiles
    }
}

#[derive(Clone)]
pub struct Seeder {
    store: Arc<dyn EntityStore>,
    bus: Arc<dyn MessageBus>,
    permissions: PermissionResolver,
    qos: QoS,
    gate: PublishGate,
}

impl Seeder {
    pub fn new(
        store: Arc<dyn EntityStore>,
        bus: Arc<dyn MessageBus>,
        permissions: PermissionResolver,
        qos: QoS,
    ) -> Self {
        Self {
            store,
            bus,
            permissions,
            qos,
            gate: PublishGate::new(),
        }
    }

    /// Share the outbound publisher's gate
    pub fn with_gate(mut self, gate: PublishGate) -> Self {
        self.gate = gate;
        self
    }

    async fn publish(&self, publication: Publication) -> Result<()> {
        self.bus
            .publish(&publication.topic, publication.payload, self.qos, true)
            .await?;
        debug!(topic = %publication.topic, "Seeded");
        Ok(())
    }

    async fn seed_ambulances(&self, ids: Vec<AmbulanceId>, report: &mut SeedReport) -> Result<()> {
        for id in ids {
            let _gate = self.gate.lock().await;
            if let Some(ambulance) = self.store.get_ambulance(id)? {
                self.publish(publisher::ambulance_publication(&ambulance)?).await?;
                report.ambulances += 1;
            }
        }
        Ok(())
    }

    /// Hospital data, then its metadata, then each equipment row
    async fn seed_hospitals(&self, ids: Vec<HospitalId>, report: &mut SeedReport) -> Result<()> {
        for id in ids {
            let _gate = self.gate.lock().await;
            let Some(hospital) = self.store.get_hospital(id)? else {
                continue;
            };
            self.publish(publisher::hospital_publication(&hospital)?).await?;
            self.publish(publisher::metadata_publication(self.store.as_ref(), id)?)
                .await?;
            report.hospitals += 1;

            for item in self.store.hospital_equipment(id)? {
                self.publish(publisher::current_equipment_publication(
                    self.store.as_ref(),
                    &item,
                )?)
                .await?;
                report.equipment += 1;
            }
        }
        Ok(())
    }

    /// Stored profile of each user, or an empty one
    async fn seed_profiles(&self, usernames: Vec<String>, report: &mut SeedReport) -> Result<()> {
        for username in usernames {
            let _gate = self.gate.lock().await;
            let profile = self
                .store
                .get_profile(&username)?
                .unwrap_or_else(|| Profile::empty(&username));
            self.publish(publisher::profile_publication(&profile)?).await?;
            report.profiles += 1;
        }
        Ok(())
    }

    fn profile_names(&self, predicate: &dyn Fn(&Profile) -> bool) -> Result<Vec<String>> {
        Ok(self
            .store
            .filter_profiles(predicate)?
            .into_iter()
            .map(|p| p.username)
            .collect())
    }

    /// Seed everything `principal` may read plus their own profile.
    ///
    /// Admin principals get every entity and every stored profile.
    pub async fn seed(&self, principal: &Principal) -> Result<SeedReport> {
        let mut report = SeedReport::default();

        let ambulances = self.permissions.readable_ambulances(principal)?;
        self.seed_ambulances(ambulances.into_iter().collect(), &mut report)
            .await?;

        let hospitals = self.permissions.readable_hospitals(principal)?;
        self.seed_hospitals(hospitals.into_iter().collect(), &mut report)
            .await?;

        let mut profiles = vec![principal.username.clone()];
        if principal.is_admin {
            profiles.extend(self.profile_names(&|p| p.username != principal.username)?);
        }
        self.seed_profiles(profiles, &mut report).await?;

        info!(
            username = %principal.username,
            ambulances = report.ambulances,
            hospitals = report.hospitals,
            equipment = report.equipment,
            profiles = report.profiles,
            "Seeding complete"
        );
        Ok(report)
    }

    /// Seed the complete store, outside any session
    pub async fn seed_all(&self) -> Result<SeedReport> {
        let mut report = SeedReport::default();

        let ambulances = self.store.filter_ambulances(&|_| true)?;
        self.seed_ambulances(ambulances.into_iter().map(|a| a.id).collect(), &mut report)
            .await?;
        let hospitals = self.store.filter_hospitals(&|_| true)?;
        self.seed_hospitals(hospitals.into_iter().map(|h| h.id).collect(), &mut report)
            .await?;
        self.seed_profiles(self.profile_names(&|_| true)?, &mut report)
            .await?;

        info!(total = report.total(), "Full store seeded");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MemoryBus, Subscription};
    use crate::store::MemoryStore;
    use crate::sync::publisher::OutboundPublisher;
    use crate::test_helpers::sample_store;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn seeder(bus: &MemoryBus) -> Seeder {
        let store = sample_store();
        Seeder::new(
            store.clone(),
            Arc::new(bus.clone()),
            PermissionResolver::new(store),
            QoS::AtMostOnce,
        )
    }

    #[tokio::test]
    async fn test_seed_scoped_to_readable_subset() {
        let bus = MemoryBus::new();
        let report = seeder(&bus).seed(&Principal::user("testuser1")).await.unwrap();

        assert_eq!(report.ambulances, 1);
        assert_eq!(report.hospitals, 1);
        assert_eq!(
            bus.retained_topics(),
            vec![
                "ambulance/1/data",
                "hospital/1/data",
                "hospital/1/equipment/rx/data",
                "hospital/1/metadata",
                "user/testuser1/profile",
            ]
        );
        assert_eq!(bus.published().len(), report.total());
    }

    #[tokio::test]
    async fn test_seed_without_profile_publishes_empty_grants() {
        let bus = MemoryBus::new();
        let report = seeder(&bus).seed(&Principal::user("nobody")).await.unwrap();

        assert_eq!(report.total(), 1);
        let profile = bus.retained_json("user/nobody/profile").unwrap();
        assert!(profile["ambulances"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let bus = MemoryBus::new();
        let seeder = seeder(&bus);
        let principal = Principal::user("testuser2");

        seeder.seed(&principal).await.unwrap();
        let first: Vec<_> = bus
            .retained_topics()
            .into_iter()
            .map(|t| bus.retained(&t).unwrap().payload)
            .collect();
        seeder.seed(&principal).await.unwrap();
        let second: Vec<_> = bus
            .retained_topics()
            .into_iter()
            .map(|t| bus.retained(&t).unwrap().payload)
            .collect();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_admin_seed_covers_everything() {
        let bus = MemoryBus::new();
        let report = seeder(&bus).seed(&Principal::admin("admin")).await.unwrap();

        assert_eq!(report.ambulances, 3);
        assert_eq!(report.hospitals, 2);
        assert_eq!(report.profiles, 3);
        assert!(bus.retained("user/testuser1/profile").is_some());
        assert!(bus.retained("hospital/2/metadata").is_some());
    }

    #[tokio::test]
    async fn test_seed_all_matches_admin_seed_topics() {
        let bus = MemoryBus::new();
        let report = seeder(&bus).seed_all().await.unwrap();

        assert_eq!(report.profiles, 2);
        assert_eq!(bus.retained_topics().len(), report.total());
        assert!(bus.retained("user/admin/profile").is_none());
    }

    #[tokio::test]
    async fn test_seed_fails_when_bus_offline() {
        let bus = MemoryBus::new();
        bus.set_online(false);
        let err = seeder(&bus).seed(&Principal::user("testuser1")).await.unwrap_err();
        assert!(err.is_transient());
    }

    /// Commits an ambulance write while the first ambulance is being seeded
    struct WriteDuringSeed {
        inner: MemoryBus,
        store: Arc<MemoryStore>,
        fired: AtomicBool,
    }

    #[async_trait]
    impl MessageBus for WriteDuringSeed {
        async fn connect(&self) -> Result<()> {
            self.inner.connect().await
        }

        async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
            if topic == "ambulance/1/data" && !self.fired.swap(true, Ordering::SeqCst) {
                self.store.update_ambulance(
                    2,
                    &AmbulancePatch::status(AmbulanceStatus::AtScene),
                    "admin",
                )?;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            self.inner.publish(topic, payload, qos, retain).await
        }

        async fn subscribe(&self, filters: &[String]) -> Result<Subscription> {
            self.inner.subscribe(filters).await
        }
    }

    #[tokio::test]
    async fn test_write_during_seed_is_not_overwritten() {
        let store = sample_store();
        let inner = MemoryBus::new();
        let bus: Arc<dyn MessageBus> = Arc::new(WriteDuringSeed {
            inner: inner.clone(),
            store: store.clone(),
            fired: AtomicBool::new(false),
        });
        let publisher =
            OutboundPublisher::spawn(store.clone(), bus.clone(), QoS::AtLeastOnce, Duration::from_millis(5));
        store.on_change(publisher.clone());
        let seeder = Seeder::new(
            store.clone(),
            bus,
            PermissionResolver::new(store.clone()),
            QoS::AtLeastOnce,
        )
        .with_gate(publisher.gate());

        seeder.seed(&Principal::admin("admin")).await.unwrap();
        publisher.wait_idle().await;

        assert_eq!(
            store.get_ambulance(2).unwrap().unwrap().status,
            AmbulanceStatus::AtScene
        );
        assert_eq!(
            inner.retained_json("ambulance/2/data").unwrap()["status"],
            "at-scene"
        );
        publisher.shutdown().await;
    }
}
