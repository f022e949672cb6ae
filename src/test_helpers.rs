//! Shared fixtures for unit tests
//!
//! One small fleet: three ambulances, two hospitals with one equipment row
//! each, four calls, and two non-admin profiles.
#![allow(dead_code)]

use crate::store::models::*;
use crate::store::MemoryStore;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

/// Fixed instant `minutes` after the fixture epoch
pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
}

pub fn grant_ambulance(id: AmbulanceId, can_read: bool, can_write: bool) -> AmbulanceGrant {
    AmbulanceGrant {
        ambulance_id: id,
        can_read,
        can_write,
    }
}

pub fn grant_hospital(id: HospitalId, can_read: bool, can_write: bool) -> HospitalGrant {
    HospitalGrant {
        hospital_id: id,
        can_read,
        can_write,
    }
}

fn update(ambulance_id: AmbulanceId, minutes: i64, status: AmbulanceStatus) -> AmbulanceUpdate {
    AmbulanceUpdate {
        ambulance_id,
        status,
        orientation: 0.0,
        location: Location::default(),
        comment: String::new(),
        updated_by: "admin".into(),
        timestamp: at(minutes),
    }
}

fn call(id: CallId, started: Option<i64>, ended: Option<i64>) -> Call {
    Call {
        id,
        started_at: started.map(at),
        ended_at: ended.map(at),
    }
}

pub fn sample_snapshot() -> StoreSnapshot {
    let mut a2 = Ambulance::new(2, "BC-180");
    a2.location = Location {
        latitude: 32.51,
        longitude: -117.03,
    };
    a2.capability = AmbulanceCapability::Advanced;

    let statuses = [
        AmbulanceStatus::Available,
        AmbulanceStatus::EnRoute,
        AmbulanceStatus::AtScene,
        AmbulanceStatus::HospitalBound,
        AmbulanceStatus::AtHospital,
        AmbulanceStatus::Available,
    ];

    let mut testuser1 = Profile::empty("testuser1");
    testuser1.ambulances.push(grant_ambulance(1, true, false));
    testuser1.hospitals.push(grant_hospital(1, true, true));

    let mut testuser2 = Profile::empty("testuser2");
    testuser2.ambulances.push(grant_ambulance(2, true, true));

    StoreSnapshot {
        ambulances: vec![Ambulance::new(1, "BC-179"), a2, Ambulance::new(3, "BC-181")],
        ambulance_updates: statuses
            .iter()
            .enumerate()
            .map(|(i, status)| update(1, i as i64 * 10, *status))
            .collect(),
        calls: vec![
            call(1, Some(10), Some(30)),
            call(2, Some(30), None),
            call(3, None, None),
            call(4, Some(0), Some(60)),
        ],
        call_histories: vec![AmbulanceCallHistory {
            ambulance_id: 1,
            call_id: 4,
            entries: vec![
                CallHistoryEntry {
                    phase: CallPhase::Ongoing,
                    timestamp: at(0),
                },
                CallHistoryEntry {
                    phase: CallPhase::Suspended,
                    timestamp: at(10),
                },
                CallHistoryEntry {
                    phase: CallPhase::Ongoing,
                    timestamp: at(40),
                },
            ],
        }],
        hospitals: vec![Hospital::new(1, "General"), Hospital::new(2, "Mercy")],
        equipment: vec![
            Equipment {
                id: 1,
                name: "rx".into(),
                etype: EquipmentType::Boolean,
            },
            Equipment {
                id: 2,
                name: "beds".into(),
                etype: EquipmentType::Integer,
            },
        ],
        hospital_equipment: vec![
            HospitalEquipment::new(1, 1, "True"),
            HospitalEquipment::new(2, 2, "5"),
        ],
        profiles: vec![testuser1, testuser2],
    }
}

pub fn sample_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::from_snapshot(sample_snapshot()).unwrap())
}
