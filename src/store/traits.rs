//! EntityStore trait definition
//!
//! The relational store is an external collaborator. This trait is the
//! surface the synchronization engine relies on: typed get / filter / save
//! operations, field-level updates, and observer registration. Every
//! successful write fires exactly one `ChangeEvent` per commit to all
//! registered observers, in commit order.

use crate::error::Result;
use crate::events::ChangeEvent;
use crate::store::models::*;
use std::sync::Arc;

/// Receives store change notifications.
///
/// Called after the write is committed, from whichever thread performed the
/// write. Implementations must not block.
pub trait ChangeObserver: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}

/// Abstract interface over the entity store.
///
/// All operations are synchronous and bounded; no network I/O happens
/// behind them.
pub trait EntityStore: Send + Sync {
    // ========================================================================
    // Ambulances
    // ========================================================================

    fn get_ambulance(&self, id: AmbulanceId) -> Result<Option<Ambulance>>;

    fn filter_ambulances(&self, predicate: &dyn Fn(&Ambulance) -> bool) -> Result<Vec<Ambulance>>;

    /// Create or fully overwrite an ambulance; appends an `AmbulanceUpdate`
    fn save_ambulance(&self, ambulance: Ambulance, actor: &str) -> Result<Ambulance>;

    /// Apply a field-level update; fields absent from the patch are preserved
    fn update_ambulance(&self, id: AmbulanceId, patch: &AmbulancePatch, actor: &str)
        -> Result<Ambulance>;

    /// All recorded updates of an ambulance, in no particular order
    fn ambulance_updates(&self, id: AmbulanceId) -> Result<Vec<AmbulanceUpdate>>;

    // ========================================================================
    // Calls
    // ========================================================================

    fn get_call(&self, id: CallId) -> Result<Option<Call>>;

    fn save_call(&self, call: Call) -> Result<Call>;

    fn ambulance_call_history(
        &self,
        ambulance_id: AmbulanceId,
        call_id: CallId,
    ) -> Result<Option<AmbulanceCallHistory>>;

    fn save_ambulance_call_history(&self, history: AmbulanceCallHistory) -> Result<()>;

    // ========================================================================
    // Hospitals
    // ========================================================================

    fn get_hospital(&self, id: HospitalId) -> Result<Option<Hospital>>;

    fn filter_hospitals(&self, predicate: &dyn Fn(&Hospital) -> bool) -> Result<Vec<Hospital>>;

    fn save_hospital(&self, hospital: Hospital, actor: &str) -> Result<Hospital>;

    fn update_hospital(&self, id: HospitalId, patch: &HospitalPatch, actor: &str) -> Result<Hospital>;

    // ========================================================================
    // Equipment catalog
    // ========================================================================

    fn get_equipment(&self, id: EquipmentId) -> Result<Option<Equipment>>;

    fn filter_equipment(&self, predicate: &dyn Fn(&Equipment) -> bool) -> Result<Vec<Equipment>>;

    fn save_equipment(&self, equipment: Equipment) -> Result<Equipment>;

    /// Equipment rows of a hospital
    fn hospital_equipment(&self, hospital_id: HospitalId) -> Result<Vec<HospitalEquipment>>;

    /// Hospitals that carry the given catalog entry
    fn hospitals_with_equipment(&self, equipment_id: EquipmentId) -> Result<Vec<HospitalId>>;

    fn get_hospital_equipment(
        &self,
        hospital_id: HospitalId,
        equipment_id: EquipmentId,
    ) -> Result<Option<HospitalEquipment>>;

    /// Create (adds to the hospital catalog) or overwrite a row
    fn save_hospital_equipment(&self, item: HospitalEquipment, actor: &str)
        -> Result<HospitalEquipment>;

    fn update_hospital_equipment(
        &self,
        hospital_id: HospitalId,
        equipment_id: EquipmentId,
        patch: &HospitalEquipmentPatch,
        actor: &str,
    ) -> Result<HospitalEquipment>;

    /// Remove a row from the hospital catalog
    fn delete_hospital_equipment(
        &self,
        hospital_id: HospitalId,
        equipment_id: EquipmentId,
    ) -> Result<HospitalEquipment>;

    // ========================================================================
    // Profiles
    // ========================================================================

    fn get_profile(&self, username: &str) -> Result<Option<Profile>>;

    fn filter_profiles(&self, predicate: &dyn Fn(&Profile) -> bool) -> Result<Vec<Profile>>;

    fn save_profile(&self, profile: Profile) -> Result<Profile>;

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Register an observer for every subsequent committed write
    fn on_change(&self, observer: Arc<dyn ChangeObserver>);
}
