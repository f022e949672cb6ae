//! Permission resolver
//!
//! Computes the ambulance and hospital identifiers a principal may read or
//! write from the grants on their profile. Admin principals get every
//! identifier in the store without consulting grants. Results are
//! recomputed on every call; grants may change at any time.

use crate::error::{Result, SyncError};
use crate::events::EntityKind;
use crate::store::models::*;
use crate::store::traits::EntityStore;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

impl Access {
    fn verb(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }

    fn granted(self, can_read: bool, can_write: bool) -> bool {
        match self {
            Self::Read => can_read,
            Self::Write => can_write,
        }
    }
}

#[derive(Clone)]
pub struct PermissionResolver {
    store: Arc<dyn EntityStore>,
}

impl PermissionResolver {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    fn profile(&self, principal: &Principal) -> Result<Profile> {
        Ok(self
            .store
            .get_profile(&principal.username)?
            .unwrap_or_else(|| Profile::empty(&principal.username)))
    }

    fn ambulances(&self, principal: &Principal, access: Access) -> Result<BTreeSet<AmbulanceId>> {
        if principal.is_admin {
            return Ok(self
                .store
                .filter_ambulances(&|_| true)?
                .into_iter()
                .map(|a| a.id)
                .collect());
        }
        Ok(self
            .profile(principal)?
            .ambulances
            .iter()
            .filter(|g| access.granted(g.can_read, g.can_write))
            .map(|g| g.ambulance_id)
            .collect())
    }

    fn hospitals(&self, principal: &Principal, access: Access) -> Result<BTreeSet<HospitalId>> {
        if principal.is_admin {
            return Ok(self
                .store
                .filter_hospitals(&|_| true)?
                .into_iter()
                .map(|h| h.id)
                .collect());
        }
        Ok(self
            .profile(principal)?
            .hospitals
            .iter()
            .filter(|g| access.granted(g.can_read, g.can_write))
            .map(|g| g.hospital_id)
            .collect())
    }

    pub fn readable_ambulances(&self, principal: &Principal) -> Result<BTreeSet<AmbulanceId>> {
        self.ambulances(principal, Access::Read)
    }

    pub fn writable_ambulances(&self, principal: &Principal) -> Result<BTreeSet<AmbulanceId>> {
        self.ambulances(principal, Access::Write)
    }

    pub fn readable_hospitals(&self, principal: &Principal) -> Result<BTreeSet<HospitalId>> {
        self.hospitals(principal, Access::Read)
    }

    pub fn writable_hospitals(&self, principal: &Principal) -> Result<BTreeSet<HospitalId>> {
        self.hospitals(principal, Access::Write)
    }

    fn check(
        &self,
        principal: &Principal,
        access: Access,
        kind: EntityKind,
        id: u64,
    ) -> Result<()> {
        let allowed = match kind {
            EntityKind::Hospital | EntityKind::HospitalEquipment => {
                self.hospitals(principal, access)?.contains(&id)
            }
            _ => self.ambulances(principal, access)?.contains(&id),
        };
        if allowed {
            Ok(())
        } else {
            Err(SyncError::AuthorizationDenied {
                username: principal.username.clone(),
                action: access.verb(),
                kind,
                id: id.to_string(),
            })
        }
    }

    /// `AuthorizationDenied` unless the principal may read the ambulance
    pub fn authorize_read_ambulance(&self, principal: &Principal, id: AmbulanceId) -> Result<()> {
        self.check(principal, Access::Read, EntityKind::Ambulance, id)
    }

    /// `AuthorizationDenied` unless the principal may write the ambulance
    pub fn authorize_write_ambulance(&self, principal: &Principal, id: AmbulanceId) -> Result<()> {
        self.check(principal, Access::Write, EntityKind::Ambulance, id)
    }

    /// `AuthorizationDenied` unless the principal may read the hospital
    pub fn authorize_read_hospital(&self, principal: &Principal, id: HospitalId) -> Result<()> {
        self.check(principal, Access::Read, EntityKind::Hospital, id)
    }

    /// Equipment rows inherit the write permission of their hospital
    pub fn authorize_write_hospital(&self, principal: &Principal, id: HospitalId) -> Result<()> {
        self.check(principal, Access::Write, EntityKind::Hospital, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::sample_store;

    fn resolver() -> PermissionResolver {
        PermissionResolver::new(sample_store())
    }

    #[test]
    fn test_no_profile_means_no_access() {
        let resolver = resolver();
        let stranger = Principal::user("nobody");
        assert!(resolver.readable_ambulances(&stranger).unwrap().is_empty());
        assert!(resolver.writable_hospitals(&stranger).unwrap().is_empty());
    }

    #[test]
    fn test_grants_split_read_and_write() {
        let resolver = resolver();
        let user = Principal::user("testuser1");

        assert_eq!(
            resolver.readable_ambulances(&user).unwrap(),
            BTreeSet::from([1])
        );
        assert!(resolver.writable_ambulances(&user).unwrap().is_empty());
        assert_eq!(resolver.readable_hospitals(&user).unwrap(), BTreeSet::from([1]));
        assert_eq!(resolver.writable_hospitals(&user).unwrap(), BTreeSet::from([1]));
    }

    #[test]
    fn test_admin_short_circuits_grants() {
        let resolver = resolver();
        let admin = Principal::admin("admin");
        assert_eq!(
            resolver.readable_ambulances(&admin).unwrap(),
            BTreeSet::from([1, 2, 3])
        );
        assert_eq!(
            resolver.writable_hospitals(&admin).unwrap(),
            BTreeSet::from([1, 2])
        );
    }

    #[test]
    fn test_grants_are_not_cached() {
        let store = sample_store();
        let resolver = PermissionResolver::new(store.clone());
        let user = Principal::user("testuser2");
        assert!(resolver.writable_ambulances(&user).unwrap().contains(&2));

        let mut profile = store.get_profile("testuser2").unwrap().unwrap();
        profile.ambulances.clear();
        store.save_profile(profile).unwrap();

        assert!(resolver.writable_ambulances(&user).unwrap().is_empty());
    }

    #[test]
    fn test_authorize_errors_carry_context() {
        let resolver = resolver();
        let user = Principal::user("testuser1");
        assert!(resolver.authorize_read_ambulance(&user, 1).is_ok());
        let err = resolver.authorize_write_ambulance(&user, 1).unwrap_err();
        match err {
            SyncError::AuthorizationDenied {
                username, action, ..
            } => {
                assert_eq!(username, "testuser1");
                assert_eq!(action, "write");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(resolver.authorize_read_hospital(&user, 2).is_err());
        assert!(resolver.authorize_write_hospital(&user, 1).is_ok());
    }
}
