//! Call-scoped ambulance history
//!
//! Reconstructs what an ambulance did while assigned to a call: its recorded
//! updates filtered to the call's active windows. Read-only.
//!
//! Active windows come from the ambulance's phase transitions on the call
//! when any are recorded. Entries are taken in timestamp order; `ongoing`
//! opens a window, `suspended` or `completed` closes the open one. A window
//! still open after the last entry has no upper bound. Without recorded
//! transitions the call's own `started_at`/`ended_at` bound a single window.

use crate::error::{Result, SyncError};
use crate::events::EntityKind;
use crate::store::models::*;
use crate::store::traits::EntityStore;
use crate::sync::permissions::PermissionResolver;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Time range during which an ambulance counts as assigned; bounds inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveWindow {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl ActiveWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && self.end.map_or(true, |end| at <= end)
    }
}

/// Active windows of an ambulance on a call
pub fn active_windows(call: &Call, history: Option<&AmbulanceCallHistory>) -> Vec<ActiveWindow> {
    match history {
        Some(history) if !history.entries.is_empty() => merge_phases(&history.entries),
        _ => call_window(call).into_iter().collect(),
    }
}

fn call_window(call: &Call) -> Option<ActiveWindow> {
    call.started_at.map(|start| ActiveWindow {
        start,
        end: call.ended_at,
    })
}

fn merge_phases(entries: &[CallHistoryEntry]) -> Vec<ActiveWindow> {
    let mut sorted: Vec<&CallHistoryEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| e.timestamp);

    let mut windows = Vec::new();
    let mut open: Option<DateTime<Utc>> = None;
    for entry in sorted {
        match (entry.phase, open) {
            (CallPhase::Ongoing, None) => open = Some(entry.timestamp),
            (CallPhase::Suspended | CallPhase::Completed, Some(start)) => {
                windows.push(ActiveWindow {
                    start,
                    end: Some(entry.timestamp),
                });
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start) = open {
        windows.push(ActiveWindow { start, end: None });
    }
    windows
}

#[derive(Clone)]
pub struct HistoryResolver {
    store: Arc<dyn EntityStore>,
    permissions: PermissionResolver,
}

impl HistoryResolver {
    pub fn new(store: Arc<dyn EntityStore>, permissions: PermissionResolver) -> Self {
        Self { store, permissions }
    }

    /// Updates of `ambulance_id` within the active windows of `call_id`,
    /// oldest first
    pub fn history(&self, ambulance_id: AmbulanceId, call_id: CallId) -> Result<Vec<AmbulanceUpdate>> {
        if self.store.get_ambulance(ambulance_id)?.is_none() {
            return Err(SyncError::not_found(EntityKind::Ambulance, ambulance_id));
        }
        let call = self
            .store
            .get_call(call_id)?
            .ok_or_else(|| SyncError::not_found(EntityKind::Call, call_id))?;
        let phases = self.store.ambulance_call_history(ambulance_id, call_id)?;

        let windows = active_windows(&call, phases.as_ref());
        if windows.is_empty() {
            return Ok(Vec::new());
        }

        let mut updates: Vec<AmbulanceUpdate> = self
            .store
            .ambulance_updates(ambulance_id)?
            .into_iter()
            .filter(|u| windows.iter().any(|w| w.contains(u.timestamp)))
            .collect();
        updates.sort_by_key(|u| u.timestamp);
        Ok(updates)
    }

    /// Same window as [`history`](Self::history), newest first
    pub fn history_latest_first(
        &self,
        ambulance_id: AmbulanceId,
        call_id: CallId,
    ) -> Result<Vec<AmbulanceUpdate>> {
        let mut updates = self.history(ambulance_id, call_id)?;
        updates.reverse();
        Ok(updates)
    }

    /// History on behalf of a principal, who needs read access to the ambulance
    pub fn history_for(
        &self,
        principal: &Principal,
        ambulance_id: AmbulanceId,
        call_id: CallId,
    ) -> Result<Vec<AmbulanceUpdate>> {
        self.permissions
            .authorize_read_ambulance(principal, ambulance_id)?;
        self.history(ambulance_id, call_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{at, sample_store};

    fn resolver() -> HistoryResolver {
        let store = sample_store();
        HistoryResolver::new(store.clone(), PermissionResolver::new(store))
    }

    fn minutes(updates: &[AmbulanceUpdate]) -> Vec<i64> {
        updates
            .iter()
            .map(|u| (u.timestamp - at(0)).num_minutes())
            .collect()
    }

    #[test]
    fn test_closed_call_window_is_inclusive() {
        let updates = resolver().history(1, 1).unwrap();
        assert_eq!(minutes(&updates), vec![10, 20, 30]);
    }

    #[test]
    fn test_open_call_has_no_upper_bound() {
        let updates = resolver().history(1, 2).unwrap();
        assert_eq!(minutes(&updates), vec![30, 40, 50]);
    }

    #[test]
    fn test_unstarted_call_is_empty() {
        assert!(resolver().history(1, 3).unwrap().is_empty());
    }

    #[test]
    fn test_phase_history_takes_precedence() {
        let updates = resolver().history(1, 4).unwrap();
        // ongoing 0..10, suspended, ongoing again from 40
        assert_eq!(minutes(&updates), vec![0, 10, 40, 50]);
    }

    #[test]
    fn test_latest_first_reverses_order() {
        let updates = resolver().history_latest_first(1, 1).unwrap();
        assert_eq!(minutes(&updates), vec![30, 20, 10]);
    }

    #[test]
    fn test_missing_call_or_ambulance_is_not_found() {
        let resolver = resolver();
        assert!(matches!(
            resolver.history(1, 99),
            Err(SyncError::NotFound { kind: EntityKind::Call, .. })
        ));
        assert!(matches!(
            resolver.history(99, 1),
            Err(SyncError::NotFound { kind: EntityKind::Ambulance, .. })
        ));
    }

    #[test]
    fn test_history_for_requires_read_grant() {
        let resolver = resolver();
        assert!(resolver.history_for(&Principal::user("testuser1"), 1, 1).is_ok());
        assert!(matches!(
            resolver.history_for(&Principal::user("testuser2"), 1, 1),
            Err(SyncError::AuthorizationDenied { action: "read", .. })
        ));
    }

    #[test]
    fn test_merge_ignores_redundant_transitions() {
        let entries = vec![
            CallHistoryEntry {
                phase: CallPhase::Ongoing,
                timestamp: at(5),
            },
            CallHistoryEntry {
                phase: CallPhase::Completed,
                timestamp: at(25),
            },
            CallHistoryEntry {
                phase: CallPhase::Ongoing,
                timestamp: at(0),
            },
            CallHistoryEntry {
                phase: CallPhase::Suspended,
                timestamp: at(30),
            },
        ];
        assert_eq!(
            merge_phases(&entries),
            vec![ActiveWindow {
                start: at(0),
                end: Some(at(25))
            }]
        );
    }
}
