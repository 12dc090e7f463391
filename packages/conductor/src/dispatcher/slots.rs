//! Per-group concurrency slots.
//!
//! Process-local counters mirroring each group's `max_active_jobs`. The
//! database is the authority: `reconcile` snaps a counter back to the
//! store's active count, healing any drift from crashes or missed
//! completions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::store::ManifestGroup;

#[derive(Debug, Default)]
struct SlotState {
    limit: Option<i64>,
    in_flight: i64,
}

/// Shared slot table. Permits release on drop.
#[derive(Debug, Default)]
pub struct GroupSlots {
    inner: Mutex<HashMap<Uuid, SlotState>>,
}

impl GroupSlots {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Try to take a slot for the group. `None` when the group is saturated.
    pub fn try_acquire(self: &Arc<Self>, group: &ManifestGroup) -> Option<SlotPermit> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let state = inner.entry(group.id).or_default();
        state.limit = group.max_active_jobs.map(i64::from);

        if let Some(limit) = state.limit {
            if state.in_flight >= limit {
                return None;
            }
        }
        state.in_flight += 1;
        Some(SlotPermit {
            slots: Arc::clone(self),
            group_id: group.id,
        })
    }

    /// Snap a group's counter to the store's count of active jobs.
    pub fn reconcile(&self, group_id: Uuid, db_active: i64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let state = inner.entry(group_id).or_default();
        state.in_flight = db_active.max(0);
    }

    /// Current in-flight count for a group (testing and introspection).
    pub fn in_flight(&self, group_id: Uuid) -> i64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&group_id)
            .map(|s| s.in_flight)
            .unwrap_or(0)
    }

    fn release(&self, group_id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = inner.get_mut(&group_id) {
            state.in_flight = (state.in_flight - 1).max(0);
        }
    }
}

/// RAII slot; dropping it returns the slot to the group.
#[derive(Debug)]
pub struct SlotPermit {
    slots: Arc<GroupSlots>,
    group_id: Uuid,
}

impl SlotPermit {
    pub fn group_id(&self) -> Uuid {
        self.group_id
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.slots.release(self.group_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounded_group(max: i32) -> ManifestGroup {
        ManifestGroup::builder()
            .name("etl".to_string())
            .max_active_jobs(max)
            .build()
    }

    #[test]
    fn saturated_group_refuses_permits() {
        let slots = GroupSlots::new();
        let group = bounded_group(2);

        let _a = slots.try_acquire(&group).expect("first slot");
        let _b = slots.try_acquire(&group).expect("second slot");
        assert!(slots.try_acquire(&group).is_none());
    }

    #[test]
    fn dropping_a_permit_frees_the_slot() {
        let slots = GroupSlots::new();
        let group = bounded_group(1);

        let permit = slots.try_acquire(&group).expect("slot");
        assert!(slots.try_acquire(&group).is_none());
        drop(permit);
        assert!(slots.try_acquire(&group).is_some());
    }

    #[test]
    fn unbounded_group_never_saturates() {
        let slots = GroupSlots::new();
        let group = ManifestGroup::named("free");
        let permits: Vec<_> = (0..100)
            .map(|_| slots.try_acquire(&group).expect("slot"))
            .collect();
        assert_eq!(slots.in_flight(group.id), 100);
        drop(permits);
        assert_eq!(slots.in_flight(group.id), 0);
    }

    #[test]
    fn reconcile_snaps_to_database_count() {
        let slots = GroupSlots::new();
        let group = bounded_group(3);

        let _a = slots.try_acquire(&group).expect("slot");
        // A crashed worker left the counter stale; the DB says one active.
        slots.reconcile(group.id, 1);
        assert_eq!(slots.in_flight(group.id), 1);

        // Drift the other way: DB says nothing is active.
        slots.reconcile(group.id, 0);
        assert!(slots.try_acquire(&group).is_some());
    }

    #[test]
    fn limit_updates_follow_the_group_definition() {
        let slots = GroupSlots::new();
        let mut group = bounded_group(1);

        let _a = slots.try_acquire(&group).expect("slot");
        assert!(slots.try_acquire(&group).is_none());

        // Operator raises the ceiling; next acquire sees it.
        group.max_active_jobs = Some(2);
        assert!(slots.try_acquire(&group).is_some());
    }
}
