//! Consumer-side read replica and the diff that brings it back in line with the store.
//!
//! A [`ReplicaCache`] never writes anything. It is rebuilt from [`ProviderSnapshot`]s and
//! tracks, per slot, whether the local user is in the middle of picking it ("selecting").

pub mod poller;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::engine::{ConflictReason, EngineError, Scheduler};
use crate::model::*;

pub use poller::{JitteredInterval, PollConfig, PollStrategy, Poller, PollerHandle, Trigger};

/// Anything that can hand out an authoritative view of one provider.
#[async_trait]
pub trait SyncSource: Send + Sync {
    async fn fetch(&self, provider_id: UserId) -> Result<ProviderSnapshot, EngineError>;
}

#[async_trait]
impl SyncSource for Scheduler {
    async fn fetch(&self, provider_id: UserId) -> Result<ProviderSnapshot, EngineError> {
        self.snapshot(provider_id).await
    }
}

/// Slot state as the local user sees it. `Selecting` exists only here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalSlotState {
    Open,
    Selecting,
    Claimed,
}

/// What one reconciliation changed in the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub added: Vec<Slot>,
    pub removed: Vec<Slot>,
    /// Slots present on both sides whose status moved.
    pub slot_changes: Vec<Slot>,
    /// Appointments that are new or whose status or notes changed.
    pub status_changed: Vec<Appointment>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.slot_changes.is_empty()
            && self.status_changed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaCache {
    provider_id: UserId,
    slots: Vec<Slot>,
    appointments: Vec<Appointment>,
    selecting: HashSet<SlotId>,
    last_synced_at: Option<Ms>,
    max_staleness: Ms,
    invalidated: bool,
}

impl ReplicaCache {
    pub fn new(provider_id: UserId, max_staleness: Ms) -> Self {
        Self {
            provider_id,
            slots: Vec::new(),
            appointments: Vec::new(),
            selecting: HashSet::new(),
            last_synced_at: None,
            max_staleness,
            invalidated: false,
        }
    }

    pub fn provider_id(&self) -> UserId {
        self.provider_id
    }

    pub fn last_synced_at(&self) -> Option<Ms> {
        self.last_synced_at
    }

    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    /// Never synced, explicitly invalidated, or older than the staleness window.
    pub fn is_stale(&self, now: Ms) -> bool {
        match self.last_synced_at {
            None => true,
            Some(_) if self.invalidated => true,
            Some(at) => now.saturating_sub(at) >= self.max_staleness,
        }
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn appointments(&self) -> &[Appointment] {
        &self.appointments
    }

    pub fn slot_state(&self, slot_id: SlotId) -> Option<LocalSlotState> {
        let slot = self.slots.iter().find(|s| s.id == slot_id)?;
        Some(self.local_state(slot))
    }

    /// Every cached slot with its local state, in store order.
    pub fn view(&self) -> Vec<(Slot, LocalSlotState)> {
        self.slots
            .iter()
            .map(|s| (s.clone(), self.local_state(s)))
            .collect()
    }

    fn local_state(&self, slot: &Slot) -> LocalSlotState {
        match slot.status {
            SlotStatus::Claimed => LocalSlotState::Claimed,
            SlotStatus::Open if self.selecting.contains(&slot.id) => LocalSlotState::Selecting,
            SlotStatus::Open => LocalSlotState::Open,
        }
    }

    /// Mark an Open slot as being picked. Purely local; the store is not consulted.
    pub fn select(&mut self, slot_id: SlotId) -> Result<(), EngineError> {
        let slot = self
            .slots
            .iter()
            .find(|s| s.id == slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        if !slot.is_open() {
            return Err(EngineError::Conflict(ConflictReason::AlreadyBooked));
        }
        self.selecting.insert(slot_id);
        Ok(())
    }

    pub fn release(&mut self, slot_id: SlotId) {
        self.selecting.remove(&slot_id);
    }

    /// Replace the cached state with `snapshot` and report the difference.
    pub fn apply(&mut self, snapshot: ProviderSnapshot) -> Delta {
        let old_slots: HashMap<SlotId, &Slot> = self.slots.iter().map(|s| (s.id, s)).collect();
        let new_ids: HashSet<SlotId> = snapshot.slots.iter().map(|s| s.id).collect();
        let old_appts: HashMap<AppointmentId, &Appointment> =
            self.appointments.iter().map(|a| (a.id, a)).collect();

        let mut delta = Delta::default();
        for slot in &snapshot.slots {
            match old_slots.get(&slot.id) {
                None => delta.added.push(slot.clone()),
                Some(old) if old.status != slot.status => delta.slot_changes.push(slot.clone()),
                Some(_) => {}
            }
        }
        delta.removed = self
            .slots
            .iter()
            .filter(|s| !new_ids.contains(&s.id))
            .cloned()
            .collect();
        delta.status_changed = snapshot
            .appointments
            .iter()
            .filter(|a| {
                old_appts
                    .get(&a.id)
                    .is_none_or(|old| old.status != a.status || old.notes != a.notes)
            })
            .cloned()
            .collect();

        self.selecting.retain(|id| {
            snapshot
                .slots
                .iter()
                .any(|s| s.id == *id && s.is_open())
        });
        self.slots = snapshot.slots;
        self.appointments = snapshot.appointments;
        self.last_synced_at = Some(snapshot.taken_at);
        self.invalidated = false;
        delta
    }
}

/// Fetch the provider's current state and fold it into `cache`.
pub async fn reconcile(
    source: &dyn SyncSource,
    cache: &mut ReplicaCache,
) -> Result<Delta, EngineError> {
    let snapshot = source.fetch(cache.provider_id()).await?;
    Ok(cache.apply(snapshot))
}
