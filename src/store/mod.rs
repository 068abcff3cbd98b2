//! Persistence boundary for slots and appointments.
//!
//! Every conditional write (`*_if_*`, claim, status change) re-checks its precondition inside
//! the store's own critical section. Whatever the caller checked beforehand is advisory.

mod wal_store;

pub use wal_store::WalStore;

use async_trait::async_trait;

use crate::engine::EngineError;
use crate::model::*;

/// Compare-and-swap on an appointment's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub appointment_id: AppointmentId,
    /// Status the caller validated against. The write fails if it moved.
    pub expected: AppointmentStatus,
    pub next: AppointmentStatus,
    /// Appended to the appointment's notes on its own line.
    pub note: Option<String>,
    /// Put the originating slot back to Open when `next` is Cancelled.
    pub reopen_slot: bool,
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Persist a new Open slot unless it overlaps an Open slot or an active appointment.
    async fn insert_slot_if_no_conflict(
        &self,
        id: SlotId,
        provider_id: UserId,
        range: TimeRange,
    ) -> Result<Slot, EngineError>;

    /// Delete a slot that is still Open.
    async fn remove_slot_if_open(&self, slot_id: SlotId) -> Result<Slot, EngineError>;

    /// Flip the slot Open→Claimed and insert `appointment` in one commit.
    async fn claim_slot_and_insert_appointment(
        &self,
        appointment: Appointment,
    ) -> Result<Appointment, EngineError>;

    async fn update_appointment_status(
        &self,
        change: StatusChange,
    ) -> Result<Appointment, EngineError>;

    async fn get_slot(&self, id: SlotId) -> Result<Option<Slot>, EngineError>;

    async fn get_appointment(&self, id: AppointmentId) -> Result<Option<Appointment>, EngineError>;

    /// Slots overlapping `window`, ordered by `(start, seq)`.
    async fn list_slots_by_provider(
        &self,
        provider_id: UserId,
        window: TimeRange,
    ) -> Result<Vec<Slot>, EngineError>;

    async fn list_appointments_by_provider(
        &self,
        provider_id: UserId,
    ) -> Result<Vec<Appointment>, EngineError>;

    async fn list_appointments_by_requester(
        &self,
        requester_id: UserId,
    ) -> Result<Vec<Appointment>, EngineError>;

    async fn list_all_appointments(&self) -> Result<Vec<Appointment>, EngineError>;

    /// Slots and appointments of one provider read under a single lock.
    async fn provider_state(&self, provider_id: UserId) -> Result<ProviderState, EngineError>;
}
