use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::NoticeKind;
use crate::observability;
use crate::store::StatusChange;

use super::conflict::check_appointments_clear;
use super::{ConflictReason, EngineError, Scheduler};

impl Scheduler {
    /// Claim `slot_id` for `actor` as a Pending appointment.
    ///
    /// Losing a race to another booking returns `Conflict(AlreadyBooked)`. Never retried here.
    pub async fn book(
        &self,
        slot_id: SlotId,
        actor: &Actor,
        purpose: &str,
    ) -> Result<Appointment, EngineError> {
        self.book_with_id(Ulid::new(), slot_id, actor, purpose).await
    }

    pub async fn book_with_id(
        &self,
        id: AppointmentId,
        slot_id: SlotId,
        actor: &Actor,
        purpose: &str,
    ) -> Result<Appointment, EngineError> {
        if actor.role != Role::Requester {
            return Err(EngineError::Unauthorized(format!("{actor} cannot book appointments")));
        }
        if purpose.len() > MAX_PURPOSE_LEN {
            return Err(EngineError::Validation(format!(
                "purpose longer than {MAX_PURPOSE_LEN} bytes"
            )));
        }

        let result = self.try_claim(id, slot_id, actor, purpose).await;
        let outcome = match &result {
            Ok(_) => "won",
            Err(EngineError::Conflict(_)) => "lost",
            Err(_) => "error",
        };
        metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);

        let appointment = result?;
        info!(
            "appointment {} booked on slot {slot_id} by {actor}",
            appointment.id
        );
        self.notify(NoticeKind::Booked, &appointment);
        Ok(appointment)
    }

    async fn try_claim(
        &self,
        id: AppointmentId,
        slot_id: SlotId,
        actor: &Actor,
        purpose: &str,
    ) -> Result<Appointment, EngineError> {
        let slot = self
            .store
            .get_slot(slot_id)
            .await?
            .ok_or(EngineError::NotFound(slot_id))?;
        if !slot.is_open() {
            return Err(EngineError::already_booked());
        }
        let now = self.now();
        if slot.range.start <= now {
            return Err(EngineError::Conflict(ConflictReason::Expired));
        }

        // Advisory; the store repeats it under the provider lock.
        let state = self.store.provider_state(slot.provider_id).await?;
        if let Err(e) = check_appointments_clear(&state, &slot.range, None) {
            debug!("booking of slot {slot_id} rejected before commit: {e}");
            return Err(e);
        }

        let appointment = Appointment {
            id,
            slot_id,
            provider_id: slot.provider_id,
            requester_id: actor.id,
            range: slot.range,
            status: AppointmentStatus::Pending,
            purpose: purpose.to_string(),
            notes: String::new(),
            created_at: now,
        };
        self.store.claim_slot_and_insert_appointment(appointment).await
    }

    /// Cancel an active appointment. Open to both parties and admins.
    pub async fn cancel(
        &self,
        appointment_id: AppointmentId,
        actor: &Actor,
        reason: Option<&str>,
    ) -> Result<Appointment, EngineError> {
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        if reason.is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::Validation(format!(
                "reason longer than {MAX_REASON_LEN} bytes"
            )));
        }

        let current = self
            .store
            .get_appointment(appointment_id)
            .await?
            .ok_or(EngineError::NotFound(appointment_id))?;
        if !(actor.is_admin() || current.involves(actor.id)) {
            return Err(EngineError::Unauthorized(format!(
                "{actor} is not a party to appointment {appointment_id}"
            )));
        }
        if !current.status.is_active() {
            return Err(EngineError::State(format!(
                "appointment {appointment_id} is already {}",
                current.status
            )));
        }

        let cancelled = self
            .store
            .update_appointment_status(StatusChange {
                appointment_id,
                expected: current.status,
                next: AppointmentStatus::Cancelled,
                note: reason.map(|r| format!("Cancellation reason: {r}")),
                reopen_slot: self.policy.reopen_slot_on_cancel,
            })
            .await?;

        info!("appointment {appointment_id} cancelled by {actor}");
        self.notify(
            NoticeKind::Cancelled {
                reason: reason.map(str::to_string),
            },
            &cancelled,
        );
        Ok(cancelled)
    }
}
