use tracing::info;

use crate::limits::*;
use crate::model::AppointmentStatus::{Cancelled, Completed, Confirmed, Pending};
use crate::model::*;
use crate::notify::NoticeKind;
use crate::store::StatusChange;

use super::{EngineError, Scheduler};

/// The lifecycle graph. Completed and Cancelled have no way out and nothing returns to Pending.
pub fn allowed_transition(from: AppointmentStatus, to: AppointmentStatus) -> bool {
    matches!(
        (from, to),
        (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
    )
}

/// Legality first, then authority. Requesters may only cancel their own appointments;
/// the owning provider and admins may take any legal step.
pub fn can_transition(
    actor: &Actor,
    appointment: &Appointment,
    to: AppointmentStatus,
) -> Result<(), EngineError> {
    let from = appointment.status;
    if !allowed_transition(from, to) {
        return Err(EngineError::InvalidTransition { from, to });
    }

    let permitted = match actor.role {
        Role::Admin => true,
        Role::Provider => actor.id == appointment.provider_id,
        Role::Requester => actor.id == appointment.requester_id && to == Cancelled,
    };
    if permitted {
        Ok(())
    } else {
        Err(EngineError::Unauthorized(format!(
            "{actor} may not move appointment {} from {from} to {to}",
            appointment.id
        )))
    }
}

impl Scheduler {
    pub async fn update_status(
        &self,
        appointment_id: AppointmentId,
        to: AppointmentStatus,
        actor: &Actor,
        notes: Option<&str>,
    ) -> Result<Appointment, EngineError> {
        let note = notes.map(str::trim).filter(|n| !n.is_empty());
        if note.is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::Validation(format!(
                "notes longer than {MAX_NOTES_LEN} bytes"
            )));
        }

        let current = self
            .store
            .get_appointment(appointment_id)
            .await?
            .ok_or(EngineError::NotFound(appointment_id))?;
        can_transition(actor, &current, to)?;

        let updated = self
            .store
            .update_appointment_status(StatusChange {
                appointment_id,
                expected: current.status,
                next: to,
                note: note.map(str::to_string),
                reopen_slot: to == Cancelled && self.policy.reopen_slot_on_cancel,
            })
            .await?;

        info!(
            "appointment {appointment_id} {} -> {to} by {actor}",
            current.status
        );
        self.notify(
            NoticeKind::StatusChanged {
                from: current.status,
                to,
            },
            &updated,
        );
        Ok(updated)
    }
}
