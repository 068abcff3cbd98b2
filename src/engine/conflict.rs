use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::ConflictReason;
use super::EngineError;

/// Half-open overlap. The one predicate used for every slot and appointment check.
pub fn overlaps(a: &TimeRange, b: &TimeRange) -> bool {
    a.overlaps(b)
}

/// Build a range from raw instants, rejecting `start >= end`.
pub fn make_range(start: Ms, end: Ms) -> Result<TimeRange, EngineError> {
    TimeRange::try_new(start, end).ok_or(EngineError::InvalidRange {
        range: TimeRange { start, end },
        reason: "start must be before end",
    })
}

/// Shape and bounds checks for a range a provider wants to open.
pub fn validate_range(range: &TimeRange, now: Ms) -> Result<(), EngineError> {
    let invalid = |reason| EngineError::InvalidRange { range: *range, reason };
    if range.start >= range.end {
        return Err(invalid("start must be before end"));
    }
    if range.start < MIN_VALID_TIMESTAMP_MS || range.end > MAX_VALID_TIMESTAMP_MS {
        return Err(invalid("timestamp out of range"));
    }
    if range.duration_ms() > MAX_SLOT_DURATION_MS {
        return Err(invalid("slot too long"));
    }
    if range.start <= now {
        return Err(invalid("starts in the past"));
    }
    Ok(())
}

/// First Open slot overlapping `range`, skipping `ignore`.
pub fn find_slot_conflict<'a>(
    state: &'a ProviderState,
    range: &TimeRange,
    ignore: Option<SlotId>,
) -> Option<&'a Slot> {
    state
        .slots_overlapping(range)
        .filter(|s| s.is_open() && Some(s.id) != ignore)
        .find(|s| overlaps(&s.range, range))
}

/// First Pending/Confirmed appointment overlapping `range`, skipping `ignore`.
pub fn find_appointment_conflict<'a>(
    state: &'a ProviderState,
    range: &TimeRange,
    ignore: Option<AppointmentId>,
) -> Option<&'a Appointment> {
    state
        .appointments_overlapping(range)
        .filter(|a| a.status.is_active() && Some(a.id) != ignore)
        .find(|a| overlaps(&a.range, range))
}

/// A new Open slot may not overlap another Open slot nor an active appointment.
pub fn check_no_conflict(state: &ProviderState, range: &TimeRange) -> Result<(), EngineError> {
    if let Some(slot) = find_slot_conflict(state, range, None) {
        return Err(EngineError::Conflict(ConflictReason::OverlapsSlot(slot.id)));
    }
    check_appointments_clear(state, range, None)
}

pub fn check_appointments_clear(
    state: &ProviderState,
    range: &TimeRange,
    ignore: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_appointment_conflict(state, range, ignore) {
        Some(a) => Err(EngineError::Conflict(ConflictReason::OverlapsAppointment(a.id))),
        None => Ok(()),
    }
}
