use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub type UserId = Ulid;
pub type SlotId = Ulid;
pub type AppointmentId = Ulid;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Ms,
    pub end: Ms,
}

impl TimeRange {
    /// Unchecked constructor for ranges already known to be well-formed.
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "TimeRange start must be before end");
        Self { start, end }
    }

    /// Returns `None` when `start >= end`.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Provider,
    Requester,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Provider => "provider",
            Role::Requester => "requester",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "provider" | "lawyer" => Ok(Role::Provider),
            "requester" | "client" | "customer" => Ok(Role::Requester),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Who is calling. Supplied by the identity boundary on every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn provider(id: UserId) -> Self {
        Self { id, role: Role::Provider }
    }

    pub fn requester(id: UserId) -> Self {
        Self { id, role: Role::Requester }
    }

    pub fn admin(id: UserId) -> Self {
        Self { id, role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role.as_str(), self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    Open,
    Claimed,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Open => "open",
            SlotStatus::Claimed => "claimed",
        }
    }
}

/// A provider-declared open time range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub provider_id: UserId,
    pub range: TimeRange,
    pub status: SlotStatus,
    /// Store-assigned insertion sequence. Breaks ties between equal start instants.
    pub seq: u64,
}

impl Slot {
    pub fn is_open(&self) -> bool {
        self.status == SlotStatus::Open
    }

    pub fn cursor(&self) -> SlotCursor {
        SlotCursor {
            start: self.range.start,
            seq: self.seq,
        }
    }
}

/// Position in the `(start, seq)` ordering of a provider's slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotCursor {
    pub start: Ms,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 4] = [
        AppointmentStatus::Pending,
        AppointmentStatus::Confirmed,
        AppointmentStatus::Completed,
        AppointmentStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    /// Pending and Confirmed appointments hold the provider's time.
    pub fn is_active(&self) -> bool {
        matches!(self, AppointmentStatus::Pending | AppointmentStatus::Confirmed)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(AppointmentStatus::Pending),
            "confirmed" => Ok(AppointmentStatus::Confirmed),
            "completed" => Ok(AppointmentStatus::Completed),
            "cancelled" | "canceled" => Ok(AppointmentStatus::Cancelled),
            other => Err(format!("unknown appointment status: {other}")),
        }
    }
}

/// A pending or confirmed commitment between a requester and a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub slot_id: SlotId,
    pub provider_id: UserId,
    pub requester_id: UserId,
    pub range: TimeRange,
    pub status: AppointmentStatus,
    pub purpose: String,
    pub notes: String,
    pub created_at: Ms,
}

impl Appointment {
    pub fn involves(&self, user: UserId) -> bool {
        self.provider_id == user || self.requester_id == user
    }
}

/// Append `addition` to `notes` on its own line. Empty additions are ignored.
pub fn append_note(notes: &str, addition: &str) -> String {
    let addition = addition.trim();
    if addition.is_empty() {
        return notes.to_string();
    }
    if notes.is_empty() {
        addition.to_string()
    } else {
        format!("{notes}\n{addition}")
    }
}

/// Everything the store holds for one provider.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub provider_id: UserId,
    /// Sorted by `(range.start, seq)`.
    pub slots: Vec<Slot>,
    /// Sorted by `range.start`, insertion order among equal starts.
    pub appointments: Vec<Appointment>,
}

impl ProviderState {
    pub fn new(provider_id: UserId) -> Self {
        Self {
            provider_id,
            slots: Vec::new(),
            appointments: Vec::new(),
        }
    }

    /// Insert keeping `(start, seq)` order.
    pub fn insert_slot(&mut self, slot: Slot) {
        let key = slot.cursor();
        let pos = self.slots.partition_point(|s| s.cursor() < key);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, id: SlotId) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn slot_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }

    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let start = appointment.range.start;
        let pos = self
            .appointments
            .partition_point(|a| a.range.start <= start);
        self.appointments.insert(pos, appointment);
    }

    pub fn appointment(&self, id: AppointmentId) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn appointment_mut(&mut self, id: AppointmentId) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Slots whose range overlaps `window`.
    /// Uses binary search to skip slots starting at or after `window.end`.
    pub fn slots_overlapping(&self, window: &TimeRange) -> impl Iterator<Item = &Slot> {
        let right_bound = self.slots.partition_point(|s| s.range.start < window.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.range.end > window.start)
    }

    pub fn appointments_overlapping(&self, window: &TimeRange) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.range.start < window.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.range.end > window.start)
    }
}

/// WAL record format. One record per committed state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotAdded {
        id: SlotId,
        provider_id: UserId,
        range: TimeRange,
        seq: u64,
    },
    SlotRemoved {
        id: SlotId,
        provider_id: UserId,
    },
    /// Open→Claimed plus the appointment it produced, as one record.
    SlotClaimed {
        slot_id: SlotId,
        provider_id: UserId,
        appointment: Appointment,
    },
    AppointmentStatusChanged {
        id: AppointmentId,
        provider_id: UserId,
        status: AppointmentStatus,
        notes: String,
        reopened_slot: Option<SlotId>,
    },
    /// Compaction output: raw slot state.
    SlotRestored {
        slot: Slot,
    },
    /// Compaction output: raw appointment state.
    AppointmentRestored {
        appointment: Appointment,
    },
}

impl Event {
    pub fn provider_id(&self) -> UserId {
        match self {
            Event::SlotAdded { provider_id, .. }
            | Event::SlotRemoved { provider_id, .. }
            | Event::SlotClaimed { provider_id, .. }
            | Event::AppointmentStatusChanged { provider_id, .. } => *provider_id,
            Event::SlotRestored { slot } => slot.provider_id,
            Event::AppointmentRestored { appointment } => appointment.provider_id,
        }
    }
}

/// Consistent read of one provider's slots and appointments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSnapshot {
    pub provider_id: UserId,
    pub slots: Vec<Slot>,
    pub appointments: Vec<Appointment>,
    pub taken_at: Ms,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub confirmed: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub total: u64,
}

impl StatusCounts {
    pub fn record(&mut self, status: AppointmentStatus) {
        match status {
            AppointmentStatus::Pending => self.pending += 1,
            AppointmentStatus::Confirmed => self.confirmed += 1,
            AppointmentStatus::Completed => self.completed += 1,
            AppointmentStatus::Cancelled => self.cancelled += 1,
        }
        self.total += 1;
    }

    pub fn get(&self, status: AppointmentStatus) -> u64 {
        match status {
            AppointmentStatus::Pending => self.pending,
            AppointmentStatus::Confirmed => self.confirmed,
            AppointmentStatus::Completed => self.completed,
            AppointmentStatus::Cancelled => self.cancelled,
        }
    }
}
