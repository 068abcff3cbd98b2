use thiserror::Error;
use ulid::Ulid;

use crate::model::{AppointmentStatus, TimeRange};

/// Coarse error class. Decides how callers react (retry, re-fetch, give up).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Authorization,
    NotFound,
    InvalidTransition,
    State,
    Limit,
    Transport,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Authorization => "authorization",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::State => "state",
            ErrorKind::Limit => "limit",
            ErrorKind::Transport => "transport",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    AlreadyBooked,
    Expired,
    OverlapsSlot(Ulid),
    OverlapsAppointment(Ulid),
    /// Status moved underneath a compare-and-swap.
    StatusChanged,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictReason::AlreadyBooked => write!(f, "already booked"),
            ConflictReason::Expired => write!(f, "expired"),
            ConflictReason::OverlapsSlot(id) => write!(f, "overlaps open slot {id}"),
            ConflictReason::OverlapsAppointment(id) => write!(f, "overlaps appointment {id}"),
            ConflictReason::StatusChanged => write!(f, "status changed concurrently"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid range {range}: {reason}")]
    InvalidRange { range: TimeRange, reason: &'static str },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(ConflictReason),
    #[error("not authorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    #[error("invalid state: {0}")]
    State(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store unavailable: {0}")]
    Transport(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidRange { .. } | EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Unauthorized(_) => ErrorKind::Authorization,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            EngineError::State(_) => ErrorKind::State,
            EngineError::LimitExceeded(_) => ErrorKind::Limit,
            EngineError::Transport(_) => ErrorKind::Transport,
        }
    }

    pub fn already_booked() -> Self {
        EngineError::Conflict(ConflictReason::AlreadyBooked)
    }
}
