use ulid::Ulid;

use crate::model::{AppointmentStatus, Span};

#[derive(Debug)]
pub enum EngineError {
    /// Unknown establishment, service, staff member or appointment.
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The requested interval overlaps this non-cancelled appointment.
    Conflict(Ulid),
    InvalidRange(&'static str),
    OutsideOpeningHours(Span),
    NotAssigned {
        staff_id: Ulid,
        service_id: Ulid,
    },
    Forbidden {
        actor_id: Ulid,
        appointment_id: Ulid,
    },
    InvalidTransition {
        appointment_id: Ulid,
        status: AppointmentStatus,
    },
    LimitExceeded(&'static str),
    /// WAL write failed; nothing was applied.
    Storage(String),
    /// The commit did not finish in time; it may still land.
    CommitTimeout,
}

impl EngineError {
    /// Transient failures. Retrying the whole call either commits or
    /// reports a conflict.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Storage(_) | EngineError::CommitTimeout)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => {
                write!(f, "slot no longer available: overlaps appointment {id}")
            }
            EngineError::InvalidRange(msg) => write!(f, "invalid range: {msg}"),
            EngineError::OutsideOpeningHours(span) => write!(
                f,
                "[{}, {}) is outside the establishment's opening hours",
                span.start, span.end
            ),
            EngineError::NotAssigned {
                staff_id,
                service_id,
            } => write!(f, "staff member {staff_id} does not perform service {service_id}"),
            EngineError::Forbidden {
                actor_id,
                appointment_id,
            } => write!(f, "{actor_id} may not cancel appointment {appointment_id}"),
            EngineError::InvalidTransition {
                appointment_id,
                status,
            } => write!(f, "appointment {appointment_id} is already {status}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
            EngineError::CommitTimeout => write!(f, "commit timed out; outcome unknown, retry"),
        }
    }
}

impl std::error::Error for EngineError {}
