use crate::model::*;

use super::EngineError;

/// Current UTC instant. Each establishment shifts it onto its own clock.
pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidRange("timestamp out of range"));
    }
    if span.start >= span.end {
        return Err(EngineError::InvalidRange("start must be before end"));
    }
    Ok(())
}

/// Reject `span` if any non-cancelled appointment in the ledger overlaps it.
/// Callers hold the ledger's write lock so the answer stays true until insert.
pub(crate) fn check_no_conflict(ledger: &Ledger, span: &Span) -> Result<(), EngineError> {
    match ledger.busy(span).next() {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}
