use crate::limits::*;
use crate::model::*;

use super::availability::{covering_open_window, find_conflict};
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

/// Validate a `[start, end)` range against ordering and hard limits.
pub(crate) fn validate_span(start: Ms, end: Ms, max_len: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidDateRange("start must be before end"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > max_len {
        return Err(EngineError::LimitExceeded("range too long"));
    }
    Ok(span)
}

/// A stay must be ordered, start strictly in the future, and respect limits.
pub(crate) fn validate_stay(check_in: Ms, check_out: Ms, now: Ms) -> Result<Span, EngineError> {
    if check_in >= check_out {
        return Err(EngineError::InvalidDateRange("check-out must be after check-in"));
    }
    if check_in <= now {
        return Err(EngineError::InvalidDateRange("check-in must be in the future"));
    }
    validate_span(check_in, check_out, MAX_STAY_MS)
}

/// Authoritative availability check, run under the property's write lock.
pub(crate) fn check_bookable(state: &PropertyState, stay: &Span) -> Result<(), EngineError> {
    if let Some(existing) = find_conflict(state, stay) {
        return Err(EngineError::Unavailable {
            conflict: Some(existing.id),
        });
    }
    if covering_open_window(state, stay).is_none() {
        return Err(EngineError::Unavailable { conflict: None });
    }
    Ok(())
}

/// Last instant (exclusive) at which a reservation may still be cancelled.
pub fn cancellation_deadline(check_in: Ms) -> Ms {
    check_in.saturating_sub(CANCELLATION_NOTICE_MS)
}

/// Cancellation is refused once `check_in <= now + 24h`.
pub(crate) fn check_cancellable(reservation: &Reservation, now: Ms) -> Result<(), EngineError> {
    let deadline = cancellation_deadline(reservation.check_in);
    if now >= deadline {
        return Err(EngineError::TooLate {
            check_in: reservation.check_in,
            deadline,
        });
    }
    Ok(())
}
