use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug)]
pub enum EngineError {
    /// Unknown property, window or reservation.
    NotFound(Ulid),
    /// Check-in not before check-out, check-in in the past, or an empty window.
    InvalidDateRange(&'static str),
    /// The stay overlaps a reservation (`conflict` names it) or no open window covers it.
    Unavailable { conflict: Option<Ulid> },
    Forbidden(&'static str),
    /// Cancellation requested at or after `deadline` (check-in minus the notice period).
    TooLate { check_in: Ms, deadline: Ms },
    Inactive(Ulid),
    TooManyGuests { requested: u32, max: u32 },
    HasReservations(Ulid),
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// True when the request itself was at fault. Only storage failures are not.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::InvalidDateRange(msg) => write!(f, "invalid date range: {msg}"),
            EngineError::Unavailable { conflict: Some(id) } => {
                write!(f, "dates no longer available: overlaps reservation {id}")
            }
            EngineError::Unavailable { conflict: None } => {
                write!(f, "dates no longer available: not open for booking")
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::TooLate { check_in, deadline } => write!(
                f,
                "cannot cancel less than 24 hours before check-in (check-in {check_in}, deadline {deadline})"
            ),
            EngineError::Inactive(id) => write!(f, "property {id} is not accepting bookings"),
            EngineError::TooManyGuests { requested, max } => {
                write!(f, "{requested} guests requested, property allows {max}")
            }
            EngineError::HasReservations(id) => {
                write!(f, "cannot delist property {id}: has upcoming reservations")
            }
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
