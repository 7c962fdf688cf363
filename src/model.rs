use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Amount in minor currency units (cents). Prices never touch floating point.
pub type Money = u64;

pub type PropertyId = Ulid;
pub type UserId = Ulid;
pub type WindowId = Ulid;
pub type ReservationId = Ulid;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Half-open overlap. Equivalent to the three-way test "check-in inside,
    /// check-out inside, or fully containing" for non-empty spans.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Request-scoped credential. Every operation that needs to know who is
/// asking takes one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
}

impl Caller {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub id: PropertyId,
    pub owner_id: UserId,
    pub title: String,
    pub description: Option<String>,
    pub location: String,
    pub price_per_night: Money,
    pub cleaning_fee: Money,
    pub max_guests: u32,
    pub active: bool,
    pub listed_at: Ms,
}

/// Input for listing a new property. The caller becomes the owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProperty {
    pub title: String,
    pub description: Option<String>,
    pub location: String,
    pub price_per_night: Money,
    pub cleaning_fee: Money,
    pub max_guests: u32,
}

/// One field of a partial update.
///
/// `Keep` leaves the field as it is, `Set` replaces it, `Clear` sets a
/// nullable field to nothing. `Clear` on a required field is rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Patch<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> Patch<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyPatch {
    pub title: Patch<String>,
    pub description: Patch<String>,
    pub location: Patch<String>,
    pub price_per_night: Patch<Money>,
    pub cleaning_fee: Patch<Money>,
    pub max_guests: Patch<u32>,
    pub active: Patch<bool>,
}

impl PropertyPatch {
    /// True when every field is `Keep`.
    pub fn is_noop(&self) -> bool {
        self.title.is_keep()
            && self.description.is_keep()
            && self.location.is_keep()
            && self.price_per_night.is_keep()
            && self.cleaning_fee.is_keep()
            && self.max_guests.is_keep()
            && self.active.is_keep()
    }
}

/// Host-declared open or blocked date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: WindowId,
    pub property_id: PropertyId,
    pub start: Ms,
    pub end: Ms,
    pub available: bool,
}

impl AvailabilityWindow {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub property_id: PropertyId,
    pub guest_id: UserId,
    pub check_in: Ms,
    pub check_out: Ms,
    pub guest_count: u32,
    pub total_price: Money,
    pub created_at: Ms,
}

impl Reservation {
    pub fn stay(&self) -> Span {
        Span::new(self.check_in, self.check_out)
    }
}

/// Everything the engine knows about one property.
#[derive(Debug, Clone)]
pub struct PropertyState {
    pub property: Property,
    /// Sorted by `start`. Windows may overlap each other.
    pub windows: Vec<AvailabilityWindow>,
    /// Sorted by `check_in`. Never overlapping.
    pub reservations: Vec<Reservation>,
}

impl PropertyState {
    pub fn new(property: Property) -> Self {
        Self {
            property,
            windows: Vec::new(),
            reservations: Vec::new(),
        }
    }

    pub fn id(&self) -> PropertyId {
        self.property.id
    }

    /// Insert window maintaining sort order by start.
    pub fn insert_window(&mut self, window: AvailabilityWindow) {
        let pos = self
            .windows
            .binary_search_by_key(&window.start, |w| w.start)
            .unwrap_or_else(|e| e);
        self.windows.insert(pos, window);
    }

    pub fn remove_window(&mut self, id: WindowId) -> Option<AvailabilityWindow> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }

    /// Insert reservation maintaining sort order by check-in.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.check_in, |r| r.check_in)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: ReservationId) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    /// Return only reservations whose stay overlaps the query.
    /// Uses binary search to skip reservations checking in at or after `query.end`.
    pub fn overlapping_reservations(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.check_in < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.check_out > query.start)
    }

    /// Windows whose span overlaps the query. Windows can nest, so no early exit on the left.
    pub fn overlapping_windows(&self, query: &Span) -> impl Iterator<Item = &AvailabilityWindow> {
        let right_bound = self.windows.partition_point(|w| w.start < query.end);
        self.windows[..right_bound]
            .iter()
            .filter(move |w| w.end > query.start)
    }

    pub fn has_upcoming_reservations(&self, now: Ms) -> bool {
        self.reservations.iter().any(|r| r.check_out > now)
    }
}

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PropertyListed {
        property: Property,
    },
    PropertyUpdated {
        property: Property,
    },
    PropertyDelisted {
        id: PropertyId,
    },
    WindowAdded {
        id: WindowId,
        property_id: PropertyId,
        span: Span,
        available: bool,
    },
    WindowUpdated {
        id: WindowId,
        property_id: PropertyId,
        span: Span,
        available: bool,
    },
    WindowRemoved {
        id: WindowId,
        property_id: PropertyId,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationCancelled {
        id: ReservationId,
        property_id: PropertyId,
    },
}

impl Event {
    pub fn property_id(&self) -> PropertyId {
        match self {
            Event::PropertyListed { property } | Event::PropertyUpdated { property } => property.id,
            Event::PropertyDelisted { id } => *id,
            Event::WindowAdded { property_id, .. }
            | Event::WindowUpdated { property_id, .. }
            | Event::WindowRemoved { property_id, .. }
            | Event::ReservationCancelled { property_id, .. } => *property_id,
            Event::ReservationCreated { reservation } => reservation.property_id,
        }
    }
}

// ── Query types ──────────────────────────────────────────────────

/// Listing search. Every filter is optional; an empty query matches every active property.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// Case-insensitive substring of the property location.
    pub location: Option<String>,
    pub guests: Option<u32>,
    pub min_price: Option<Money>,
    pub max_price: Option<Money>,
    /// Only properties bookable for exactly this stay.
    pub stay: Option<Span>,
}
