use crate::model::{DAY_MS, Ms};

// ── Store-wide ───────────────────────────────────────────────────

pub const MAX_PROPERTIES: usize = 100_000;

// ── Per property ─────────────────────────────────────────────────

pub const MAX_WINDOWS_PER_PROPERTY: usize = 1_000;
pub const MAX_RESERVATIONS_PER_PROPERTY: usize = 10_000;
pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_LOCATION_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 5_000;
pub const MAX_GUESTS_PER_PROPERTY: u32 = 64;

// ── Time ─────────────────────────────────────────────────────────

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_STAY_MS: Ms = 365 * DAY_MS;
/// Windows may be declared further ahead than a single stay.
pub const MAX_WINDOW_MS: Ms = 5 * 365 * DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 365 * DAY_MS;

/// A reservation can only be cancelled strictly before `check_in - CANCELLATION_NOTICE_MS`.
pub const CANCELLATION_NOTICE_MS: Ms = 24 * 3_600_000;
