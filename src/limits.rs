use crate::model::{DAY_MS, Ms};

/// Timestamps outside `[MIN_VALID_TIMESTAMP_MS, MAX_VALID_TIMESTAMP_MS]` are rejected.
/// 2000-01-01 .. 2100-01-01 UTC.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Longest rent window a single booking may cover.
pub const MAX_RENT_DAYS: i64 = 366;
pub const MAX_RENT_SPAN_MS: Ms = MAX_RENT_DAYS * DAY_MS;

/// Bookings (any status) kept per item; the calendar is never pruned.
pub const MAX_BOOKINGS_PER_ITEM: usize = 50_000;

pub const DEFAULT_BOOKING_PAGE: usize = 20;
pub const MAX_BOOKING_PAGE: usize = 100;

pub const DEFAULT_EVENT_PAGE: usize = 50;
pub const MAX_EVENT_PAGE: usize = 200;

pub const DEFAULT_UPCOMING: usize = 20;
pub const MAX_UPCOMING: usize = 100;

/// Widest window accepted by the busy-days query.
pub const MAX_BUSY_WINDOW_DAYS: i64 = 180;
