use chrono::TimeDelta;

use crate::model::Timestamp;

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_BOOKINGS_PER_ROOM: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LOCATION_LEN: usize = 256;
pub const MAX_EQUIPMENT_ITEMS: usize = 64;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_SECS: i64 = 946_684_800;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_SECS: i64 = 7_258_118_400;

pub const MAX_SPAN_DAYS: i64 = 31;
pub const MAX_QUERY_WINDOW_DAYS: i64 = 366;

pub fn max_span_duration() -> TimeDelta {
    TimeDelta::days(MAX_SPAN_DAYS)
}

pub fn max_query_window() -> TimeDelta {
    TimeDelta::days(MAX_QUERY_WINDOW_DAYS)
}

pub fn in_valid_range(t: Timestamp) -> bool {
    (MIN_VALID_TIMESTAMP_SECS..=MAX_VALID_TIMESTAMP_SECS).contains(&t.timestamp())
}
