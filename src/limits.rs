use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// Shortest accepted booking.
pub const MIN_EVENT_DURATION_MINUTES: i64 = 15;
/// Longest accepted booking.
pub const MAX_EVENT_DURATION_HOURS: i64 = 23;

pub const MIN_EVENT_DURATION_MS: Ms = MIN_EVENT_DURATION_MINUTES * MINUTE_MS;
pub const MAX_EVENT_DURATION_MS: Ms = MAX_EVENT_DURATION_HOURS * HOUR_MS;

/// 1970-01-01 .. 2200-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_EVENTS_PER_TENANT: usize = 100_000;
pub const MAX_DIRECTORY_ENTRIES: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 16_384;
pub const MAX_TAGS_PER_EVENT: usize = 64;
pub const MAX_TAG_LEN: usize = 64;
pub const MAX_TALENTS_PER_EVENT: usize = 128;

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 128;

/// How many times an update re-acquires stage gates after losing a race with
/// a concurrent stage move before giving up.
pub const MAX_GATE_RETRIES: usize = 8;
