use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Longest single slot a provider may declare (7 days).
pub const MAX_SLOT_DURATION_MS: Ms = 7 * 24 * 3_600_000;

pub const MAX_SLOTS_PER_PROVIDER: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_PROVIDER: usize = 50_000;

pub const MAX_PURPOSE_LEN: usize = 1_000;
pub const MAX_NOTES_LEN: usize = 10_000;
pub const MAX_REASON_LEN: usize = 1_000;

pub const MAX_PAGE_SIZE: usize = 500;
pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_UPCOMING_LIMIT: usize = 5;
