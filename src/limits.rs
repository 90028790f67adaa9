use crate::model::{DAY_MS, Ms};

pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// Distinct overlaps collected before the evaluator gives up.
pub const MAX_OVERLAPS: usize = 25;

/// Default number of instances a series expands to, anchor included.
pub const DEFAULT_MAX_INSTANCES: u32 = 365;
/// Hard ceiling for a configured series size.
pub const MAX_SERIES_INSTANCES: u32 = 3650;

/// How far ahead the cron evaluator looks for the next valid time.
/// Eight years covers a 29 February rule across a skipped leap year.
pub const MAX_CRON_SEARCH_DAYS: i64 = 366 * 8;

/// Attempts `Series::save` makes when the store reports a stale series.
pub const MAX_SAVE_ATTEMPTS: u32 = 3;

pub const MAX_BATCH_MUTATIONS: usize = 8192;
pub const MAX_GRID_DAYS: u32 = 366;
pub const MAX_EVENTS_PER_RESOURCE: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;

/// Event spans must fall inside this window.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_000; // 9999-12-31T23:59:59Z
pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;
