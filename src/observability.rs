//! Metric names. The crate records through the `metrics` facade; installing
//! a recorder is left to the embedding application.

// ── Store ───────────────────────────────────────────────────────

/// Counter: batches written to the log and applied. Labels: first mutation.
pub const BATCHES_APPLIED_TOTAL: &str = "vetslot_batches_applied_total";

/// Histogram: mutations per applied batch.
pub const BATCH_SIZE: &str = "vetslot_batch_size";

/// Histogram: log append + fsync duration in seconds.
pub const WAL_APPEND_DURATION_SECONDS: &str = "vetslot_wal_append_duration_seconds";

/// Counter: batches refused by validation. Labels: reason.
pub const BATCHES_REJECTED_TOTAL: &str = "vetslot_batches_rejected_total";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: overlap checks. Labels: verdict.
pub const OVERLAP_CHECKS_TOTAL: &str = "vetslot_overlap_checks_total";

/// Counter: series saves that produced a batch.
pub const SERIES_SAVES_TOTAL: &str = "vetslot_series_saves_total";

/// Counter: series saves recomputed after a stale read.
pub const SERIES_SAVE_RETRIES_TOTAL: &str = "vetslot_series_save_retries_total";

/// Histogram: grid build latency in seconds. Labels: grid.
pub const GRID_BUILD_DURATION_SECONDS: &str = "vetslot_grid_build_duration_seconds";
