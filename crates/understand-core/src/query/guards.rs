//! Shared guardrails for traversal bounds, seed extraction and recording limits.

use std::time::Duration;

// Lens guards
pub const DEFAULT_LENS_HOPS: u32 = 2;
pub const MAX_LENS_HOPS: u32 = 5;
pub const MAX_TEXT_SEEDS: usize = 32;

// Scanner guards
pub const MAX_UNRESOLVED_CANDIDATES: usize = 16;
pub const DEFAULT_SCAN_WORKERS: usize = 4;

// Recorder guards
pub const DEFAULT_TRACE_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_TRACE_CALLS: u64 = 100_000;

pub fn clamp_int(value: i64, minimum: i64, maximum: i64) -> i64 {
    value.max(minimum).min(maximum)
}

/// Clamp a user-supplied hop count into `0..=MAX_LENS_HOPS`.
pub fn clamp_hops(value: i64) -> u32 {
    clamp_int(value, 0, MAX_LENS_HOPS as i64) as u32
}

pub fn clamp_workers(value: usize) -> usize {
    clamp_int(value as i64, 1, 64) as usize
}
