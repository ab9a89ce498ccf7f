//! Atomic statistics counters, updated on every segment mutation.
//!
//! Counters live in [`crate::types::SegmentStatsRaw`] and are touched while
//! the segment lock is held, but use atomics (rather than plain integers)
//! so that [`snapshot`] can be called without acquiring the lock.

use std::sync::atomic::Ordering;

use crate::types::{SegmentStats, SegmentStatsRaw};

/// Add `amount` to the in-use byte count and advance the peak if exceeded.
pub fn track_bytes(stats: &SegmentStatsRaw, amount: i64) {
    if amount == 0 {
        return;
    }
    let current = stats.bytes_in_use.fetch_add(amount, Ordering::Relaxed) + amount;
    let mut peak = stats.bytes_in_use_peak.load(Ordering::Relaxed);
    while current > peak {
        match stats.bytes_in_use_peak.compare_exchange_weak(
            peak,
            current,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(observed) => peak = observed,
        }
    }
}

pub fn inc_alloc(stats: &SegmentStatsRaw) {
    stats.alloc_count.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_free(stats: &SegmentStatsRaw) {
    stats.free_count.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_merge(stats: &SegmentStatsRaw) {
    stats.merge_count.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_split(stats: &SegmentStatsRaw) {
    stats.split_count.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_fixed_alloc(stats: &SegmentStatsRaw) {
    stats.fixed_alloc_count.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_fixed_free(stats: &SegmentStatsRaw) {
    stats.fixed_free_count.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_grow(stats: &SegmentStatsRaw) {
    stats.grow_count.fetch_add(1, Ordering::Relaxed);
}

/// Take a lock-free, best-effort snapshot of a segment's counters.
pub fn snapshot(stats: &SegmentStatsRaw) -> SegmentStats {
    SegmentStats {
        bytes_in_use: stats.bytes_in_use.load(Ordering::Relaxed),
        bytes_in_use_peak: stats.bytes_in_use_peak.load(Ordering::Relaxed),
        alloc_count: stats.alloc_count.load(Ordering::Relaxed),
        free_count: stats.free_count.load(Ordering::Relaxed),
        merge_count: stats.merge_count.load(Ordering::Relaxed),
        split_count: stats.split_count.load(Ordering::Relaxed),
        fixed_alloc_count: stats.fixed_alloc_count.load(Ordering::Relaxed),
        fixed_free_count: stats.fixed_free_count.load(Ordering::Relaxed),
        grow_count: stats.grow_count.load(Ordering::Relaxed),
    }
}
