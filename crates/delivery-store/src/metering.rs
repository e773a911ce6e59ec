//! Operation counters, reported when the database closes.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Store traffic counters shared by both repositories.
#[derive(Debug, Default)]
pub struct Metering {
    pub puts: AtomicU64,
    pub conflicts: AtomicU64,
    pub gets: AtomicU64,
    pub scans: AtomicU64,
    pub scan_results: AtomicU64,
    pub radius_queries: AtomicU64,
    pub radius_results: AtomicU64,
}

/// Point-in-time copy of [`Metering`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MeteringReport {
    pub puts: u64,
    pub conflicts: u64,
    pub gets: u64,
    pub scans: u64,
    pub scan_results: u64,
    pub radius_queries: u64,
    pub radius_results: u64,
}

impl Metering {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn report(&self) -> MeteringReport {
        MeteringReport {
            puts: self.puts.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            scan_results: self.scan_results.load(Ordering::Relaxed),
            radius_queries: self.radius_queries.load(Ordering::Relaxed),
            radius_results: self.radius_results.load(Ordering::Relaxed),
        }
    }
}
