//! # Geo Matcher
//!
//! Finds Waiting jobs within a radius of a point, either through the
//! store's geo index or by scanning every job and measuring.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use delivery_domain::{Job, JobState, Location};

use crate::metering::Metering;
use crate::repository::{Jobs, Versioned};
use crate::store::ScanCallback;

/// Meters spanned by one degree along the equator.
pub const METERS_PER_DEGREE_AT_EQUATOR: f64 = 111_320.0;

/// Field a waiting job's origin is stored (and indexed) under.
pub const WAITING_LOCATION_FIELD: &str = "Waiting";

/// Which path [`Jobs::nearest_jobs`] takes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchStrategy {
    /// Radius query on the store's geo index.
    #[default]
    Indexed,
    /// Full scan with planar distance in degrees.
    BruteForce,
}

impl Jobs {
    /// Call `action` for Waiting jobs within `radius_degrees` of `center`,
    /// returning how many were handed over.
    ///
    /// A `Break` from `action` ends the brute-force path; on the indexed
    /// path it only stops delivery on a best-effort basis.
    pub async fn nearest_jobs<F>(
        &self,
        center: Location,
        radius_degrees: f64,
        strategy: MatchStrategy,
        action: F,
    ) -> usize
    where
        F: Fn(Versioned<Job>) -> ControlFlow<()> + Send + Sync + 'static,
    {
        match strategy {
            MatchStrategy::Indexed => self.nearest_jobs_indexed(center, radius_degrees, action).await,
            MatchStrategy::BruteForce => self.nearest_jobs_brute_force(center, radius_degrees, action).await,
        }
    }

    pub async fn nearest_jobs_indexed<F>(&self, center: Location, radius_degrees: f64, action: F) -> usize
    where
        F: Fn(Versioned<Job>) -> ControlFlow<()> + Send + Sync + 'static,
    {
        if !self.is_connected() {
            return 0;
        }
        Metering::bump(&self.metering.radius_queries);
        let delivered = Arc::new(AtomicUsize::new(0));
        let metering = Arc::clone(&self.metering);
        let count = Arc::clone(&delivered);

        let callback: ScanCallback = Arc::new(move |id, record| {
            Metering::bump(&metering.radius_results);
            match Versioned::<Job>::from_record(id, &record) {
                Ok(job) if job.state() == JobState::Waiting => {
                    count.fetch_add(1, Ordering::Relaxed);
                    action(job)
                }
                Ok(_) => ControlFlow::Continue(()),
                Err(e) => {
                    tracing::warn!(collection = "jobs", id, error = %e, "Skipping undecodable record");
                    ControlFlow::Continue(())
                }
            }
        });

        let radius_meters = radius_degrees * METERS_PER_DEGREE_AT_EQUATOR;
        if let Err(e) = self
            .store
            .geo_radius_query("jobs", WAITING_LOCATION_FIELD, center, radius_meters, callback)
            .await
        {
            tracing::error!(op = "geo query", collection = "jobs", error = %e, "Radius query failed");
        }
        delivered.load(Ordering::Relaxed)
    }

    pub async fn nearest_jobs_brute_force<F>(&self, center: Location, radius_degrees: f64, action: F) -> usize
    where
        F: Fn(Versioned<Job>) -> ControlFlow<()> + Send + Sync + 'static,
    {
        if !self.is_connected() {
            return 0;
        }
        Metering::bump(&self.metering.radius_queries);
        let mut stream = self.snapshot_stream();
        let mut delivered = 0;
        while let Some(job) = stream.next().await {
            if job.state() != JobState::Waiting || center.distance_to(&job.origin) > radius_degrees {
                continue;
            }
            Metering::bump(&self.metering.radius_results);
            delivered += 1;
            if action(job).is_break() {
                break;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_strategy_uses_index() {
        assert_eq!(MatchStrategy::default(), MatchStrategy::Indexed);
    }

    #[test]
    fn test_degree_scale() {
        assert!((0.01 * METERS_PER_DEGREE_AT_EQUATOR - 1113.2).abs() < 1e-9);
    }
}
