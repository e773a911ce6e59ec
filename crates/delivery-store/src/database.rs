//! # Database
//!
//! Owns the store connection and both repositories.

use std::sync::Arc;

use delivery_domain::Job;

use crate::config::StoreConfig;
use crate::entity::Entity;
use crate::error::Result;
use crate::geo_match::WAITING_LOCATION_FIELD;
use crate::metering::{Metering, MeteringReport};
use crate::repository::{Drones, Jobs};
use crate::store::{MemoryStore, SharedStore};

/// Store handle plus the job and drone repositories built on it.
pub struct Database {
    store: SharedStore,
    jobs: Arc<Jobs>,
    drones: Arc<Drones>,
    metering: Arc<Metering>,
}

impl Database {
    /// Connect to Redis.
    #[cfg(feature = "redis")]
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        let store = crate::store::RedisStore::connect(config).await?;
        Ok(Self::with_store(Arc::new(store)).await)
    }

    /// Database on a fresh [`MemoryStore`].
    pub async fn in_memory(config: &StoreConfig) -> Self {
        Self::with_store(Arc::new(MemoryStore::with_workers(config.scan_workers))).await
    }

    /// Wrap an existing store and create the job location index.
    pub async fn with_store(store: SharedStore) -> Self {
        // Idempotent; a failure only disables the indexed match path.
        if let Err(e) = store.create_geo_index(Job::COLLECTION, WAITING_LOCATION_FIELD).await {
            tracing::warn!(collection = Job::COLLECTION, field = WAITING_LOCATION_FIELD, error = %e, "Could not create geo index");
        }
        let metering = Arc::new(Metering::default());
        tracing::info!(store = store.kind(), "Database ready");
        Self {
            jobs: Arc::new(Jobs::new(Arc::clone(&store), Arc::clone(&metering))),
            drones: Arc::new(Drones::new(Arc::clone(&store), Arc::clone(&metering))),
            store,
            metering,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    pub fn jobs(&self) -> &Arc<Jobs> {
        &self.jobs
    }

    pub fn drones(&self) -> &Arc<Drones> {
        &self.drones
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn metering(&self) -> MeteringReport {
        self.metering.report()
    }

    /// Empty both collections. Returns `(jobs, drones)` removed.
    pub async fn clear(&self) -> Result<(u64, u64)> {
        if !self.is_connected() {
            tracing::warn!("Not connected; nothing cleared");
            return Ok((0, 0));
        }
        let jobs = self.jobs.clear().await?;
        let drones = self.drones.clear().await?;
        tracing::info!(jobs, drones, "Database cleared");
        Ok((jobs, drones))
    }

    /// Continue on the records already stored. Returns `(jobs, drones)`
    /// found.
    pub async fn rebuild(&self) -> Result<(usize, usize)> {
        if !self.is_connected() {
            tracing::warn!("Not connected; nothing rebuilt");
            return Ok((0, 0));
        }
        let jobs = self.jobs.rebuild().await?;
        let drones = self.drones.rebuild().await?;
        tracing::info!(jobs, drones, "Database rebuilt from store");
        Ok((jobs, drones))
    }

    /// Log the traffic summary and release the store.
    pub fn close(self) -> MeteringReport {
        let report = self.metering.report();
        tracing::info!(
            puts = report.puts,
            conflicts = report.conflicts,
            gets = report.gets,
            scans = report.scans,
            scan_results = report.scan_results,
            radius_queries = report.radius_queries,
            radius_results = report.radius_results,
            "Database closed"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delivery_domain::{DroneState, JobState};

    #[tokio::test]
    async fn test_clear_empties_both_collections() {
        let db = Database::in_memory(&StoreConfig::default()).await;
        db.jobs().new_entity(JobState::Waiting).await;
        db.jobs().new_entity(JobState::Waiting).await;
        db.drones().new_entity(DroneState::Ready).await;

        assert_eq!(db.clear().await.unwrap(), (2, 1));
        assert_eq!(db.jobs().count(JobState::Waiting), 0);
        assert_eq!(db.drones().count(DroneState::Ready), 0);

        let report = db.close();
        assert_eq!(report.puts, 3);
        assert_eq!(report.conflicts, 0);
    }

    #[tokio::test]
    async fn test_reopened_database_keeps_records() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let first = Database::with_store(Arc::clone(&store)).await;
        for _ in 0..3 {
            first.jobs().new_entity(JobState::Waiting).await;
        }
        first.drones().new_entity(DroneState::Ready).await;
        first.close();

        let second = Database::with_store(store).await;
        assert_eq!(second.rebuild().await.unwrap(), (3, 1));
        let job = second.jobs().new_entity(JobState::Waiting).await;
        assert_eq!(job.id(), 4);
        assert_eq!(second.jobs().count(JobState::Waiting), 4);
        assert_eq!(second.drones().count(DroneState::Ready), 1);
    }
}
