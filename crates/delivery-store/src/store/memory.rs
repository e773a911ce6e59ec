//! In-process store.
//!
//! Keeps the same generation and radius semantics as the networked store so
//! the repositories behave identically on top of it; scans fan out over a
//! few worker tasks to reproduce concurrent delivery.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use delivery_domain::Location;
use geo::{Distance, Haversine};
use tokio::task::JoinSet;

use super::{PutOutcome, ScanCallback, Store, check_indexable};
use crate::error::{Result, StoreError};
use crate::record::{Bins, Record, Value};

type Collection = Arc<DashMap<i64, Record>>;

const DEFAULT_WORKERS: usize = 4;

/// Store backed by concurrent maps.
pub struct MemoryStore {
    sets: DashMap<String, Collection>,
    geo_fields: DashMap<String, Vec<String>>,
    connected: AtomicBool,
    workers: usize,
    failing_scans: AtomicUsize,
    broken_scans: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_workers(DEFAULT_WORKERS)
    }

    /// Scans deliver from `workers` concurrent tasks.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            sets: DashMap::new(),
            geo_fields: DashMap::new(),
            connected: AtomicBool::new(true),
            workers: workers.max(1),
            failing_scans: AtomicUsize::new(0),
            broken_scans: AtomicUsize::new(0),
        }
    }

    /// Simulate losing (or regaining) the backend.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make the next `count` scan passes fail with the transient error class.
    pub fn fail_next_scans(&self, count: usize) {
        self.failing_scans.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` scan passes fail with an error scans do not
    /// retry.
    pub fn break_next_scans(&self, count: usize) {
        self.broken_scans.store(count, Ordering::SeqCst);
    }

    fn collection(&self, set: &str) -> Collection {
        Arc::clone(&*self.sets.entry(set.to_string()).or_default())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(StoreError::NotConnected)
        }
    }

    fn check_geo_fields(&self, set: &str, id: i64, bins: &Bins) -> Result<()> {
        let Some(fields) = self.geo_fields.get(set) else {
            return Ok(());
        };
        for field in fields.iter() {
            if let Some(Value::Geo(point)) = bins.get(field) {
                check_indexable(set, id, field, point)?;
            }
        }
        Ok(())
    }
}

/// Consume one pending injected failure, if any.
fn take_one(pending: &AtomicUsize) -> bool {
    pending
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Store for MemoryStore {
    fn kind(&self) -> &'static str {
        "in-memory store"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn create_geo_index(&self, set: &str, field: &str) -> Result<()> {
        self.ensure_connected()?;
        // Radius queries scan the collection; only the write check needs it.
        let mut fields = self.geo_fields.entry(set.to_string()).or_default();
        if !fields.iter().any(|f| f == field) {
            fields.push(field.to_string());
        }
        Ok(())
    }

    async fn scan_once(&self, set: &str, callback: ScanCallback) -> Result<()> {
        self.ensure_connected()?;
        if take_one(&self.broken_scans) {
            return Err(StoreError::Connection(format!("scan of {set} lost its connection")));
        }
        if take_one(&self.failing_scans) {
            return Err(StoreError::Transient(format!(
                "scan of {set} collided with a concurrent scan"
            )));
        }

        // Copy out first so callbacks never run under a shard lock.
        let records: Vec<(i64, Record)> = self
            .collection(set)
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut shares: Vec<Vec<(i64, Record)>> = (0..self.workers).map(|_| Vec::new()).collect();
        for (i, item) in records.into_iter().enumerate() {
            shares[i % self.workers].push(item);
        }

        let mut workers = JoinSet::new();
        for share in shares.into_iter().filter(|share| !share.is_empty()) {
            let callback = Arc::clone(&callback);
            workers.spawn(async move {
                for (id, record) in share {
                    // Scans cannot be cut short.
                    let _ = callback(id, record);
                }
            });
        }
        while let Some(joined) = workers.join_next().await {
            joined?;
        }
        Ok(())
    }

    async fn get(&self, set: &str, id: i64) -> Result<Option<Record>> {
        self.ensure_connected()?;
        Ok(self.collection(set).get(&id).map(|entry| entry.value().clone()))
    }

    async fn put(
        &self,
        set: &str,
        id: i64,
        bins: &Bins,
        expected_version: u32,
    ) -> Result<PutOutcome> {
        self.ensure_connected()?;
        self.check_geo_fields(set, id, bins)?;
        let collection = self.collection(set);
        let outcome = match collection.entry(id) {
            Entry::Occupied(mut entry) => {
                let current = entry.get().generation;
                if expected_version != 0 && current != expected_version {
                    PutOutcome::Conflict { current }
                } else {
                    let version = current + 1;
                    entry.insert(Record::new(bins.clone(), version));
                    PutOutcome::Written { version }
                }
            }
            Entry::Vacant(entry) => {
                if expected_version != 0 {
                    PutOutcome::Conflict { current: 0 }
                } else {
                    entry.insert(Record::new(bins.clone(), 1));
                    PutOutcome::Written { version: 1 }
                }
            }
        };
        Ok(outcome)
    }

    async fn geo_radius_query(
        &self,
        set: &str,
        field: &str,
        center: Location,
        radius_meters: f64,
        callback: ScanCallback,
    ) -> Result<()> {
        self.ensure_connected()?;
        let origin = center.to_point();
        let mut matches: Vec<(f64, i64, Record)> = self
            .collection(set)
            .iter()
            .filter_map(|entry| {
                let location = entry.value().opt_geo(field).ok().flatten()?;
                let meters = Haversine::distance(origin, location.to_point());
                (meters <= radius_meters).then(|| (meters, *entry.key(), entry.value().clone()))
            })
            .collect();
        matches.sort_by(|a, b| a.0.total_cmp(&b.0));

        for (_, id, record) in matches {
            if callback(id, record).is_break() {
                break;
            }
        }
        Ok(())
    }

    async fn clear(&self, set: &str) -> Result<u64> {
        self.ensure_connected()?;
        let collection = self.collection(set);
        let count = collection.len() as u64;
        collection.clear();
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use std::sync::Mutex;

    fn bins_at(location: Location) -> Bins {
        let mut bins = Bins::new();
        bins.insert("Waiting".into(), Value::Geo(location));
        bins
    }

    #[tokio::test]
    async fn test_put_checks_generation() {
        let store = MemoryStore::new();
        let bins = Bins::new();

        assert_eq!(
            store.put("jobs", 1, &bins, 3).await.unwrap(),
            PutOutcome::Conflict { current: 0 }
        );
        assert_eq!(
            store.put("jobs", 1, &bins, 0).await.unwrap(),
            PutOutcome::Written { version: 1 }
        );
        assert_eq!(
            store.put("jobs", 1, &bins, 1).await.unwrap(),
            PutOutcome::Written { version: 2 }
        );
        assert_eq!(
            store.put("jobs", 1, &bins, 1).await.unwrap(),
            PutOutcome::Conflict { current: 2 }
        );
        assert_eq!(store.get("jobs", 1).await.unwrap().unwrap().generation, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_scan_all_retries_transient_failures() {
        let store = MemoryStore::with_workers(3);
        for id in 1..=10 {
            store.put("jobs", id, &Bins::new(), 0).await.unwrap();
        }
        store.fail_next_scans(2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ScanCallback = Arc::new(move |id, _| {
            sink.lock().unwrap().push(id);
            ControlFlow::Break(())
        });
        store.scan_all("jobs", callback).await.unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_radius_query_filters_by_distance() {
        let store = MemoryStore::new();
        store.put("jobs", 1, &bins_at(Location::new(0.0, 0.0)), 0).await.unwrap();
        store.put("jobs", 2, &bins_at(Location::new(0.001, 0.0)), 0).await.unwrap();
        store.put("jobs", 3, &bins_at(Location::new(1.0, 0.0)), 0).await.unwrap();
        store.put("jobs", 4, &Bins::new(), 0).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ScanCallback = Arc::new(move |id, _| {
            sink.lock().unwrap().push(id);
            ControlFlow::Continue(())
        });
        store
            .geo_radius_query("jobs", "Waiting", Location::new(0.0, 0.0), 500.0, callback)
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_unindexable_point_is_not_written() {
        let store = MemoryStore::new();
        store.create_geo_index("jobs", "Waiting").await.unwrap();
        store.create_geo_index("jobs", "Waiting").await.unwrap();
        store.put("jobs", 1, &bins_at(Location::new(0.0, 10.0)), 0).await.unwrap();

        let result = store.put("jobs", 1, &bins_at(Location::new(0.0, 86.0)), 1).await;
        assert!(matches!(result, Err(StoreError::Unindexable { id: 1, .. })));
        let stored = store.get("jobs", 1).await.unwrap().unwrap();
        assert_eq!(stored.generation, 1);
        assert_eq!(stored.opt_geo("Waiting"), Ok(Some(Location::new(0.0, 10.0))));

        // Unindexed collections take any point.
        assert!(store.put("drones", 1, &bins_at(Location::new(0.0, 86.0)), 0).await.is_ok());
    }

    #[tokio::test]
    async fn test_broken_scan_is_not_retried() {
        let store = MemoryStore::new();
        store.put("jobs", 1, &Bins::new(), 0).await.unwrap();
        store.break_next_scans(1);

        let callback: ScanCallback = Arc::new(|_, _| ControlFlow::Continue(()));
        let result = store.scan_all("jobs", Arc::clone(&callback)).await;
        assert!(matches!(result, Err(StoreError::Connection(_))));
        assert!(store.scan_all("jobs", callback).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnected_operations_fail() {
        let store = MemoryStore::new();
        store.set_connected(false);
        assert!(matches!(
            store.get("jobs", 1).await,
            Err(StoreError::NotConnected)
        ));
        assert!(matches!(store.clear("jobs").await, Err(StoreError::NotConnected)));
    }
}
