//! # Store Adapter
//!
//! Minimal contract a backing store must satisfy: scan, point read,
//! generation-checked point write, geo radius query and bulk clear over
//! named collections of integer-keyed records.
//!
//! Implementations can be swapped (Redis, in-memory) behind [`Store`].

use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use delivery_domain::Location;

use crate::error::{Result, StoreError};
use crate::record::{Bins, Record};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Per-record callback for scans and radius queries.
///
/// Invoked concurrently from several workers. Returning `Break` asks the
/// store to stop, which scans never honor and radius queries honor only on
/// a best-effort basis.
pub type ScanCallback = Arc<dyn Fn(i64, Record) -> ControlFlow<()> + Send + Sync>;

/// Result of a generation-checked write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Written; the record now carries `version`.
    Written { version: u32 },
    /// The stored generation was `current`, not the expected one.
    Conflict { current: u32 },
}

impl PutOutcome {
    pub const fn is_written(&self) -> bool {
        matches!(self, Self::Written { .. })
    }
}

/// Backing store for entity records.
#[async_trait]
pub trait Store: Send + Sync {
    /// Human readable backend name
    fn kind(&self) -> &'static str;

    /// Liveness; callers check this instead of waiting for errors.
    fn is_connected(&self) -> bool;

    /// Create a geo index on `field`. Succeeds if it already exists.
    async fn create_geo_index(&self, set: &str, field: &str) -> Result<()>;

    /// One pass over every record in `set`. May fail with
    /// [`StoreError::Transient`]; use [`Store::scan_all`].
    async fn scan_once(&self, set: &str, callback: ScanCallback) -> Result<()>;

    /// Point read.
    async fn get(&self, set: &str, id: i64) -> Result<Option<Record>>;

    /// Replace the record for `id` if its generation equals
    /// `expected_version`; `0` writes unconditionally.
    async fn put(&self, set: &str, id: i64, bins: &Bins, expected_version: u32)
        -> Result<PutOutcome>;

    /// Records whose geo `field` lies within `radius_meters` of `center`.
    async fn geo_radius_query(
        &self,
        set: &str,
        field: &str,
        center: Location,
        radius_meters: f64,
        callback: ScanCallback,
    ) -> Result<()>;

    /// Delete every record in `set`, returning how many went.
    async fn clear(&self, set: &str) -> Result<u64>;

    /// Full scan, repeated for as long as the backend reports the transient
    /// error class. Records delivered by an abandoned pass may be delivered
    /// again.
    async fn scan_all(&self, set: &str, callback: ScanCallback) -> Result<()> {
        loop {
            match self.scan_once(set, Arc::clone(&callback)).await {
                Err(StoreError::Transient(reason)) => {
                    tracing::trace!(collection = %set, %reason, "Retrying scan");
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }
    }
}

/// Shared store handle
pub type SharedStore = Arc<dyn Store>;

/// Largest absolute longitude a geo index accepts.
pub const GEO_LONGITUDE_LIMIT: f64 = 180.0;

/// Largest absolute latitude a geo index accepts (Web Mercator bound).
pub const GEO_LATITUDE_LIMIT: f64 = 85.051_128_78;

/// Reject a point the geo index on `field` could not store. Stores call
/// this before writing anything, so a rejected put has no side effects.
pub fn check_indexable(set: &str, id: i64, field: &str, point: &Location) -> Result<()> {
    if point.x.abs() <= GEO_LONGITUDE_LIMIT && point.y.abs() <= GEO_LATITUDE_LIMIT {
        return Ok(());
    }
    Err(StoreError::Unindexable {
        collection: set.to_string(),
        id,
        field: field.to_string(),
        reason: format!("({}, {}) is outside the indexable range", point.x, point.y),
    })
}
