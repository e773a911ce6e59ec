//! # Delivery Store
//!
//! State management for the delivery fleet: entity state machines whose every
//! change is a generation-checked write, geo matching of drones to jobs, and
//! snapshot streams for a slow single reader.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Database                             │
//! │            (Jobs + Drones repositories, metering)            │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                    │
//!          ▼                    ▼                    ▼
//! ┌────────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │  transition    │  │ snapshot_stream  │  │  nearest_jobs    │
//! │  promote_held  │  │ (queue + End)    │  │ (index / brute)  │
//! └────────────────┘  └──────────────────┘  └──────────────────┘
//!          │                    │                    │
//!          └────────────────────┼────────────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Store (trait)                           │
//! └─────────────────────────────────────────────────────────────┘
//!                    │                   │
//!                    ▼                   ▼
//! ┌─────────────────────────┐   ┌──────────────────────────────┐
//! │       RedisStore        │   │         MemoryStore          │
//! │  (Lua CAS, GEOSEARCH)   │   │      (tests, local runs)     │
//! └─────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - `redis`: Enable the Redis backend (default)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use delivery_store::{Database, StoreConfig};
//! use delivery_domain::JobState;
//!
//! let db = Database::connect(StoreConfig::from_env()).await?;
//! let job = db.jobs().new_entity(JobState::Waiting).await;
//!
//! let mut guard = job.lock().await;
//! if db.jobs().transition(&mut guard, JobState::Waiting, JobState::InProcess).await {
//!     // we own the job now
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod config;
pub mod database;
pub mod entity;
pub mod error;
pub mod geo_match;
pub mod metering;
pub mod promoter;
pub mod record;
pub mod repository;
pub mod snapshot;
pub mod store;

// Re-export commonly used types
pub use config::StoreConfig;
pub use database::Database;
pub use entity::{Entity, EntityState};
pub use error::{Result, StoreError};
pub use geo_match::{MatchStrategy, METERS_PER_DEGREE_AT_EQUATOR, WAITING_LOCATION_FIELD};
pub use metering::{Metering, MeteringReport};
pub use promoter::HoldPromoter;
pub use record::{Bins, Record, Value};
pub use repository::{Drones, EntityGuard, EntityRef, Jobs, Repository, StateCounts, Versioned};
pub use snapshot::{SNAPSHOT_POLL_INTERVAL, Snapshot, SnapshotStream};
pub use store::{MemoryStore, PutOutcome, ScanCallback, SharedStore, Store};

#[cfg(feature = "redis")]
pub use store::RedisStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
