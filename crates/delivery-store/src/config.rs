//! # Store Configuration
//!
//! Environment-based configuration for the networked store.

use std::env;

/// Redis store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Connection URL
    pub url: String,

    /// Key prefix separating simulations sharing one server
    pub namespace: String,

    /// Concurrent record fetchers per scan
    pub scan_workers: usize,

    /// Keys requested per SSCAN round-trip
    pub scan_batch: usize,
}

impl StoreConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            url: env::var("REDIS_URL").unwrap_or(defaults.url),
            namespace: env::var("DELIVERY_NAMESPACE").unwrap_or(defaults.namespace),
            scan_workers: env::var("SCAN_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.scan_workers),
            scan_batch: env::var("SCAN_BATCH")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.scan_batch),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            namespace: "test".to_string(),
            scan_workers: 8,
            scan_batch: 256,
        }
    }
}
