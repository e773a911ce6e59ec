//! # Snapshot Streamer
//!
//! Turns one full scan, delivered concurrently by the store's workers, into
//! a sequence a single consumer can pull from at its own pace.
//!
//! ```text
//!   worker 1 ──┐
//!   worker 2 ──┼──► unbounded queue ──► SnapshotStream::next()
//!   worker N ──┘         ▲
//!                        └── End, once the scan returns
//! ```
//!
//! The stream is finite and not restartable: ask the repository for a new
//! one to observe the collection again.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::entity::Entity;
use crate::metering::Metering;
use crate::repository::{Repository, Versioned, log_scan_error};
use crate::store::ScanCallback;

/// How long a pull waits before polling again.
pub const SNAPSHOT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// One queue element.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot<E> {
    Item(Versioned<E>),
    /// Every record of the scan has been queued.
    End,
}

/// Consumer side of one snapshot pass.
pub struct SnapshotStream<E> {
    rx: mpsc::UnboundedReceiver<Snapshot<E>>,
    done: bool,
}

impl<E: Entity> SnapshotStream<E> {
    /// Next entity, or `None` once the pass is over.
    ///
    /// Entities arrive in no particular order; a record re-delivered by the
    /// backend shows up twice.
    pub async fn next(&mut self) -> Option<Versioned<E>> {
        if self.done {
            return None;
        }
        loop {
            match tokio::time::timeout(SNAPSHOT_POLL_INTERVAL, self.rx.recv()).await {
                Ok(Some(Snapshot::Item(entity))) => return Some(entity),
                Ok(Some(Snapshot::End)) => {
                    self.done = true;
                    return None;
                }
                Ok(None) => {
                    tracing::warn!(collection = E::COLLECTION, "Snapshot producer went away without an end marker");
                    self.done = true;
                    return None;
                }
                Err(_elapsed) => {
                    tracing::trace!(collection = E::COLLECTION, "Still waiting for snapshot");
                }
            }
        }
    }

    /// Drain the rest of the pass.
    pub async fn collect_all(mut self) -> Vec<Versioned<E>> {
        let mut entities = Vec::new();
        while let Some(entity) = self.next().await {
            entities.push(entity);
        }
        entities
    }
}

impl<E: Entity> Repository<E> {
    /// Start a background scan and return the stream it feeds.
    ///
    /// Callers check [`Repository::is_connected`] first; while disconnected
    /// the stream ends immediately.
    pub fn snapshot_stream(&self) -> SnapshotStream<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Arc::clone(&self.store);
        let metering = Arc::clone(&self.metering);

        tokio::spawn(async move {
            if store.is_connected() {
                Metering::bump(&metering.scans);
                let sink = tx.clone();
                let callback: ScanCallback = Arc::new(move |id, record| {
                    Metering::bump(&metering.scan_results);
                    match Versioned::<E>::from_record(id, &record) {
                        // The receiver only disappears when the consumer stopped reading.
                        Ok(entity) => {
                            let _ = sink.send(Snapshot::Item(entity));
                        }
                        Err(e) => tracing::warn!(collection = E::COLLECTION, id, error = %e, "Skipping undecodable record"),
                    }
                    ControlFlow::Continue(())
                });
                if let Err(e) = store.scan_all(E::COLLECTION, callback).await {
                    log_scan_error::<E>(&e);
                }
            }
            let _ = tx.send(Snapshot::End);
        });

        SnapshotStream { rx, done: false }
    }
}
