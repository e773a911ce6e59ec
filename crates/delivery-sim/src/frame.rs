//! Frame reporter: the textual stand-in for a map renderer.
//!
//! Each frame drains one snapshot stream per collection and tallies what it
//! saw. Frames are paced so that at most [`MAX_FRAMES_PER_SECOND`] are
//! produced, however fast the streams drain.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use delivery_domain::{DroneState, JobState};
use delivery_store::Database;
use serde::Serialize;
use tokio::time::Instant;

pub const MAX_FRAMES_PER_SECOND: u32 = 15;

/// What one pass over both collections showed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Frame {
    pub number: u64,
    pub jobs: Vec<(JobState, usize)>,
    pub drones: Vec<(DroneState, usize)>,
    /// Jobs that moved since their previous write.
    pub trails: usize,
    /// Id of the example drone, if it was seen.
    pub example: Option<i64>,
}

impl Frame {
    pub fn jobs_in(&self, state: JobState) -> usize {
        self.jobs.iter().find(|(s, _)| *s == state).map_or(0, |(_, n)| *n)
    }

    pub fn drones_in(&self, state: DroneState) -> usize {
        self.drones.iter().find(|(s, _)| *s == state).map_or(0, |(_, n)| *n)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {} | jobs", self.number)?;
        for (state, count) in self.jobs.iter().filter(|(_, n)| *n > 0) {
            write!(f, " {state}={count}")?;
        }
        write!(f, " trails={} | drones", self.trails)?;
        for (state, count) in self.drones.iter().filter(|(_, n)| *n > 0) {
            write!(f, " {state}={count}")?;
        }
        Ok(())
    }
}

/// Produces [`Frame`]s from the database.
pub struct FrameReporter {
    db: Arc<Database>,
    interval: Duration,
    last_frame: Option<Instant>,
    frames: u64,
}

impl FrameReporter {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_max_fps(db, MAX_FRAMES_PER_SECOND)
    }

    pub fn with_max_fps(db: Arc<Database>, fps: u32) -> Self {
        Self {
            db,
            interval: Duration::from_secs(1) / fps.max(1),
            last_frame: None,
            frames: 0,
        }
    }

    /// Wait for the next frame slot, then take a frame. `None` while the
    /// database is disconnected.
    pub async fn render(&mut self) -> Option<Frame> {
        if let Some(last) = self.last_frame {
            tokio::time::sleep_until(last + self.interval).await;
        }
        self.last_frame = Some(Instant::now());

        if !self.db.is_connected() {
            tracing::warn!("Not connected; skipping frame");
            return None;
        }

        let mut jobs = [0usize; JobState::ALL.len()];
        let mut drones = [0usize; DroneState::ALL.len()];
        let mut trails = 0;
        let mut example = None;

        let mut job_stream = self.db.jobs().snapshot_stream();
        let mut drone_stream = self.db.drones().snapshot_stream();
        while let Some(job) = job_stream.next().await {
            jobs[job.state().ordinal()] += 1;
            trails += usize::from(job.has_moved());
        }
        while let Some(drone) = drone_stream.next().await {
            drones[drone.state().ordinal()] += 1;
            if drone.is_example {
                example = Some(drone.id());
            }
        }

        self.frames += 1;
        let frame = Frame {
            number: self.frames,
            jobs: JobState::ALL.iter().map(|s| (*s, jobs[s.ordinal()])).collect(),
            drones: DroneState::ALL.iter().map(|s| (*s, drones[s.ordinal()])).collect(),
            trails,
            example,
        };
        tracing::debug!("{frame}");
        Some(frame)
    }

    pub const fn frames(&self) -> u64 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delivery_domain::{Drone, Job, Location};
    use delivery_store::{MemoryStore, StoreConfig};

    async fn populated() -> Arc<Database> {
        let db = Arc::new(Database::in_memory(&StoreConfig::default()).await);
        db.jobs().new_entity(JobState::Waiting).await;
        let moved = db
            .jobs()
            .new_entity_with(JobState::Waiting, |job: &mut Job| job.move_to(Location::new(0.1, 0.1)))
            .await;
        let mut guard = moved.lock().await;
        assert!(db.jobs().transition(&mut guard, JobState::Waiting, JobState::InProcess).await);
        drop(guard);
        db.drones()
            .new_entity_with(DroneState::Ready, |drone: &mut Drone| drone.is_example = true)
            .await;
        db
    }

    #[tokio::test]
    async fn test_frame_tallies_states() {
        let mut reporter = FrameReporter::new(populated().await);
        let frame = reporter.render().await.expect("connected");

        assert_eq!(frame.number, 1);
        assert_eq!(frame.jobs_in(JobState::Waiting), 1);
        assert_eq!(frame.jobs_in(JobState::InProcess), 1);
        assert_eq!(frame.drones_in(DroneState::Ready), 1);
        assert_eq!(frame.trails, 1);
        assert_eq!(frame.example, Some(1));
        assert_eq!(
            frame.to_string(),
            "frame 1 | jobs Waiting=1 InProcess=1 trails=1 | drones Ready=1"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_are_paced() {
        let mut reporter = FrameReporter::new(populated().await);
        let start = Instant::now();
        for _ in 0..3 {
            reporter.render().await;
        }
        assert!(start.elapsed() >= Duration::from_secs(1) / MAX_FRAMES_PER_SECOND * 2);
        assert_eq!(reporter.frames(), 3);
    }

    #[tokio::test]
    async fn test_disconnected_frame_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let db = Arc::new(Database::with_store(store.clone()).await);
        store.set_connected(false);

        let mut reporter = FrameReporter::new(db);
        assert!(reporter.render().await.is_none());
        assert_eq!(reporter.frames(), 0);
    }
}
