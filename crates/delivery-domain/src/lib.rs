//! # Delivery Fleet - Domain Model
//!
//! Entities, value objects and state enums for the drone delivery
//! simulation. These types are shared by the store layer and the simulator;
//! they know nothing about persistence.
//!
//! Coordinates are decimal degrees: `x` is longitude, `y` is latitude.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use geo::{Distance, Euclidean, Point};
use serde::{Deserialize, Serialize};

// =============================================================================
// VALUE OBJECTS
// =============================================================================

/// A position on the map in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    /// Longitude.
    pub x: f64,
    /// Latitude.
    pub y: f64,
}

impl Location {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn to_point(self) -> Point<f64> {
        Point::new(self.x, self.y)
    }

    /// Planar distance in degrees.
    #[must_use]
    pub fn distance_to(&self, other: &Location) -> f64 {
        Euclidean::distance(self.to_point(), other.to_point())
    }

    /// Move `step` degrees towards `target`, stopping on it.
    #[must_use]
    pub fn step_towards(&self, target: &Location, step: f64) -> Location {
        let distance = self.distance_to(target);
        if distance <= step || distance == 0.0 {
            return *target;
        }
        let fraction = step / distance;
        Location {
            x: self.x + (target.x - self.x) * fraction,
            y: self.y + (target.y - self.y) * fraction,
        }
    }
}

impl From<Point<f64>> for Location {
    fn from(point: Point<f64>) -> Self {
        Self::new(point.x(), point.y())
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.5}, {:.5})", self.x, self.y)
    }
}

// =============================================================================
// ENUMS
// =============================================================================

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Init,
    Waiting,
    InProcess,
    OnHold,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Init,
        JobState::Waiting,
        JobState::InProcess,
        JobState::OnHold,
    ];

    /// Name as written to the store. The job's origin lives in a field with
    /// this name, which is what the geo index keys on.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Waiting => "Waiting",
            Self::InProcess => "InProcess",
            Self::OnHold => "OnHold",
        }
    }

    pub const fn ordinal(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DomainError::UnknownState {
                entity_type: "job",
                name: s.to_string(),
            })
    }
}

/// Drone lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DroneState {
    Init,
    Ready,
    GotAJob,
    Departing,
    EnRoute,
    ArrivedAtJob,
    Delivering,
    Delivered,
    Done,
    OffDuty,
}

impl DroneState {
    pub const ALL: [DroneState; 10] = [
        DroneState::Init,
        DroneState::Ready,
        DroneState::GotAJob,
        DroneState::Departing,
        DroneState::EnRoute,
        DroneState::ArrivedAtJob,
        DroneState::Delivering,
        DroneState::Delivered,
        DroneState::Done,
        DroneState::OffDuty,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Ready => "Ready",
            Self::GotAJob => "GotAJob",
            Self::Departing => "Departing",
            Self::EnRoute => "EnRoute",
            Self::ArrivedAtJob => "ArrivedAtJob",
            Self::Delivering => "Delivering",
            Self::Delivered => "Delivered",
            Self::Done => "Done",
            Self::OffDuty => "OffDuty",
        }
    }

    pub const fn ordinal(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for DroneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DroneState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DomainError::UnknownState {
                entity_type: "drone",
                name: s.to_string(),
            })
    }
}

// =============================================================================
// ENTITY TYPES
// =============================================================================

/// A parcel to be carried from `origin` to `destination`.
///
/// `id` and `state` are read-only from outside; state only moves through a
/// repository transition so that the persisted record and the per-state
/// counters stay in step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: i64,
    state: JobState,

    pub origin: Location,
    pub destination: Location,
    pub location: Location,
    pub previous_location: Location,

    /// Carrying drone, 0 when unassigned.
    pub drone_id: i64,
    /// Set while a drone is evaluating this job.
    pub is_candidate: bool,

    pub time_picked_up: Option<DateTime<Utc>>,
    pub time_delivered: Option<DateTime<Utc>>,
}

impl Job {
    /// A fresh job in `Init`, sitting at the default location.
    pub fn new(id: i64) -> Self {
        Self {
            id,
            state: JobState::Init,
            origin: Location::default(),
            destination: Location::default(),
            location: Location::default(),
            previous_location: Location::default(),
            drone_id: 0,
            is_candidate: false,
            time_picked_up: None,
            time_delivered: None,
        }
    }

    /// A job waiting at `origin` to be taken to `destination`.
    pub fn at(id: i64, origin: Location, destination: Location) -> Self {
        Self {
            origin,
            destination,
            location: origin,
            previous_location: origin,
            ..Self::new(id)
        }
    }

    pub const fn id(&self) -> i64 {
        self.id
    }

    pub const fn state(&self) -> JobState {
        self.state
    }

    /// Raw state write. Used by the store layer when decoding a record and
    /// inside a transition; everything else goes through the repository.
    pub fn set_state(&mut self, state: JobState) {
        self.state = state;
    }

    /// Move the job, remembering where it was.
    pub fn move_to(&mut self, location: Location) {
        self.previous_location = self.location;
        self.location = location;
    }

    /// True when there is a trail to draw.
    pub fn has_moved(&self) -> bool {
        self.previous_location != self.location
    }

    /// `drone_id != 0` only while in process or (transiently) on hold.
    pub fn is_assignment_consistent(&self) -> bool {
        self.drone_id == 0 || matches!(self.state, JobState::InProcess | JobState::OnHold)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job {} {} at {} -> {}",
            self.id, self.state, self.location, self.destination
        )?;
        if self.drone_id != 0 {
            write!(f, " drone {}", self.drone_id)?;
        }
        Ok(())
    }
}

/// Read-only copy of the job a drone is working on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobAssignment {
    pub job_id: i64,
    pub origin: Location,
    pub destination: Location,
}

/// A delivery drone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drone {
    id: i64,
    state: DroneState,

    pub location: Location,
    /// Where the current search or trip started.
    pub start_location: Location,
    /// Current search radius in degrees, 0 when not searching.
    pub current_radius: f64,
    pub assignment: Option<JobAssignment>,
    /// Driven by the simulation loop and highlighted in frames.
    pub is_example: bool,
}

impl Drone {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            state: DroneState::Init,
            location: Location::default(),
            start_location: Location::default(),
            current_radius: 0.0,
            assignment: None,
            is_example: false,
        }
    }

    pub fn at(id: i64, location: Location) -> Self {
        Self {
            location,
            start_location: location,
            ..Self::new(id)
        }
    }

    pub const fn id(&self) -> i64 {
        self.id
    }

    pub const fn state(&self) -> DroneState {
        self.state
    }

    /// Raw state write; see [`Job::set_state`].
    pub fn set_state(&mut self, state: DroneState) {
        self.state = state;
    }

    pub const fn has_job(&self) -> bool {
        self.assignment.is_some()
    }
}

impl fmt::Display for Drone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "drone {} {} at {}", self.id, self.state, self.location)?;
        if let Some(assignment) = &self.assignment {
            write!(f, " job {}", assignment.job_id)?;
        }
        Ok(())
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Domain-level errors
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("Unknown {entity_type} state: {name:?}")]
    UnknownState {
        entity_type: &'static str,
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use fake::Fake;

    #[test]
    fn test_state_names_parse_back() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        for state in DroneState::ALL {
            assert_eq!(state.to_string().parse::<DroneState>().unwrap(), state);
        }
        assert!("Delivering".parse::<JobState>().is_err());
    }

    #[test]
    fn test_ordinals_index_all() {
        for (i, state) in JobState::ALL.iter().enumerate() {
            assert_eq!(state.ordinal(), i);
        }
        for (i, state) in DroneState::ALL.iter().enumerate() {
            assert_eq!(state.ordinal(), i);
        }
    }

    #[test]
    fn test_distance_is_planar_degrees() {
        let a = Location::new(0.0, 0.0);
        let b = Location::new(3.0, 4.0);
        assert!((a.distance_to(&b) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_step_towards_stops_on_target() {
        let x: f64 = (-0.5..0.5).fake();
        let y: f64 = (-0.5..0.5).fake();
        let start = Location::new(x, y);
        let target = Location::new(x + 0.03, y);

        let first = start.step_towards(&target, 0.02);
        assert!((first.x - (x + 0.02)).abs() < 1e-9);
        assert_eq!(first.step_towards(&target, 0.02), target);
    }

    #[test]
    fn test_job_trail() {
        let mut job = Job::at(7, Location::new(0.1, 0.1), Location::new(0.2, 0.2));
        assert!(!job.has_moved());
        job.move_to(Location::new(0.11, 0.1));
        assert!(job.has_moved());
        assert_eq!(job.previous_location, Location::new(0.1, 0.1));
    }

    #[test]
    fn test_assignment_consistency() {
        let mut job = Job::new(1);
        job.set_state(JobState::Waiting);
        assert!(job.is_assignment_consistent());
        job.drone_id = 3;
        assert!(!job.is_assignment_consistent());
        job.set_state(JobState::InProcess);
        assert!(job.is_assignment_consistent());
    }
}
