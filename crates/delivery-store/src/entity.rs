//! # Persistable Entities
//!
//! What the generic repository needs to know about jobs and drones: their
//! state enum, their collection, and how they map to and from records.

use std::fmt;
use std::hash::Hash;

use delivery_domain::{Drone, DroneState, Job, JobAssignment, JobState};

use crate::error::{Result, StoreError};
use crate::record::{Bins, FieldError, Record, Value, timestamp_to_pair};

/// State enum of a persistable entity.
pub trait EntityState:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Construction state; the only one allowing a `from == to` transition.
    const INIT: Self;

    /// Number of states; ordinals are `0..COUNT`.
    const COUNT: usize;

    fn ordinal(self) -> usize;

    /// `(held, released)`: entities entering `held` are tracked for the
    /// hold promoter, which moves them to `released`.
    fn hold() -> Option<(Self, Self)> {
        None
    }
}

impl EntityState for JobState {
    const INIT: Self = JobState::Init;
    const COUNT: usize = JobState::ALL.len();

    fn ordinal(self) -> usize {
        JobState::ordinal(&self)
    }

    fn hold() -> Option<(Self, Self)> {
        Some((JobState::OnHold, JobState::Waiting))
    }
}

impl EntityState for DroneState {
    const INIT: Self = DroneState::Init;
    const COUNT: usize = DroneState::ALL.len();

    fn ordinal(self) -> usize {
        DroneState::ordinal(&self)
    }
}

/// An entity the repository can persist.
pub trait Entity: Clone + fmt::Debug + fmt::Display + Send + Sync + 'static {
    type State: EntityState;

    /// Collection (set) name in the store.
    const COLLECTION: &'static str;

    /// A new entity in the `INIT` state.
    fn with_id(id: i64) -> Self;

    fn id(&self) -> i64;

    fn state(&self) -> Self::State;

    fn set_state(&mut self, state: Self::State);

    /// Every observable attribute, not a delta.
    fn to_bins(&self) -> Bins;

    /// Rebuild from a full field set, trusting its `state` field.
    fn from_bins(id: i64, record: &Record) -> Result<Self>;
}

fn field<T>(
    collection: &'static str,
    id: i64,
    name: &str,
    value: std::result::Result<T, FieldError>,
) -> Result<T> {
    value.map_err(|reason| StoreError::Codec {
        collection,
        id,
        field: name.to_string(),
        reason: reason.to_string(),
    })
}

fn geo(bins: &mut Bins, name: &str, location: delivery_domain::Location) {
    bins.insert(name.to_string(), Value::Geo(location));
}

// =============================================================================
// JOB
// =============================================================================

impl Entity for Job {
    type State = JobState;

    const COLLECTION: &'static str = "jobs";

    fn with_id(id: i64) -> Self {
        Job::new(id)
    }

    fn id(&self) -> i64 {
        Job::id(self)
    }

    fn state(&self) -> JobState {
        Job::state(self)
    }

    fn set_state(&mut self, state: JobState) {
        Job::set_state(self, state);
    }

    fn to_bins(&self) -> Bins {
        let state = Job::state(self).as_str();
        let mut bins = Bins::new();
        bins.insert("id".into(), Value::Int(Job::id(self)));
        bins.insert("state".into(), Value::Str(state.to_string()));
        // The origin lives under the state's name so that the geo index on
        // "Waiting" only ever sees waiting jobs.
        geo(&mut bins, state, self.origin);
        geo(&mut bins, "destination", self.destination);
        geo(&mut bins, "location", self.location);
        geo(&mut bins, "previous", self.previous_location);
        bins.insert("candidate".into(), Value::Bool(self.is_candidate));
        bins.insert("droneid".into(), Value::Int(self.drone_id));
        if let Some(ts) = self.time_picked_up {
            bins.insert("pickedUp".into(), Value::Pair(timestamp_to_pair(ts)));
        }
        if let Some(ts) = self.time_delivered {
            bins.insert("delivered".into(), Value::Pair(timestamp_to_pair(ts)));
        }
        bins
    }

    fn from_bins(id: i64, record: &Record) -> Result<Self> {
        const SET: &str = "jobs";
        let state: JobState = field(SET, id, "state", record.str("state"))?.parse()?;
        let mut job = Job::new(field(SET, id, "id", record.int("id"))?);
        job.set_state(state);
        job.origin = field(SET, id, state.as_str(), record.geo(state.as_str()))?;
        job.destination = field(SET, id, "destination", record.geo("destination"))?;
        job.location = field(SET, id, "location", record.geo("location"))?;
        job.previous_location = field(SET, id, "previous", record.geo("previous"))?;
        job.is_candidate = field(SET, id, "candidate", record.bool("candidate"))?;
        job.drone_id = field(SET, id, "droneid", record.int("droneid"))?;
        job.time_picked_up = field(SET, id, "pickedUp", record.timestamp("pickedUp"))?;
        job.time_delivered = field(SET, id, "delivered", record.timestamp("delivered"))?;
        Ok(job)
    }
}

// =============================================================================
// DRONE
// =============================================================================

impl Entity for Drone {
    type State = DroneState;

    const COLLECTION: &'static str = "drones";

    fn with_id(id: i64) -> Self {
        Drone::new(id)
    }

    fn id(&self) -> i64 {
        Drone::id(self)
    }

    fn state(&self) -> DroneState {
        Drone::state(self)
    }

    fn set_state(&mut self, state: DroneState) {
        Drone::set_state(self, state);
    }

    fn to_bins(&self) -> Bins {
        let mut bins = Bins::new();
        bins.insert("id".into(), Value::Int(Drone::id(self)));
        bins.insert("state".into(), Value::Str(Drone::state(self).as_str().to_string()));
        geo(&mut bins, "location", self.location);
        geo(&mut bins, "start", self.start_location);
        bins.insert("radius".into(), Value::Float(self.current_radius));
        bins.insert("example".into(), Value::Bool(self.is_example));
        if let Some(assignment) = &self.assignment {
            bins.insert("jobid".into(), Value::Int(assignment.job_id));
            geo(&mut bins, "jobOrigin", assignment.origin);
            geo(&mut bins, "jobDestination", assignment.destination);
        }
        bins
    }

    fn from_bins(id: i64, record: &Record) -> Result<Self> {
        const SET: &str = "drones";
        let state: DroneState = field(SET, id, "state", record.str("state"))?.parse()?;
        let mut drone = Drone::new(field(SET, id, "id", record.int("id"))?);
        drone.set_state(state);
        drone.location = field(SET, id, "location", record.geo("location"))?;
        drone.start_location = field(SET, id, "start", record.geo("start"))?;
        drone.current_radius = field(SET, id, "radius", record.float("radius"))?;
        drone.is_example = field(SET, id, "example", record.bool("example"))?;
        drone.assignment = match record.int("jobid") {
            Ok(job_id) => Some(JobAssignment {
                job_id,
                origin: field(SET, id, "jobOrigin", record.geo("jobOrigin"))?,
                destination: field(SET, id, "jobDestination", record.geo("jobDestination"))?,
            }),
            Err(FieldError::Missing) => None,
            Err(reason) => return field(SET, id, "jobid", Err(reason)),
        };
        Ok(drone)
    }
}
