//! Fleet simulation: drones search for waiting jobs, claim one, fly to it,
//! carry it to its destination and leave it on hold there.
//!
//! ```text
//! Ready ─► GotAJob ─► Departing ─► EnRoute ─► ArrivedAtJob
//!   ▲                                              │
//!   └── Done ◄── Delivered ◄────── Delivering ◄────┘
//! ```
//!
//! Every state change and every move is a generation-checked write, so two
//! drones going for the same job cannot both get it: the loser sees its
//! transition rejected and tries the next candidate.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use delivery_domain::{Drone, DroneState, Job, JobAssignment, JobState, Location};
use delivery_store::{Database, EntityGuard, EntityRef, MatchStrategy, Versioned};
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Tunables for the simulated fleet.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Middle of the service area.
    pub center: Location,
    /// Standard deviation, in degrees, of job and drone placement.
    pub spread: f64,
    /// First search radius in degrees.
    pub search_radius: f64,
    /// Searches widen by half each empty round, up to this.
    pub max_radius: f64,
    /// Degrees flown per tick.
    pub speed: f64,
    /// Candidates considered per search.
    pub candidates: usize,
    pub strategy: MatchStrategy,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            center: Location::new(0.0, 0.0),
            spread: 0.05,
            search_radius: 0.02,
            max_radius: 0.25,
            speed: 0.002,
            candidates: 4,
            strategy: MatchStrategy::Indexed,
        }
    }
}

/// Random placement around the center of the area.
#[derive(Debug)]
struct Scatter {
    x: Normal<f64>,
    y: Normal<f64>,
}

impl Scatter {
    fn new(center: Location, spread: f64) -> Result<Self> {
        Ok(Self {
            x: Normal::new(center.x, spread).context("invalid placement spread")?,
            y: Normal::new(center.y, spread).context("invalid placement spread")?,
        })
    }

    fn sample(&self) -> Location {
        let mut rng = rand::thread_rng();
        Location::new(self.x.sample(&mut rng), self.y.sample(&mut rng))
    }
}

/// What one drone did during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Idle,
    Searched,
    Claimed,
    LostRace,
    Moved,
    PickedUp,
    Delivered,
    Failed,
}

/// Tally of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub searches: usize,
    pub claims: usize,
    pub lost_races: usize,
    pub moves: usize,
    pub pickups: usize,
    pub deliveries: usize,
    pub failures: usize,
}

impl TickReport {
    fn record(&mut self, step: Step) {
        match step {
            Step::Idle => {}
            Step::Searched => self.searches += 1,
            Step::Claimed => self.claims += 1,
            Step::LostRace => self.lost_races += 1,
            Step::Moved => self.moves += 1,
            Step::PickedUp => self.pickups += 1,
            Step::Delivered => self.deliveries += 1,
            Step::Failed => self.failures += 1,
        }
    }

    /// Add another tick's numbers to this one.
    pub fn absorb(&mut self, other: &TickReport) {
        self.searches += other.searches;
        self.claims += other.claims;
        self.lost_races += other.lost_races;
        self.moves += other.moves;
        self.pickups += other.pickups;
        self.deliveries += other.deliveries;
        self.failures += other.failures;
    }
}

struct Shared {
    db: Arc<Database>,
    config: FleetConfig,
    scatter: Scatter,
}

/// One drone and the job it carries.
struct Pilot {
    drone: EntityRef<Drone>,
    job: Option<EntityRef<Job>>,
}

/// The simulated fleet.
pub struct Fleet {
    shared: Arc<Shared>,
    pilots: Vec<Pilot>,
}

impl Fleet {
    /// Create `jobs` waiting jobs and `drones` ready drones. The first drone
    /// is the example drone.
    pub async fn populate(db: Arc<Database>, jobs: usize, drones: usize, config: FleetConfig) -> Result<Self> {
        let scatter = Scatter::new(config.center, config.spread)?;

        let mut unsaved = 0;
        for _ in 0..jobs {
            let (origin, destination) = (scatter.sample(), scatter.sample());
            let job = db
                .jobs()
                .new_entity_with(JobState::Waiting, move |job: &mut Job| {
                    *job = Job::at(job.id(), origin, destination);
                })
                .await;
            if job.snapshot().await.state() != JobState::Waiting {
                unsaved += 1;
            }
        }

        let mut pilots = Vec::with_capacity(drones);
        for i in 0..drones {
            let location = scatter.sample();
            let drone = db
                .drones()
                .new_entity_with(DroneState::Ready, move |drone: &mut Drone| {
                    *drone = Drone::at(drone.id(), location);
                    drone.is_example = i == 0;
                })
                .await;
            if drone.snapshot().await.state() != DroneState::Ready {
                unsaved += 1;
            }
            pilots.push(Pilot { drone, job: None });
        }

        if unsaved > 0 {
            tracing::warn!(unsaved, "Some entities could not be stored");
        }
        tracing::info!(jobs, drones, strategy = ?config.strategy, "Fleet populated");

        Ok(Self {
            shared: Arc::new(Shared { db, config, scatter }),
            pilots,
        })
    }

    pub fn len(&self) -> usize {
        self.pilots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pilots.is_empty()
    }

    /// Advance every drone by one step, all drones concurrently.
    pub async fn tick(&mut self) -> TickReport {
        let mut tasks = JoinSet::new();
        for mut pilot in self.pilots.drain(..) {
            let shared = Arc::clone(&self.shared);
            tasks.spawn(async move {
                let step = pilot.step(&shared).await;
                (pilot, step)
            });
        }

        let mut report = TickReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((pilot, step)) => {
                    report.record(step);
                    self.pilots.push(pilot);
                }
                Err(e) => tracing::error!(error = %e, "Drone task failed; drone dropped from the fleet"),
            }
        }
        report
    }

    /// Send idle drones off duty. Returns how many went.
    pub async fn stand_down(&self) -> usize {
        let drones = self.shared.db.drones();
        let mut count = 0;
        for pilot in &self.pilots {
            let mut drone = pilot.drone.lock().await;
            if drones.transition(&mut drone, DroneState::Ready, DroneState::OffDuty).await {
                count += 1;
            }
        }
        tracing::info!(off_duty = count, "Fleet stood down");
        count
    }
}

impl Pilot {
    async fn step(&mut self, shared: &Shared) -> Step {
        let drones = shared.db.drones();
        let mut drone = self.drone.lock().await;
        let step = match drone.state() {
            DroneState::Ready => self.search(shared, &mut drone).await,
            DroneState::GotAJob => advance(shared, &mut drone, DroneState::GotAJob, DroneState::Departing).await,
            DroneState::Departing => advance(shared, &mut drone, DroneState::Departing, DroneState::EnRoute).await,
            DroneState::EnRoute => fly_to_pickup(shared, &mut drone).await,
            DroneState::ArrivedAtJob => self.pick_up(shared, &mut drone).await,
            DroneState::Delivering => self.carry(shared, &mut drone).await,
            DroneState::Delivered => self.drop_off(shared, &mut drone).await,
            DroneState::Done => {
                drone.start_location = drone.location;
                if drones.transition(&mut drone, DroneState::Done, DroneState::Ready).await {
                    Step::Moved
                } else {
                    Step::Failed
                }
            }
            DroneState::Init | DroneState::OffDuty => Step::Idle,
        };
        if drone.is_example && step != Step::Idle {
            tracing::info!(drone = drone.id(), state = %drone.state(), location = %drone.location, ?step, "Example drone");
        }
        step
    }

    async fn search(&mut self, shared: &Shared, drone: &mut EntityGuard<Drone>) -> Step {
        let config = &shared.config;
        let radius = if drone.current_radius > 0.0 {
            drone.current_radius
        } else {
            config.search_radius
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let wanted = config.candidates.max(1);
        let taken = AtomicUsize::new(0);
        shared
            .db
            .jobs()
            .nearest_jobs(drone.location, radius, config.strategy, move |job| {
                if tx.send(job).is_err() || taken.fetch_add(1, Ordering::Relaxed) + 1 >= wanted {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .await;

        let mut candidates: Vec<Versioned<Job>> = Vec::new();
        while let Ok(job) = rx.try_recv() {
            candidates.push(job);
        }
        candidates.sort_by(|a, b| {
            drone
                .location
                .distance_to(&a.origin)
                .total_cmp(&drone.location.distance_to(&b.origin))
        });

        let mut lost = false;
        for candidate in candidates.into_iter().take(wanted) {
            if self.claim(shared, drone, candidate).await {
                return Step::Claimed;
            }
            lost = true;
        }
        if lost {
            return Step::LostRace;
        }

        // Nothing nearby: look further next time.
        drone.current_radius = (radius * 1.5).min(config.max_radius);
        if !shared.db.drones().put(drone).await {
            return Step::Failed;
        }
        Step::Searched
    }

    async fn claim(&mut self, shared: &Shared, drone: &mut EntityGuard<Drone>, candidate: Versioned<Job>) -> bool {
        let jobs = shared.db.jobs();
        let job = EntityRef::from(candidate);
        let mut guard = job.lock().await;

        guard.is_candidate = true;
        if !jobs.put(&mut guard).await {
            return false;
        }
        guard.is_candidate = false;
        guard.drone_id = drone.id();
        guard.time_picked_up = None;
        guard.time_delivered = None;
        if !jobs.transition(&mut guard, JobState::Waiting, JobState::InProcess).await {
            return false;
        }

        drone.assignment = Some(JobAssignment {
            job_id: guard.id(),
            origin: guard.origin,
            destination: guard.destination,
        });
        drone.current_radius = 0.0;
        drone.start_location = drone.location;
        if !shared.db.drones().transition(drone, DroneState::Ready, DroneState::GotAJob).await {
            drone.assignment = None;
            guard.drone_id = 0;
            if !jobs.transition(&mut guard, JobState::InProcess, JobState::Waiting).await {
                tracing::warn!(job = guard.id(), "Claimed job could not be released");
            }
            return false;
        }
        drop(guard);
        self.job = Some(job);
        true
    }

    async fn pick_up(&mut self, shared: &Shared, drone: &mut EntityGuard<Drone>) -> Step {
        let Some(job) = &self.job else {
            return abandon(shared, drone, DroneState::ArrivedAtJob).await;
        };
        let mut guard = job.lock().await;
        guard.time_picked_up = Some(Utc::now());
        if !shared.db.jobs().put(&mut guard).await {
            return Step::Failed;
        }
        drop(guard);
        if shared.db.drones().transition(drone, DroneState::ArrivedAtJob, DroneState::Delivering).await {
            Step::PickedUp
        } else {
            Step::Failed
        }
    }

    async fn carry(&mut self, shared: &Shared, drone: &mut EntityGuard<Drone>) -> Step {
        let (Some(job), Some(assignment)) = (&self.job, drone.assignment) else {
            return abandon(shared, drone, DroneState::Delivering).await;
        };
        let next = drone.location.step_towards(&assignment.destination, shared.config.speed);
        drone.location = next;
        if !shared.db.drones().put(drone).await {
            return Step::Failed;
        }

        let mut guard = job.lock().await;
        guard.move_to(next);
        if !shared.db.jobs().put(&mut guard).await {
            return Step::Failed;
        }
        drop(guard);

        if next == assignment.destination
            && !shared.db.drones().transition(drone, DroneState::Delivering, DroneState::Delivered).await
        {
            return Step::Failed;
        }
        Step::Moved
    }

    async fn drop_off(&mut self, shared: &Shared, drone: &mut EntityGuard<Drone>) -> Step {
        let Some(job) = self.job.clone() else {
            return abandon(shared, drone, DroneState::Delivered).await;
        };
        let jobs = shared.db.jobs();
        let mut guard = job.lock().await;

        // The parcel waits at its destination for a new trip.
        let previous = (guard.origin, guard.destination, guard.drone_id);
        guard.time_delivered = Some(Utc::now());
        guard.origin = guard.destination;
        guard.destination = shared.scatter.sample();
        guard.drone_id = 0;
        if !jobs.transition(&mut guard, JobState::InProcess, JobState::OnHold).await {
            (guard.origin, guard.destination, guard.drone_id) = previous;
            guard.time_delivered = None;
            return Step::Failed;
        }
        drop(guard);

        self.job = None;
        drone.assignment = None;
        if shared.db.drones().transition(drone, DroneState::Delivered, DroneState::Done).await {
            Step::Delivered
        } else {
            Step::Failed
        }
    }
}

async fn advance(shared: &Shared, drone: &mut EntityGuard<Drone>, from: DroneState, to: DroneState) -> Step {
    if shared.db.drones().transition(drone, from, to).await {
        Step::Moved
    } else {
        Step::Failed
    }
}

async fn fly_to_pickup(shared: &Shared, drone: &mut EntityGuard<Drone>) -> Step {
    let Some(assignment) = drone.assignment else {
        return abandon(shared, drone, DroneState::EnRoute).await;
    };
    drone.location = drone.location.step_towards(&assignment.origin, shared.config.speed);
    if !shared.db.drones().put(drone).await {
        return Step::Failed;
    }
    if drone.location == assignment.origin
        && !shared.db.drones().transition(drone, DroneState::EnRoute, DroneState::ArrivedAtJob).await
    {
        return Step::Failed;
    }
    Step::Moved
}

/// A drone mid-trip without a job to carry goes back to Ready.
async fn abandon(shared: &Shared, drone: &mut EntityGuard<Drone>, from: DroneState) -> Step {
    tracing::warn!(drone = drone.id(), state = %from, "Drone lost track of its job");
    drone.assignment = None;
    if shared.db.drones().transition(drone, from, DroneState::Ready).await {
        Step::Idle
    } else {
        Step::Failed
    }
}
