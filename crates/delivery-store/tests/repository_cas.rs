//! Optimistic-concurrency behavior of the repositories over the in-memory
//! store: versions, rejected transitions, races and counters.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use delivery_domain::{Drone, DroneState, Job, JobState, Location};
use delivery_store::{Jobs, MemoryStore, Repository, Store};
use tokio::task::JoinSet;
use tokio_test::assert_ok;

fn repository<E: delivery_store::Entity>() -> (Arc<MemoryStore>, Arc<Repository<E>>) {
    let store = Arc::new(MemoryStore::new());
    let repo = Arc::new(Repository::new(store.clone(), Arc::default()));
    (store, repo)
}

#[tokio::test]
async fn version_counts_successful_writes() {
    let (store, jobs) = repository::<Job>();
    let job = jobs.new_entity(JobState::Waiting).await;
    let mut guard = job.lock().await;

    let cycle = [
        (JobState::Waiting, JobState::InProcess),
        (JobState::InProcess, JobState::OnHold),
        (JobState::OnHold, JobState::Waiting),
    ];
    for (from, to) in cycle.iter().cycle().take(7) {
        assert!(jobs.transition(&mut guard, *from, *to).await);
    }
    // Rejected attempts do not write.
    assert!(!jobs.transition(&mut guard, JobState::Waiting, JobState::OnHold).await);

    assert_eq!(guard.version(), 8);
    let record = assert_ok!(store.get("jobs", guard.id()).await).expect("stored");
    assert_eq!(record.generation, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_copies_have_one_winner() {
    let (store, jobs) = repository::<Job>();
    let original = jobs.new_entity(JobState::Waiting).await;
    let id = original.id();

    let mut tasks = JoinSet::new();
    for drone_id in 1..=2 {
        let copy = assert_ok!(jobs.get_by_id(id).await).expect("stored");
        let jobs = Arc::clone(&jobs);
        tasks.spawn(async move {
            let mut guard = copy.lock().await;
            guard.drone_id = drone_id;
            let won = jobs.transition(&mut guard, JobState::Waiting, JobState::InProcess).await;
            (drone_id, won, guard.state())
        });
    }

    let mut winners = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (drone_id, won, state) = joined.unwrap();
        if won {
            winners.push(drone_id);
            assert_eq!(state, JobState::InProcess);
        } else {
            assert_eq!(state, JobState::Waiting);
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = jobs.get_by_id(id).await.unwrap().unwrap().snapshot().await;
    assert_eq!(stored.state(), JobState::InProcess);
    assert_eq!(stored.drone_id, winners[0]);
    assert_eq!(stored.version(), 2);
    assert_eq!(jobs.count(JobState::InProcess), 1);
    assert_eq!(jobs.count(JobState::Waiting), 0);

    // The original handle is now stale.
    let mut guard = original.lock().await;
    assert!(!jobs.transition(&mut guard, JobState::Waiting, JobState::InProcess).await);
    assert_eq!(guard.state(), JobState::Waiting);
    assert_eq!(assert_ok!(store.get("jobs", id).await).unwrap().generation, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn counters_sum_to_entities_created() {
    let (_, drones) = repository::<Drone>();
    let mut tasks = JoinSet::new();
    for _ in 0..40 {
        let drones = Arc::clone(&drones);
        tasks.spawn(async move {
            let drone = drones.new_entity(DroneState::Ready).await;
            let mut guard = drone.lock().await;
            let path = [
                DroneState::Ready,
                DroneState::GotAJob,
                DroneState::Departing,
                DroneState::EnRoute,
            ];
            for pair in path.windows(2) {
                assert!(drones.transition(&mut guard, pair[0], pair[1]).await);
            }
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }

    assert_eq!(drones.counts().total(), 40);
    assert_eq!(drones.count(DroneState::EnRoute), 40);
    assert_eq!(drones.count(DroneState::Ready), 0);
}

#[tokio::test]
async fn scanned_copy_can_be_transitioned() {
    let (_, jobs) = repository::<Job>();
    let job = jobs
        .new_entity_with(JobState::Waiting, |job: &mut Job| job.origin = Location::new(0.2, 0.2))
        .await;

    let scanned = jobs.snapshot_stream().collect_all().await;
    assert_eq!(scanned.len(), 1);
    let copy = delivery_store::EntityRef::from(scanned.into_iter().next().unwrap());

    let mut guard = copy.lock().await;
    assert_eq!(guard.origin, Location::new(0.2, 0.2));
    assert!(jobs.transition(&mut guard, JobState::Waiting, JobState::InProcess).await);
    drop(guard);

    let mut guard = job.lock().await;
    assert!(!jobs.transition(&mut guard, JobState::Waiting, JobState::InProcess).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn foreach_snapshot_visits_everything_despite_break() {
    let (_, jobs): (_, Arc<Jobs>) = repository::<Job>();
    for _ in 0..5 {
        jobs.new_entity(JobState::Waiting).await;
    }

    let visited = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&visited);
    jobs.foreach_snapshot(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        ControlFlow::Break(())
    })
    .await;

    assert_eq!(visited.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn disconnected_store_is_a_no_op() {
    let (store, jobs) = repository::<Job>();
    jobs.new_entity(JobState::Waiting).await;
    store.set_connected(false);

    let job = jobs.new_entity(JobState::Waiting).await;
    assert_eq!(job.snapshot().await.state(), JobState::Init);
    assert!(jobs.get_by_id(1).await.unwrap().is_none());
    assert_eq!(jobs.clear().await.unwrap(), 0);
    assert!(jobs.snapshot_stream().collect_all().await.is_empty());
    assert_eq!(jobs.count(JobState::Waiting), 1);
}

#[tokio::test]
async fn refused_write_leaves_no_trace() {
    let (store, jobs) = repository::<Job>();
    assert_ok!(store.create_geo_index("jobs", "Waiting").await);
    let job = jobs
        .new_entity_with(JobState::Waiting, |job: &mut Job| {
            job.origin = Location::new(10.0, 80.0);
        })
        .await;
    let mut guard = job.lock().await;
    assert!(jobs.transition(&mut guard, JobState::Waiting, JobState::InProcess).await);

    // Beyond what the index can hold once the job waits again.
    guard.origin = Location::new(10.0, 86.0);
    assert!(!jobs.transition(&mut guard, JobState::InProcess, JobState::Waiting).await);
    assert_eq!(guard.state(), JobState::InProcess);
    assert_eq!(guard.version(), 2);
    let record = assert_ok!(store.get("jobs", guard.id()).await).expect("stored");
    assert_eq!(record.generation, 2);
    assert_eq!(record.str("state"), Ok("InProcess"));

    // Nothing went stale: the next write goes through.
    guard.origin = Location::new(10.0, 84.0);
    assert!(jobs.transition(&mut guard, JobState::InProcess, JobState::Waiting).await);
    assert_eq!(guard.version(), 3);
    assert_eq!(jobs.count(JobState::Waiting), 1);
}
