//! Store self-check: a short write/read/scan round against the configured
//! backend, for verifying a deployment by eye.

use anyhow::{Result, ensure};
use delivery_domain::{Job, JobState, Location};
use delivery_store::Database;

/// Clear the store, create three jobs, read them back by id and scan them.
/// Returns the jobs the scan saw, ordered by id.
pub async fn self_check(db: &Database) -> Result<Vec<Job>> {
    ensure!(db.is_connected(), "store is not connected");
    db.clear().await?;

    let mut ids = Vec::with_capacity(3);
    for i in 1..=3 {
        let offset = 0.01 * f64::from(i);
        let job = db
            .jobs()
            .new_entity_with(JobState::Waiting, move |job: &mut Job| {
                *job = Job::at(job.id(), Location::new(offset, offset), Location::new(-offset, offset));
            })
            .await;
        ids.push(job.id());
    }

    for id in &ids {
        match db.jobs().get_by_id(*id).await? {
            Some(job) => {
                let job = job.snapshot().await;
                tracing::info!(id, version = job.version(), "get: {}", *job);
            }
            None => tracing::warn!(id, "get: not found"),
        }
    }

    let mut scanned: Vec<Job> = db
        .jobs()
        .snapshot_stream()
        .collect_all()
        .await
        .into_iter()
        .map(delivery_store::Versioned::into_inner)
        .collect();
    scanned.sort_by_key(Job::id);
    for job in &scanned {
        tracing::info!("scan: {job}");
    }

    ensure!(
        scanned.len() == ids.len(),
        "scan returned {} jobs, expected {}",
        scanned.len(),
        ids.len()
    );
    Ok(scanned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use delivery_store::StoreConfig;

    #[tokio::test]
    async fn test_self_check_round_trip() {
        let db = Database::in_memory(&StoreConfig::default()).await;
        db.jobs().new_entity(JobState::Waiting).await;

        let jobs = tokio_test::assert_ok!(self_check(&db).await);
        let ids: Vec<i64> = jobs.iter().map(Job::id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert!(jobs.iter().all(|job| job.state() == JobState::Waiting));
        assert_eq!(jobs[0].origin, Location::new(0.01, 0.01));
    }
}
