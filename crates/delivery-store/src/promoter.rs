//! # Hold Promoter
//!
//! Moves held entities (jobs `OnHold`) back to their released state
//! (`Waiting`) through the ordinary transition protocol.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::entity::{Entity, EntityState};
use crate::repository::{EntityRef, Repository};

impl<E: Entity> Repository<E> {
    /// One sweep over the held index, returning how many were released.
    ///
    /// Entities whose transition fails stay in the index for the next sweep;
    /// entities no longer in the held state are dropped from it. Safe to run
    /// concurrently with other transitions and with itself.
    pub async fn promote_held(&self) -> usize {
        let Some((held, released)) = E::State::hold() else {
            return 0;
        };
        // Never hold a map reference across an await.
        let handles: Vec<EntityRef<E>> = self.held.iter().map(|entry| entry.value().clone()).collect();

        let mut promoted = 0;
        for handle in handles {
            let mut guard = handle.lock().await;
            // Released elsewhere: drop the entry without counting it.
            if guard.state() != held {
                self.held.remove_if(&handle.id(), |_, tracked| tracked.same_as(&handle));
                continue;
            }
            if self.transition(&mut guard, held, released).await {
                self.held.remove_if(&handle.id(), |_, tracked| tracked.same_as(&handle));
                promoted += 1;
            }
        }
        if promoted > 0 {
            tracing::debug!(collection = E::COLLECTION, promoted, remaining = self.held.len(), "Released held entities");
        }
        promoted
    }
}

/// Background task running [`Repository::promote_held`] on a fixed period.
pub struct HoldPromoter {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<u64>,
}

impl HoldPromoter {
    pub fn spawn<E: Entity>(repository: Arc<Repository<E>>, period: Duration) -> Self {
        let (shutdown, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut total = 0u64;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        total += repository.promote_held().await as u64;
                    }
                    _ = stopped.changed() => break,
                }
            }
            total
        });
        Self { shutdown, task }
    }

    /// Stop after the current sweep; returns how many entities were
    /// released over the promoter's lifetime.
    pub async fn stop(self) -> u64 {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(total) => total,
            Err(e) => {
                tracing::error!(error = %e, "Hold promoter task failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use delivery_domain::{Job, JobState};

    async fn held_job(repo: &Repository<Job>) -> EntityRef<Job> {
        let job = repo.new_entity(JobState::Waiting).await;
        let mut guard = job.lock().await;
        assert!(repo.transition(&mut guard, JobState::Waiting, JobState::InProcess).await);
        assert!(repo.transition(&mut guard, JobState::InProcess, JobState::OnHold).await);
        drop(guard);
        job
    }

    #[tokio::test]
    async fn test_failed_promotion_stays_held() {
        let store = Arc::new(MemoryStore::new());
        let repo: Repository<Job> = Repository::new(store.clone(), Arc::default());
        let job = held_job(&repo).await;

        store.set_connected(false);
        assert_eq!(repo.promote_held().await, 0);
        assert_eq!(repo.held_len(), 1);

        store.set_connected(true);
        assert_eq!(repo.promote_held().await, 1);
        assert_eq!(repo.held_len(), 0);
        assert_eq!(job.snapshot().await.state(), JobState::Waiting);
        assert_eq!(repo.count(JobState::OnHold), 0);
        assert_eq!(repo.count(JobState::Waiting), 1);
    }

    #[tokio::test]
    async fn test_released_elsewhere_is_not_counted() {
        let repo: Repository<Job> = Repository::new(Arc::new(MemoryStore::new()), Arc::default());
        let job = held_job(&repo).await;
        held_job(&repo).await;

        let mut guard = job.lock().await;
        assert!(repo.transition(&mut guard, JobState::OnHold, JobState::Waiting).await);
        drop(guard);

        assert_eq!(repo.promote_held().await, 1);
        assert_eq!(repo.held_len(), 0);
        assert_eq!(repo.count(JobState::Waiting), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_promoter_releases() {
        let repo: Arc<Repository<Job>> = Arc::new(Repository::new(Arc::new(MemoryStore::new()), Arc::default()));
        held_job(&repo).await;
        held_job(&repo).await;

        let promoter = HoldPromoter::spawn(Arc::clone(&repo), Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(promoter.stop().await, 2);
        assert_eq!(repo.count(JobState::Waiting), 2);
    }
}
