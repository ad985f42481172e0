//! Job queue and matchmaking
//!
//! The batch queue is an external collaborator; glideins only need to submit,
//! query history, remove, and claim work matching their advertised facts.
//! `LocalQueue` is the in-process implementation used when the controller
//! runs self-contained.
//!
//! A claim belongs to the worker that made it. Claims held by workers that
//! no longer have a live record are released back to idle, and a completion
//! from a worker that no longer holds the claim is ignored.

use crate::error::{GlideinError, Result};
use crate::models::{ClusterId, JobId, JobSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Removed,
}

impl JobStatus {
    /// Finished jobs appear in history
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Removed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Remove,
}

/// Which jobs an action or history query applies to; the default matches all
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub cluster: Option<ClusterId>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn cluster(cluster: ClusterId) -> Self {
        Self {
            cluster: Some(cluster),
        }
    }

    fn matches(&self, id: &JobId) -> bool {
        self.cluster.map_or(true, |c| c == id.cluster)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    pub completed_at: i64,
}

/// Queued work versus running work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDemand {
    pub idle: u32,
    pub running: u32,
}

/// What a glidein slot offers to the matchmaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineOffer {
    pub worker_id: String,
    pub memory_mb: u64,
    pub resources: BTreeMap<String, bool>,
}

impl MachineOffer {
    pub fn satisfies(&self, spec: &JobSpec) -> bool {
        spec.request_memory <= self.memory_mb
            && spec
                .requirements
                .iter()
                .all(|name| self.resources.get(name).copied().unwrap_or(false))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub id: JobId,
    pub spec: JobSpec,
    /// Worker holding the claim
    pub worker: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            error: Some(error.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.error.is_none()
    }
}

/// Queue and matchmaking contract
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue `count` instances of `spec` in one new cluster
    async fn submit(&self, spec: JobSpec, count: u32) -> Result<ClusterId>;

    /// Finished jobs matching `filter`, most recent first, at most `limit`
    async fn query_history(&self, filter: &JobFilter, limit: usize) -> Result<Vec<HistoryEntry>>;

    /// Apply `action` to every unfinished job matching `filter`
    async fn act(&self, action: JobAction, filter: &JobFilter) -> Result<usize>;

    async fn demand(&self) -> Result<QueueDemand>;

    /// Atomically match the oldest idle job `offer` satisfies
    async fn claim(&self, offer: &MachineOffer) -> Result<Option<ClaimedJob>>;

    /// Record the outcome of a claim; ignored unless `job.worker` still holds it
    async fn complete(&self, job: &ClaimedJob, outcome: JobOutcome) -> Result<()>;

    /// Return to idle every job claimed before `claimed_before` by a worker
    /// not in `live_workers`. Returns how many were released.
    async fn release_orphans(
        &self,
        live_workers: &BTreeSet<String>,
        claimed_before: Instant,
    ) -> Result<usize>;
}

#[derive(Debug, Clone)]
struct QueuedJob {
    spec: JobSpec,
    status: JobStatus,
    worker: Option<String>,
    claimed_at: Option<Instant>,
    exit_code: Option<i32>,
    completed_at: Option<i64>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_cluster: u64,
    jobs: BTreeMap<JobId, QueuedJob>,
    /// Idle jobs in submission order
    idle: VecDeque<JobId>,
    history: VecDeque<JobId>,
}

/// In-process queue with first-come matchmaking
#[derive(Debug)]
pub struct LocalQueue {
    state: Mutex<QueueState>,
    history_limit: usize,
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl LocalQueue {
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_cluster: 1,
                ..Default::default()
            }),
            history_limit: history_limit.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finish(&self, state: &mut QueueState, id: JobId) {
        state.history.push_front(id);
        while state.history.len() > self.history_limit {
            if let Some(old) = state.history.pop_back() {
                state.jobs.remove(&old);
            }
        }
    }
}

#[async_trait]
impl JobQueue for LocalQueue {
    async fn submit(&self, spec: JobSpec, count: u32) -> Result<ClusterId> {
        if spec.executable.trim().is_empty() {
            return Err(GlideinError::Queue("executable must not be empty".to_string()));
        }
        if count == 0 {
            return Err(GlideinError::Queue("count must be at least 1".to_string()));
        }

        let mut state = self.lock();
        let cluster = ClusterId(state.next_cluster);
        state.next_cluster += 1;
        for proc in 0..count {
            let id = JobId { cluster, proc };
            state.jobs.insert(
                id,
                QueuedJob {
                    spec: spec.clone(),
                    status: JobStatus::Idle,
                    worker: None,
                    claimed_at: None,
                    exit_code: None,
                    completed_at: None,
                },
            );
            state.idle.push_back(id);
        }
        info!(cluster = %cluster, count, executable = %spec.executable, "Jobs submitted");
        Ok(cluster)
    }

    async fn query_history(&self, filter: &JobFilter, limit: usize) -> Result<Vec<HistoryEntry>> {
        let state = self.lock();
        Ok(state
            .history
            .iter()
            .filter(|id| filter.matches(id))
            .filter_map(|id| {
                state.jobs.get(id).map(|job| HistoryEntry {
                    id: *id,
                    status: job.status,
                    exit_code: job.exit_code,
                    worker: job.worker.clone(),
                    completed_at: job.completed_at.unwrap_or_default(),
                })
            })
            .take(limit)
            .collect())
    }

    async fn act(&self, action: JobAction, filter: &JobFilter) -> Result<usize> {
        let JobAction::Remove = action;
        let mut state = self.lock();
        let now = chrono::Utc::now().timestamp();

        let targets: Vec<JobId> = state
            .jobs
            .iter()
            .filter(|(id, job)| filter.matches(id) && !job.status.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in &targets {
            if let Some(job) = state.jobs.get_mut(id) {
                // running jobs are not killed; their completion is ignored
                job.status = JobStatus::Removed;
                job.completed_at = Some(now);
            }
            self.finish(&mut state, *id);
        }
        state.idle.retain(|id| !targets.contains(id));
        info!(removed = targets.len(), "Jobs removed");
        Ok(targets.len())
    }

    async fn demand(&self) -> Result<QueueDemand> {
        let state = self.lock();
        let running = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .count();
        Ok(QueueDemand {
            idle: state.idle.len() as u32,
            running: running as u32,
        })
    }

    async fn claim(&self, offer: &MachineOffer) -> Result<Option<ClaimedJob>> {
        let mut state = self.lock();
        let position = state.idle.iter().position(|id| {
            state
                .jobs
                .get(id)
                .map_or(false, |job| offer.satisfies(&job.spec))
        });
        let Some(position) = position else {
            return Ok(None);
        };
        let Some(id) = state.idle.remove(position) else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.status = JobStatus::Running;
        job.worker = Some(offer.worker_id.clone());
        job.claimed_at = Some(Instant::now());
        debug!(job = %id, worker = %offer.worker_id, "Job matched");
        Ok(Some(ClaimedJob {
            id,
            spec: job.spec.clone(),
            worker: offer.worker_id.clone(),
        }))
    }

    async fn complete(&self, claimed: &ClaimedJob, outcome: JobOutcome) -> Result<()> {
        let id = claimed.id;
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| GlideinError::Queue(format!("unknown job {id}")))?;
        if job.status != JobStatus::Running {
            debug!(job = %id, status = ?job.status, "Ignoring completion of non-running job");
            return Ok(());
        }
        if job.worker.as_deref() != Some(claimed.worker.as_str()) {
            debug!(job = %id, worker = %claimed.worker, "Ignoring completion from a released claim");
            return Ok(());
        }
        job.status = if outcome.succeeded() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        job.exit_code = outcome.exit_code;
        job.completed_at = Some(chrono::Utc::now().timestamp());
        self.finish(&mut state, id);
        Ok(())
    }

    async fn release_orphans(
        &self,
        live_workers: &BTreeSet<String>,
        claimed_before: Instant,
    ) -> Result<usize> {
        let mut state = self.lock();
        let orphans: Vec<JobId> = state
            .jobs
            .iter()
            .filter(|(_, job)| {
                job.status == JobStatus::Running
                    && job.claimed_at.map_or(false, |at| at <= claimed_before)
                    && job.worker.as_ref().map_or(true, |w| !live_workers.contains(w))
            })
            .map(|(id, _)| *id)
            .collect();

        for id in orphans.iter().rev() {
            if let Some(job) = state.jobs.get_mut(id) {
                warn!(job = %id, worker = ?job.worker, "Releasing job held by a vanished worker");
                job.status = JobStatus::Idle;
                job.worker = None;
                job.claimed_at = None;
            }
            // released jobs go ahead of newer submissions
            state.idle.push_front(*id);
        }
        Ok(orphans.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(worker: &str, memory: u64) -> MachineOffer {
        MachineOffer {
            worker_id: worker.to_string(),
            memory_mb: memory,
            resources: BTreeMap::from([("GPU".to_string(), false), ("CVMFS".to_string(), true)]),
        }
    }

    #[tokio::test]
    async fn test_submit_allocates_clusters() {
        let queue = LocalQueue::default();
        let first = queue
            .submit(JobSpec::new("/bin/sleep", "5m").with_memory(500), 8)
            .await
            .unwrap();
        let second = queue.submit(JobSpec::new("/bin/echo", "hi"), 1).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(queue.demand().await.unwrap().idle, 9);
    }

    #[tokio::test]
    async fn test_submit_rejects_empty() {
        let queue = LocalQueue::default();
        assert!(queue.submit(JobSpec::new("", ""), 1).await.is_err());
        assert!(queue.submit(JobSpec::new("/bin/true", ""), 0).await.is_err());
    }

    #[tokio::test]
    async fn test_claim_respects_memory_and_requirements() {
        let queue = LocalQueue::default();
        queue
            .submit(JobSpec::new("/bin/sleep", "1").with_memory(500).with_requirement("GPU"), 1)
            .await
            .unwrap();
        queue
            .submit(JobSpec::new("/bin/sleep", "1").with_memory(4000), 1)
            .await
            .unwrap();
        let fits = queue
            .submit(JobSpec::new("/bin/sleep", "1").with_memory(500).with_requirement("CVMFS"), 1)
            .await
            .unwrap();

        let claimed = queue.claim(&offer("w1", 1000)).await.unwrap().unwrap();
        assert_eq!(claimed.id.cluster, fits);
        assert!(queue.claim(&offer("w1", 1000)).await.unwrap().is_none());
        assert_eq!(queue.demand().await.unwrap(), QueueDemand { idle: 2, running: 1 });
    }

    #[tokio::test]
    async fn test_history_by_cluster_after_completion() {
        let queue = LocalQueue::default();
        let cluster = queue.submit(JobSpec::new("/bin/echo", "hello"), 1).await.unwrap();
        let filter = JobFilter::cluster(cluster);
        assert!(queue.query_history(&filter, 1).await.unwrap().is_empty());

        let job = queue.claim(&offer("w1", 1000)).await.unwrap().unwrap();
        queue.complete(&job, JobOutcome::exited(0)).await.unwrap();

        let history = queue.query_history(&filter, 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, JobStatus::Completed);
        assert_eq!(history[0].worker.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_remove_all_clears_idle_and_ignores_late_completion() {
        let queue = LocalQueue::default();
        queue.submit(JobSpec::new("/bin/sleep", "5m"), 3).await.unwrap();
        let running = queue.claim(&offer("w1", 1000)).await.unwrap().unwrap();

        let removed = queue.act(JobAction::Remove, &JobFilter::all()).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(queue.demand().await.unwrap(), QueueDemand::default());

        queue.complete(&running, JobOutcome::exited(0)).await.unwrap();
        let history = queue.query_history(&JobFilter::all(), 10).await.unwrap();
        assert!(history.iter().all(|h| h.status == JobStatus::Removed));
    }

    #[tokio::test]
    async fn test_claims_of_vanished_workers_are_released() {
        let queue = LocalQueue::default();
        let cluster = queue.submit(JobSpec::new("/bin/sleep", "5m"), 2).await.unwrap();
        let lost = queue.claim(&offer("crashed", 1000)).await.unwrap().unwrap();
        let kept = queue.claim(&offer("alive", 1000)).await.unwrap().unwrap();
        let live = BTreeSet::from(["alive".to_string()]);

        let released = queue.release_orphans(&live, Instant::now()).await.unwrap();

        assert_eq!(released, 1);
        assert_eq!(queue.demand().await.unwrap(), QueueDemand { idle: 1, running: 1 });
        let retry = queue.claim(&offer("w2", 1000)).await.unwrap().unwrap();
        assert_eq!(retry.id, lost.id);

        // the crashed worker's late report does not finish the retried job
        queue.complete(&lost, JobOutcome::exited(1)).await.unwrap();
        assert!(queue
            .query_history(&JobFilter::cluster(cluster), 10)
            .await
            .unwrap()
            .is_empty());

        queue.complete(&retry, JobOutcome::exited(0)).await.unwrap();
        queue.complete(&kept, JobOutcome::exited(0)).await.unwrap();
        let history = queue.query_history(&JobFilter::cluster(cluster), 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|h| h.status == JobStatus::Completed));
        assert!(history.iter().any(|h| h.worker.as_deref() == Some("w2")));
    }

    #[tokio::test]
    async fn test_claims_made_after_the_snapshot_are_kept() {
        let queue = LocalQueue::default();
        queue.submit(JobSpec::new("/bin/sleep", "5m"), 1).await.unwrap();
        let snapshot = Instant::now();
        queue.claim(&offer("new-worker", 1000)).await.unwrap().unwrap();

        let released = queue.release_orphans(&BTreeSet::new(), snapshot).await.unwrap();

        assert_eq!(released, 0);
        assert_eq!(queue.demand().await.unwrap().running, 1);
    }
}
