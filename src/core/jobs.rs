use crate::core::error::EngineError;
use crate::core::model::{JobId, ResourceId, ResourceStatus};
use crate::core::sync_lock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Analyzing,
    Downloading,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    pub fn is_done(&self) -> bool {
        self.finished() >= self.total
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Ids of every resource the analysis recorded, in discovery order.
    Analyzed { found: Vec<ResourceId> },
    AnalysisFailed { reason: String },
    Batch(BatchSummary),
}

struct Batch {
    job_id: JobId,
    outstanding: HashSet<ResourceId>,
    summary: BatchSummary,
}

/// Finished jobs whose outcome can still be waited on.
const KEEP_FINISHED: usize = 16;

/// Tracks the one job the engine runs at a time.
pub struct JobBoard {
    phase: watch::Sender<Phase>,
    current: Mutex<Option<JobId>>,
    batch: Mutex<Option<Batch>>,
    outcomes: Mutex<HashMap<JobId, watch::Sender<Option<JobOutcome>>>>,
    finished: Mutex<VecDeque<JobId>>,
}

impl Default for JobBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl JobBoard {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            phase,
            current: Mutex::new(None),
            batch: Mutex::new(None),
            outcomes: Mutex::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn current_job(&self) -> Option<JobId> {
        *sync_lock(&self.current)
    }

    /// Claims the engine for a new job, or reports what it is busy with.
    pub fn begin(&self, phase: Phase) -> Result<JobId, EngineError> {
        let mut busy = None;
        self.phase.send_if_modified(|p| {
            if *p != Phase::Idle {
                busy = Some(*p);
                return false;
            }
            *p = phase;
            true
        });
        if let Some(p) = busy {
            return Err(EngineError::Busy(p));
        }
        let job_id = Uuid::new_v4();
        *sync_lock(&self.current) = Some(job_id);
        let (tx, _) = watch::channel(None);
        sync_lock(&self.outcomes).insert(job_id, tx);
        Ok(job_id)
    }

    pub fn open_batch(&self, job_id: JobId, members: impl IntoIterator<Item = ResourceId>) {
        let outstanding: HashSet<ResourceId> = members.into_iter().collect();
        let summary = BatchSummary { total: outstanding.len(), ..BatchSummary::default() };
        *sync_lock(&self.batch) = Some(Batch { job_id, outstanding, summary });
    }

    pub fn batch_summary(&self) -> Option<BatchSummary> {
        sync_lock(&self.batch).as_ref().map(|b| b.summary)
    }

    /// Counts a resource that reached its final status. Returns the job and
    /// summary once the last member of the open batch is in.
    pub fn resource_finished(&self, id: &ResourceId, status: ResourceStatus) -> Option<(JobId, BatchSummary)> {
        let mut guard = sync_lock(&self.batch);
        let batch = guard.as_mut()?;
        if !batch.outstanding.remove(id) {
            return None;
        }
        match status {
            ResourceStatus::Completed => batch.summary.completed += 1,
            ResourceStatus::Cancelled => batch.summary.cancelled += 1,
            _ => batch.summary.failed += 1,
        }
        if batch.outstanding.is_empty() {
            let done = guard.take()?;
            return Some((done.job_id, done.summary));
        }
        None
    }

    /// Publishes the outcome and forgets the oldest finished jobs. Waiters
    /// already subscribed still see their outcome.
    pub fn finish(&self, job_id: JobId, outcome: JobOutcome) {
        {
            let mut outcomes = sync_lock(&self.outcomes);
            if let Some(tx) = outcomes.get(&job_id) {
                let first = tx.borrow().is_none();
                tx.send_replace(Some(outcome));
                if first {
                    let mut finished = sync_lock(&self.finished);
                    finished.push_back(job_id);
                    while finished.len() > KEEP_FINISHED {
                        if let Some(old) = finished.pop_front() {
                            outcomes.remove(&old);
                        }
                    }
                }
            }
        }
        let mut current = sync_lock(&self.current);
        if *current == Some(job_id) {
            *current = None;
            self.phase.send_replace(Phase::Idle);
        }
    }

    /// Resolves once the job has an outcome; `None` for an unknown job.
    pub async fn wait(&self, job_id: JobId) -> Option<JobOutcome> {
        let mut rx = sync_lock(&self.outcomes).get(&job_id)?.subscribe();
        let outcome = rx.wait_for(|o| o.is_some()).await.ok()?.clone();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn second_job_is_rejected_while_busy() {
        let board = JobBoard::new();
        let job = board.begin(Phase::Analyzing).unwrap();
        assert!(matches!(board.begin(Phase::Downloading), Err(EngineError::Busy(Phase::Analyzing))));
        board.finish(job, JobOutcome::Analyzed { found: Vec::new() });
        assert_eq!(board.phase(), Phase::Idle);
        assert!(board.begin(Phase::Downloading).is_ok());
    }

    #[test]
    fn batch_closes_on_last_member() {
        let board = JobBoard::new();
        let job = board.begin(Phase::Downloading).unwrap();
        let (a, b, c) = (ResourceId::from_raw("a"), ResourceId::from_raw("b"), ResourceId::from_raw("c"));
        board.open_batch(job, [a.clone(), b.clone(), c.clone()]);

        assert!(board.resource_finished(&a, ResourceStatus::Completed).is_none());
        assert!(board.resource_finished(&a, ResourceStatus::Completed).is_none());
        assert!(board.resource_finished(&b, ResourceStatus::Failed).is_none());
        let (done_job, summary) = board.resource_finished(&c, ResourceStatus::Cancelled).unwrap();
        assert_eq!(done_job, job);
        assert_eq!(summary, BatchSummary { total: 3, completed: 1, failed: 1, cancelled: 1 });
        assert!(summary.is_done());
    }

    #[tokio::test]
    async fn only_recent_outcomes_are_kept() {
        let board = JobBoard::new();
        let mut jobs = Vec::new();
        for n in 0..KEEP_FINISHED + 4 {
            let job = board.begin(Phase::Analyzing).unwrap();
            board.finish(job, JobOutcome::Analyzed { found: vec![ResourceId::from_raw(format!("r{n}"))] });
            jobs.push(job);
        }
        assert_eq!(sync_lock(&board.outcomes).len(), KEEP_FINISHED);
        assert_eq!(board.wait(jobs[0]).await, None);
        let last = *jobs.last().unwrap();
        let expected = vec![ResourceId::from_raw(format!("r{}", KEEP_FINISHED + 3))];
        assert_eq!(board.wait(last).await, Some(JobOutcome::Analyzed { found: expected }));
    }

    #[tokio::test]
    async fn wait_resolves_with_outcome() {
        let board = Arc::new(JobBoard::new());
        let job = board.begin(Phase::Analyzing).unwrap();
        let b2 = board.clone();
        let waiter = tokio::spawn(async move { b2.wait(job).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let ids = vec![ResourceId::from_raw("a"), ResourceId::from_raw("b")];
        board.finish(job, JobOutcome::Analyzed { found: ids.clone() });
        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(outcome, Some(JobOutcome::Analyzed { found: ids }));
        assert_eq!(board.wait(Uuid::new_v4()).await, None);
    }
}
