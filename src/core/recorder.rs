use crate::core::control::Control;
use crate::core::error::{ErrorKind, UnitError};
use crate::core::events::{EngineEvent, EventBus};
use crate::core::jobs::{JobBoard, JobOutcome};
use crate::core::model::{ErrorDetail, Resource, ResourceId, ResourceStatus, Segment, TransitionError};
use crate::core::pool::{UnitObserver, UnitOwner};
use crate::core::store::Repository;
use crate::core::sync_lock;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Smallest fraction step worth an event.
const PROGRESS_STEP: f64 = 0.005;
/// Pulse interval, in bytes, when the total is unknown.
const PULSE_BYTES: u64 = 256 * 1024;

struct Tracked {
    resource: Resource,
    last_pulse: u64,
}

/// The only path through which units change resource records. Each write
/// is persisted before it becomes visible in the catalog or on the bus.
pub struct Recorder {
    repo: Arc<dyn Repository>,
    events: EventBus,
    jobs: Arc<JobBoard>,
    catalog: Mutex<HashMap<ResourceId, Tracked>>,
}

impl Recorder {
    pub fn new(repo: Arc<dyn Repository>, events: EventBus, jobs: Arc<JobBoard>) -> Self {
        Self { repo, events, jobs, catalog: Mutex::new(HashMap::new()) }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn jobs(&self) -> &Arc<JobBoard> {
        &self.jobs
    }

    pub fn publish(&self, event: EngineEvent) {
        self.events.publish(event);
    }

    pub fn get(&self, id: &ResourceId) -> Option<Resource> {
        sync_lock(&self.catalog).get(id).map(|t| t.resource.clone())
    }

    pub fn snapshot(&self) -> Vec<Resource> {
        let mut all: Vec<Resource> = sync_lock(&self.catalog).values().map(|t| t.resource.clone()).collect();
        all.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Seeds the catalog from the repository on start-up.
    pub fn load(&self, resources: Vec<Resource>) {
        let mut catalog = sync_lock(&self.catalog);
        for r in resources {
            catalog.insert(r.id.clone(), Tracked { resource: r, last_pulse: 0 });
        }
    }

    /// Persists freshly discovered records. A record that already completed
    /// is kept as is.
    pub async fn commit(&self, found: Vec<Resource>) -> Result<Vec<Resource>, UnitError> {
        let mut out = Vec::with_capacity(found.len());
        for r in found {
            if let Some(existing) = self.get(&r.id) {
                if existing.status == ResourceStatus::Completed {
                    out.push(existing);
                    continue;
                }
            }
            self.repo.upsert(&r).await?;
            sync_lock(&self.catalog).insert(r.id.clone(), Tracked { resource: r.clone(), last_pulse: 0 });
            out.push(r);
        }
        Ok(out)
    }

    /// Applies one state-machine step, persists it, then publishes it.
    pub async fn transition<F>(&self, id: &ResourceId, step: F) -> Result<Resource, UnitError>
    where
        F: FnOnce(&mut Resource) -> Result<(), TransitionError>,
    {
        let mut next = self.get(id).ok_or_else(|| UnitError::Internal(format!("unknown resource {id}")))?;
        step(&mut next)?;
        self.repo.upsert(&next).await?;
        if let Some(t) = sync_lock(&self.catalog).get_mut(id) {
            t.resource = next.clone();
        }
        Ok(next)
    }

    pub async fn queue(&self, id: &ResourceId) -> Result<Resource, UnitError> {
        self.transition(id, Resource::queue).await
    }

    pub async fn begin(&self, id: &ResourceId) -> Result<Resource, UnitError> {
        let r = self.transition(id, Resource::begin).await?;
        if let Some(t) = sync_lock(&self.catalog).get_mut(id) {
            t.last_pulse = 0;
        }
        self.publish(EngineEvent::DownloadStarted { resource_id: id.clone(), attempt: r.attempt });
        Ok(r)
    }

    /// Records a failed attempt and puts the resource back in the queue.
    pub async fn retry(&self, id: &ResourceId, err: &UnitError, delay: Duration) -> Result<Resource, UnitError> {
        let detail = ErrorDetail::from(err);
        let r = self
            .transition(id, |r| {
                r.fail(detail)?;
                r.requeue()
            })
            .await?;
        self.publish(EngineEvent::Retrying {
            resource_id: id.clone(),
            attempt: r.attempt,
            delay,
            reason: err.to_string(),
        });
        Ok(r)
    }

    /// Byte progress. In-memory only; the terminal write persists the final fraction.
    pub fn progress(&self, id: &ResourceId, downloaded: u64, total: Option<u64>) {
        match total.filter(|t| *t > 0) {
            Some(t) => self.report(id, Some((downloaded as f64 / t as f64).min(1.0)), downloaded, Some(t)),
            None => self.report(id, None, downloaded, None),
        }
    }

    /// Progress for work not measured in bytes, such as segments merged.
    pub fn progress_fraction(&self, id: &ResourceId, fraction: f64, downloaded: u64) {
        self.report(id, Some(fraction.clamp(0.0, 1.0)), downloaded, None);
    }

    fn report(&self, id: &ResourceId, fraction: Option<f64>, downloaded: u64, total: Option<u64>) {
        let event = {
            let mut catalog = sync_lock(&self.catalog);
            let Some(t) = catalog.get_mut(id) else { return };
            if t.resource.status != ResourceStatus::InProgress {
                return;
            }
            match fraction {
                Some(fraction) => {
                    let before = t.resource.progress;
                    if !t.resource.set_progress(fraction) {
                        return;
                    }
                    if fraction - before < PROGRESS_STEP && fraction < 1.0 {
                        return;
                    }
                }
                None => {
                    if t.last_pulse != 0 && downloaded < t.last_pulse + PULSE_BYTES {
                        return;
                    }
                    t.last_pulse = downloaded.max(1);
                }
            }
            EngineEvent::Progress { resource_id: id.clone(), fraction, downloaded, total }
        };
        self.publish(event);
    }

    /// A suspension point with bookkeeping: cancel fails, pause parks the
    /// resource in `Paused` until resumed.
    pub async fn suspension_point(&self, id: &ResourceId, control: &Control) -> Result<(), UnitError> {
        if control.is_cancelled() {
            return Err(UnitError::Cancelled);
        }
        if !control.is_paused() {
            return Ok(());
        }
        self.transition(id, Resource::pause).await?;
        self.publish(EngineEvent::Paused { resource_id: id.clone() });
        tracing::debug!(resource = %id, "paused");
        control.wait_resumed().await?;
        self.transition(id, Resource::resume).await?;
        self.publish(EngineEvent::Resumed { resource_id: id.clone() });
        tracing::debug!(resource = %id, "resumed");
        Ok(())
    }

    /// Ends a resource for this batch: Completed, Cancelled or Failed.
    pub async fn finish(&self, id: &ResourceId, result: Result<PathBuf, UnitError>) {
        let Some(current) = self.get(id) else {
            tracing::warn!(resource = %id, "finish for unknown resource");
            return;
        };
        if current.is_terminal() {
            tracing::debug!(resource = %id, status = ?current.status, "already terminal");
            return;
        }

        let (next, event) = match result {
            Ok(path) => {
                let mut next = current.clone();
                match next.complete(path.clone()) {
                    Ok(()) => (next, EngineEvent::Completed { resource_id: id.clone(), path }),
                    Err(e) => {
                        tracing::error!(error = %e, "completion out of order");
                        return;
                    }
                }
            }
            Err(UnitError::Cancelled) => {
                let mut next = current.clone();
                if let Err(e) = next.cancel() {
                    tracing::error!(error = %e, "cancel out of order");
                    return;
                }
                (next, EngineEvent::Cancelled { resource_id: id.clone() })
            }
            Err(err) => {
                let mut next = current.clone();
                // A unit can die before it managed to start its attempt.
                if matches!(next.status, ResourceStatus::Discovered | ResourceStatus::Queued) {
                    let _ = next.queue();
                    let _ = next.begin();
                }
                if let Err(e) = next.fail(ErrorDetail::from(&err)) {
                    tracing::error!(error = %e, "failure out of order");
                    return;
                }
                let event = EngineEvent::Failed { resource_id: id.clone(), kind: err.kind(), reason: err.to_string() };
                (next, event)
            }
        };

        if let Err(e) = self.repo.upsert(&next).await {
            tracing::error!(resource = %id, error = %e, "could not persist final status");
        }
        let status = next.status;
        if let Some(t) = sync_lock(&self.catalog).get_mut(id) {
            t.resource = next;
        }
        match &event {
            EngineEvent::Failed { kind, reason, .. } => {
                tracing::warn!(resource = %id, kind = %kind, %reason, "download failed")
            }
            EngineEvent::Completed { path, .. } => tracing::info!(resource = %id, path = %path.display(), "download completed"),
            _ => tracing::info!(resource = %id, "download cancelled"),
        }
        self.publish(event);

        if let Some((job_id, summary)) = self.jobs.resource_finished(id, status) {
            tracing::info!(
                completed = summary.completed,
                failed = summary.failed,
                cancelled = summary.cancelled,
                total = summary.total,
                "batch finished"
            );
            self.publish(EngineEvent::BatchFinished { job_id, summary });
            self.jobs.finish(job_id, JobOutcome::Batch(summary));
        }
    }

    pub async fn record_segment(&self, playlist: &ResourceId, segment: &Segment) {
        if let Err(e) = self.repo.upsert_segment(playlist, segment).await {
            tracing::warn!(resource = %playlist, segment = segment.sequence_index, error = %e, "segment record not saved");
        }
    }
}

#[async_trait]
impl UnitObserver for Recorder {
    async fn unit_panicked(&self, owner: UnitOwner, detail: String) {
        match owner {
            UnitOwner::Resource(id) => self.finish(&id, Err(UnitError::Panicked(detail))).await,
            UnitOwner::Analysis(job_id) => {
                let reason = UnitError::Panicked(detail).to_string();
                self.publish(EngineEvent::AnalysisFailed { job_id, kind: ErrorKind::Internal, reason: reason.clone() });
                self.jobs.finish(job_id, JobOutcome::AnalysisFailed { reason });
            }
            UnitOwner::Detached => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::jobs::Phase;
    use crate::core::model::{ResourceKind, ResourceRef, SourceLocator};
    use crate::core::store::SqliteStore;

    async fn recorder() -> (Recorder, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let rec = Recorder::new(store.clone(), EventBus::new(64), Arc::new(JobBoard::new()));
        (rec, store)
    }

    fn found(url: &str) -> Resource {
        Resource::discovered(
            ResourceRef { kind: ResourceKind::infer(url), locator: SourceLocator::Url(url.into()), title: None },
            None,
            3,
        )
    }

    #[tokio::test]
    async fn events_follow_persisted_transitions() {
        let (rec, store) = recorder().await;
        let mut rx = rec.events().subscribe();
        let r = rec.commit(vec![found("https://x.test/a.png")]).await.unwrap().remove(0);
        rec.queue(&r.id).await.unwrap();
        rec.begin(&r.id).await.unwrap();
        rec.progress(&r.id, 50, Some(100));
        rec.progress(&r.id, 50, Some(100));
        rec.finish(&r.id, Ok(PathBuf::from("/tmp/a.png"))).await;
        rec.progress(&r.id, 100, Some(100));

        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::DownloadStarted { attempt: 1, .. }));
        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::Progress { fraction: Some(f), .. } if f == 0.5));
        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::Completed { .. }));
        assert!(rx.try_recv().is_err());

        let saved = store.load_resources().await.unwrap();
        assert_eq!(saved[0].status, ResourceStatus::Completed);
        assert!(saved[0].invariants_hold());
    }

    #[tokio::test]
    async fn last_batch_member_closes_the_job() {
        let (rec, _) = recorder().await;
        let job = rec.jobs().begin(Phase::Downloading).unwrap();
        let a = rec.commit(vec![found("https://x.test/a.png")]).await.unwrap().remove(0);
        rec.jobs().open_batch(job, [a.id.clone()]);
        rec.queue(&a.id).await.unwrap();
        rec.finish(&a.id, Err(UnitError::Cancelled)).await;
        assert_eq!(rec.get(&a.id).unwrap().status, ResourceStatus::Cancelled);
        assert_eq!(rec.jobs().phase(), Phase::Idle);
        let outcome = rec.jobs().wait(job).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Batch(s) if s.cancelled == 1 && s.total == 1));
    }

    #[tokio::test]
    async fn panic_before_begin_still_fails_the_resource() {
        let (rec, _) = recorder().await;
        let a = rec.commit(vec![found("https://x.test/a.png")]).await.unwrap().remove(0);
        rec.queue(&a.id).await.unwrap();
        rec.unit_panicked(UnitOwner::Resource(a.id.clone()), "boom".into()).await;
        let r = rec.get(&a.id).unwrap();
        assert_eq!(r.status, ResourceStatus::Failed);
        assert_eq!(r.error.as_ref().unwrap().kind, ErrorKind::Internal);
        assert!(r.invariants_hold());
    }

    #[tokio::test]
    async fn completed_records_survive_rediscovery() {
        let (rec, _) = recorder().await;
        let a = rec.commit(vec![found("https://x.test/a.png")]).await.unwrap().remove(0);
        rec.queue(&a.id).await.unwrap();
        rec.begin(&a.id).await.unwrap();
        rec.finish(&a.id, Ok(PathBuf::from("a.png"))).await;
        let again = rec.commit(vec![found("https://x.test/a.png")]).await.unwrap();
        assert_eq!(again[0].status, ResourceStatus::Completed);
    }
}
