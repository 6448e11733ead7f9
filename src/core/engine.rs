use crate::core::config::EngineConfig;
use crate::core::error::{EngineError, MergeError};
use crate::core::events::{EngineEvent, EventBus};
use crate::core::jobs::{BatchSummary, JobBoard, JobOutcome, Phase};
use crate::core::lifecycle::PoolManager;
use crate::core::model::{JobId, Resource, ResourceId, ResourceStatus, Segment};
use crate::core::planner::{prepare_out_dir, TargetPlanner};
use crate::core::pool::GenerationId;
use crate::core::recorder::Recorder;
use crate::core::store::{Repository, SqliteStore};
use crate::core::units::{AnalysisUnit, DownloadUnit, Services};
use crate::plugins::hls::driver::HlsDriver;
use crate::plugins::hls::merge::{FfmpegMerger, MergeTool};
use crate::plugins::html::resolver::normalize_url;
use crate::plugins::http::driver::HttpDriver;
use crate::plugins::inline::driver::InlineDriver;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Front door of the orchestrator. Commands return immediately; the work
/// runs on the pool and reports through the event bus.
#[derive(Clone)]
pub struct Engine {
    services: Arc<Services>,
    recorder: Arc<Recorder>,
    jobs: Arc<JobBoard>,
    pool: Arc<PoolManager>,
    repo: Arc<dyn Repository>,
    events: EventBus,
}

impl Engine {
    pub async fn new(
        config: EngineConfig,
        repo: Arc<dyn Repository>,
        merger: Arc<dyn MergeTool>,
    ) -> Result<Self, EngineError> {
        let events = EventBus::new(config.event_capacity);
        let jobs = Arc::new(JobBoard::new());
        let recorder = Arc::new(Recorder::new(repo.clone(), events.clone(), jobs.clone()));

        // Records a previous process left mid-flight become downloadable again.
        let mut loaded = repo.load_resources().await?;
        let mut recovered = 0usize;
        for r in loaded.iter_mut() {
            if r.recover_interrupted() {
                repo.upsert(r).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, "recovered interrupted resources");
        }
        tracing::debug!(records = loaded.len(), "catalog loaded");
        recorder.load(loaded);

        let http = Arc::new(HttpDriver::new(config.driver.clone()).map_err(|e| EngineError::Client(e.to_string()))?);
        let hls = Arc::new(HlsDriver::new(http.clone(), merger, config.hls.clone(), config.retry.clone()));
        let services = Arc::new(Services {
            recorder: recorder.clone(),
            http,
            hls,
            inline: InlineDriver::new(),
            policy: config.retry.clone(),
            crawl: config.crawl.clone(),
        });

        let pool = PoolManager::new(config.pool.clone(), recorder.clone());
        pool.spawn_reaper();

        Ok(Self { services, recorder, jobs, pool, repo, events })
    }

    /// Engine backed by a SQLite file and the ffmpeg merger.
    pub async fn open(db_path: &Path, config: EngineConfig) -> Result<Self, EngineError> {
        let store = Arc::new(SqliteStore::open(db_path).await?);
        let merger = Arc::new(FfmpegMerger::new(config.hls.ffmpeg_bin.clone()));
        Self::new(config, store, merger).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> Phase {
        self.jobs.phase()
    }

    pub fn is_paused(&self) -> bool {
        self.pool.is_paused()
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.recorder.snapshot()
    }

    pub fn resource(&self, id: &ResourceId) -> Option<Resource> {
        self.recorder.get(id)
    }

    pub async fn segments(&self, playlist: &ResourceId) -> Result<Vec<Segment>, EngineError> {
        Ok(self.repo.load_segments(playlist).await?)
    }

    /// Whether playlists can be merged at all on this machine.
    pub fn merge_preflight(&self) -> Result<PathBuf, MergeError> {
        self.services.hls.merger().preflight()
    }

    pub async fn analyze(&self, input: &str) -> Result<JobId, EngineError> {
        let url = normalize_url(input).ok_or_else(|| EngineError::InvalidUrl(input.to_string()))?;
        let job_id = self.jobs.begin(Phase::Analyzing)?;
        tracing::info!(%job_id, %url, "analysis queued");
        self.pool.submit(Box::new(AnalysisUnit { services: self.services.clone(), job_id, url }));
        Ok(job_id)
    }

    /// Queues one unit per resource. Only freshly discovered resources are
    /// taken; anything else is skipped with a warning.
    pub async fn download(&self, ids: &[ResourceId], out_dir: &Path) -> Result<JobId, EngineError> {
        let mut picked = Vec::with_capacity(ids.len());
        let mut seen = HashSet::new();
        for id in ids {
            let r = self.recorder.get(id).ok_or_else(|| EngineError::UnknownResource(id.clone()))?;
            if !seen.insert(id.clone()) {
                continue;
            }
            if r.status != ResourceStatus::Discovered {
                tracing::warn!(resource = %id, status = %r.status.as_str(), "not downloadable in this state, skipped");
                continue;
            }
            picked.push(r);
        }
        prepare_out_dir(out_dir).await?;

        let job_id = self.jobs.begin(Phase::Downloading)?;
        let mut planner = TargetPlanner::new(out_dir);
        let mut units = Vec::with_capacity(picked.len());
        for r in picked {
            if let Err(e) = self.recorder.queue(&r.id).await {
                tracing::warn!(resource = %r.id, error = %e, "could not queue");
                continue;
            }
            let target = planner.plan(&r);
            tracing::debug!(resource = %r.id, target = %target.display(), "planned");
            units.push(DownloadUnit {
                services: self.services.clone(),
                resource_id: r.id,
                target,
                out_dir: out_dir.to_path_buf(),
            });
        }

        tracing::info!(%job_id, resources = units.len(), out_dir = %out_dir.display(), "download batch started");
        if units.is_empty() {
            let summary = BatchSummary::default();
            self.events.publish(EngineEvent::BatchFinished { job_id, summary });
            self.jobs.finish(job_id, JobOutcome::Batch(summary));
            return Ok(job_id);
        }
        self.jobs.open_batch(job_id, units.iter().map(|u| u.resource_id.clone()));
        for unit in units {
            self.pool.submit(Box::new(unit));
        }
        Ok(job_id)
    }

    pub fn pause(&self) -> Result<(), EngineError> {
        if self.jobs.phase() == Phase::Idle {
            return Err(EngineError::Idle);
        }
        tracing::info!("pausing");
        self.pool.set_paused(true);
        Ok(())
    }

    pub fn resume(&self) {
        tracing::info!("resuming");
        self.pool.set_paused(false);
    }

    /// Cancels the running job and installs a clean generation. The pause
    /// flag is cleared so the next job starts running.
    pub fn cancel(&self) -> GenerationId {
        let fresh = self.pool.cancel_active();
        self.pool.set_paused(false);
        tracing::info!(generation = fresh.id(), "cancelled");
        self.events.publish(EngineEvent::PoolRestarted { generation: fresh.id() });
        fresh.id()
    }

    pub fn restart_pool(&self) -> GenerationId {
        let fresh = self.pool.restart();
        self.events.publish(EngineEvent::PoolRestarted { generation: fresh.id() });
        fresh.id()
    }

    pub async fn wait(&self, job_id: JobId) -> Option<JobOutcome> {
        self.jobs.wait(job_id).await
    }
}
