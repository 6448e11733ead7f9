//! The two kinds of work the engine schedules on the pool.

use crate::core::assembler::Assembler;
use crate::core::control::Control;
use crate::core::error::UnitError;
use crate::core::events::EngineEvent;
use crate::core::jobs::JobOutcome;
use crate::core::model::{JobId, Resource, ResourceId, ResourceKind, ResourceRef, SourceLocator};
use crate::core::pool::{Unit, UnitContext, UnitOwner};
use crate::core::recorder::Recorder;
use crate::core::retry::{run_with_retry, IsRetryable, RetryPolicy};
use crate::plugins::hls::driver::{HlsDriver, HlsRequest};
use crate::plugins::html::resolver::{discover_links, discover_resources};
use crate::plugins::html::CrawlSettings;
use crate::plugins::http::driver::{HttpDriver, Page};
use crate::plugins::inline::driver::InlineDriver;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

/// Shared collaborators every unit borrows.
pub struct Services {
    pub recorder: Arc<Recorder>,
    pub http: Arc<HttpDriver>,
    pub hls: Arc<HlsDriver>,
    pub inline: InlineDriver,
    pub policy: RetryPolicy,
    pub crawl: CrawlSettings,
}

/// Downloads one resource, retrying transient failures up to its attempt
/// budget. Always ends with exactly one `Recorder::finish`.
pub struct DownloadUnit {
    pub services: Arc<Services>,
    pub resource_id: ResourceId,
    pub target: PathBuf,
    pub out_dir: PathBuf,
}

impl DownloadUnit {
    async fn attempts(&self, ctx: &UnitContext) -> Result<PathBuf, UnitError> {
        let rec = &self.services.recorder;
        loop {
            let resource = rec.begin(&self.resource_id).await?;
            match self.attempt_once(&resource, ctx).await {
                Ok(path) => return Ok(path),
                Err(e) if e.is_retryable() && resource.can_retry() => {
                    let delay = self.services.policy.delay_for(resource.attempt);
                    tracing::warn!(
                        resource = %self.resource_id,
                        attempt = resource.attempt,
                        max_attempts = resource.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    rec.retry(&self.resource_id, &e, delay).await?;
                    ctx.control().sleep(delay).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt_once(&self, resource: &Resource, ctx: &UnitContext) -> Result<PathBuf, UnitError> {
        let rec = &self.services.recorder;
        let control = ctx.control();
        match (&resource.locator, resource.kind) {
            (SourceLocator::Url(_), ResourceKind::M3u8Playlist) => {
                self.services
                    .hls
                    .download(HlsRequest {
                        resource,
                        target: &self.target,
                        out_dir: &self.out_dir,
                        recorder: rec,
                        generation: &ctx.generation,
                    })
                    .await
            }
            (SourceLocator::Inline(payload), _) => {
                rec.suspension_point(&resource.id, control).await?;
                let mut out = Assembler::create(&self.target).await?;
                let written = self.services.inline.decode_to(payload, &mut out).await?;
                rec.progress(&resource.id, written, Some(written));
                Ok(out.commit().await?)
            }
            (SourceLocator::Url(url), _) => {
                rec.suspension_point(&resource.id, control).await?;
                let mut out = Assembler::create(&self.target).await?;
                let fetched = self
                    .services
                    .http
                    .download_to(url, resource.referer.as_deref(), &mut out, control, |done, total| {
                        rec.progress(&resource.id, done, total)
                    })
                    .await;
                match fetched {
                    Ok(_) => Ok(out.commit().await?),
                    Err(e) => {
                        out.discard().await;
                        Err(e)
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Unit for DownloadUnit {
    fn describe(&self) -> String {
        format!("download {}", self.resource_id)
    }

    fn owner(&self) -> UnitOwner {
        UnitOwner::Resource(self.resource_id.clone())
    }

    async fn run(self: Box<Self>, ctx: UnitContext) {
        let result = self.attempts(&ctx).await;
        self.services.recorder.finish(&self.resource_id, result).await;
    }

    async fn abandon(self: Box<Self>) {
        self.services.recorder.finish(&self.resource_id, Err(UnitError::Cancelled)).await;
    }
}

/// Fetches a page, follows its same-site links up to the crawl depth and
/// records everything they reference.
pub struct AnalysisUnit {
    pub services: Arc<Services>,
    pub job_id: JobId,
    pub url: Url,
}

fn is_playlist_page(page: &Page) -> bool {
    page.content_type.as_deref().is_some_and(|ct| ct.to_ascii_lowercase().contains("mpegurl"))
        || page.body.trim_start().starts_with("#EXTM3U")
}

impl AnalysisUnit {
    async fn analyze(&self, control: &Control) -> Result<Vec<Resource>, UnitError> {
        let http = &self.services.http;
        let policy = &self.services.policy;
        control.checkpoint().await?;

        // A HEAD the server refuses tells us nothing; fall through to GET.
        let probe = match http.probe(&self.url).await {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "probe failed");
                None
            }
        };

        if let Some(p) = probe.filter(|p| http.is_excluded_for_discovery(p)) {
            tracing::info!(url = %p.url, content_type = ?p.content_type, "not a page, taking it as a single resource");
            let kind = p
                .content_type
                .as_deref()
                .map(ResourceKind::from_content_type)
                .filter(|k| *k != ResourceKind::Other)
                .unwrap_or_else(|| ResourceKind::infer(p.url.as_str()));
            let r = ResourceRef { kind, locator: SourceLocator::Url(p.url.to_string()), title: None };
            return self.record(vec![(r, None)]).await;
        }

        let page = run_with_retry(policy, control, |_| http.fetch_page(&self.url)).await?;
        if is_playlist_page(&page) {
            let r = ResourceRef {
                kind: ResourceKind::M3u8Playlist,
                locator: SourceLocator::Url(page.url.to_string()),
                title: None,
            };
            return self.record(vec![(r, None)]).await;
        }
        let refs = self.crawl_from(page, control).await?;
        self.record(refs).await
    }

    /// Breadth-first over same-site links. A linked page that cannot be
    /// fetched is skipped; only cancellation stops the crawl.
    async fn crawl_from(&self, seed: Page, control: &Control) -> Result<Vec<(ResourceRef, Option<String>)>, UnitError> {
        let http = &self.services.http;
        let settings = &self.services.crawl;
        let mut visited: HashSet<String> = [self.url.to_string(), seed.url.to_string()].into_iter().collect();
        let mut frontier: VecDeque<(Page, u32)> = VecDeque::from([(seed, 0)]);
        let mut pending: VecDeque<(Url, u32)> = VecDeque::new();
        let mut fetched = 1usize;
        let mut refs = Vec::new();

        loop {
            while let Some((page, depth)) = frontier.pop_front() {
                let referer = page.url.to_string();
                refs.extend(discover_resources(&page.body, &page.url).into_iter().map(|r| (r, Some(referer.clone()))));
                if depth < settings.max_depth {
                    for link in discover_links(&page.body, &page.url) {
                        if visited.insert(link.to_string()) {
                            pending.push_back((link, depth + 1));
                        }
                    }
                }
            }
            let Some((url, depth)) = pending.pop_front() else { break };
            if fetched >= settings.max_pages {
                tracing::debug!(skipped = pending.len() + 1, max_pages = settings.max_pages, "page budget reached");
                break;
            }
            control.checkpoint().await?;
            fetched += 1;
            match run_with_retry(&self.services.policy, control, |_| http.fetch_page(&url)).await {
                Ok(page) if page.content_type.as_deref().map_or(true, |ct| ct.to_ascii_lowercase().contains("html")) => {
                    tracing::debug!(url = %page.url, depth, "linked page scanned");
                    visited.insert(page.url.to_string());
                    frontier.push_back((page, depth));
                }
                Ok(page) => tracing::debug!(url = %page.url, content_type = ?page.content_type, "linked target is not a page"),
                Err(UnitError::Cancelled) => return Err(UnitError::Cancelled),
                Err(e) => tracing::warn!(%url, error = %e, "linked page skipped"),
            }
        }
        tracing::info!(url = %self.url, pages = fetched, "crawl finished");
        Ok(refs)
    }

    async fn record(&self, refs: Vec<(ResourceRef, Option<String>)>) -> Result<Vec<Resource>, UnitError> {
        let mut seen = HashSet::new();
        let found: Vec<Resource> = refs
            .into_iter()
            .map(|(r, referer)| Resource::discovered(r, referer, self.services.policy.max_attempts))
            .filter(|r| seen.insert(r.id.clone()))
            .collect();
        self.services.recorder.commit(found).await
    }

    fn failed(&self, err: &UnitError) {
        let rec = &self.services.recorder;
        rec.publish(EngineEvent::AnalysisFailed { job_id: self.job_id, kind: err.kind(), reason: err.to_string() });
        rec.jobs().finish(self.job_id, JobOutcome::AnalysisFailed { reason: err.to_string() });
    }
}

#[async_trait]
impl Unit for AnalysisUnit {
    fn describe(&self) -> String {
        format!("analyze {}", self.url)
    }

    fn owner(&self) -> UnitOwner {
        UnitOwner::Analysis(self.job_id)
    }

    async fn run(self: Box<Self>, ctx: UnitContext) {
        let rec = &self.services.recorder;
        rec.publish(EngineEvent::AnalysisStarted { job_id: self.job_id, url: self.url.to_string() });
        match self.analyze(ctx.control()).await {
            Ok(resources) => {
                tracing::info!(url = %self.url, found = resources.len(), "analysis finished");
                let found = resources.iter().map(|r| r.id.clone()).collect();
                rec.publish(EngineEvent::ResourcesFound { job_id: self.job_id, resources });
                rec.jobs().finish(self.job_id, JobOutcome::Analyzed { found });
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "analysis failed");
                self.failed(&e);
            }
        }
    }

    async fn abandon(self: Box<Self>) {
        self.failed(&UnitError::Cancelled);
    }
}
