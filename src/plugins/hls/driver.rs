use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use url::Url;

use crate::core::control::Control;
use crate::core::error::UnitError;
use crate::core::events::EngineEvent;
use crate::core::model::{Resource, ResourceId, Segment, SegmentStatus};
use crate::core::pool::{Generation, Unit, UnitContext};
use crate::core::recorder::Recorder;
use crate::core::retry::{run_with_retry, RetryPolicy};
use crate::core::sync_lock;
use crate::plugins::hls::merge::MergeTool;
use crate::plugins::hls::playlist::{self, Parsed};
use crate::plugins::hls::HlsSettings;
use crate::plugins::http::driver::HttpDriver;

/// Share of the progress bar given to segment downloads; the merge gets
/// the rest.
const DOWNLOAD_SHARE: f64 = 0.95;

type SegmentResult = Result<PathBuf, UnitError>;

/// One segment download, runnable by whichever side claims it first: a
/// pool executor, or the playlist's own unit once the pool stalls.
struct SegmentTask {
    segment: Segment,
    dest: PathBuf,
    referer: Option<String>,
    http: Arc<HttpDriver>,
    policy: RetryPolicy,
    abort: Arc<AtomicBool>,
    claimed: AtomicBool,
    reply: Mutex<Option<oneshot::Sender<SegmentResult>>>,
}

impl SegmentTask {
    fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::SeqCst)
    }

    async fn execute(&self, control: &Control) -> SegmentResult {
        if self.abort.load(Ordering::SeqCst) {
            return Err(UnitError::Cancelled);
        }
        let seg = &self.segment;
        let bytes = run_with_retry(&self.policy, control, |_| {
            self.http.fetch_bytes(&seg.uri, self.referer.as_deref(), seg.byte_range)
        })
        .await?;
        tokio::fs::write(&self.dest, &bytes).await?;
        Ok(self.dest.clone())
    }
}

struct SegmentUnit {
    playlist: ResourceId,
    task: Arc<SegmentTask>,
}

#[async_trait]
impl Unit for SegmentUnit {
    fn describe(&self) -> String {
        format!("segment {} of {}", self.task.segment.sequence_index, self.playlist)
    }

    async fn run(self: Box<Self>, ctx: UnitContext) {
        if !self.task.claim() {
            return;
        }
        // Held outside the task so a panic drops it and wakes the owner.
        let reply = sync_lock(&self.task.reply).take();
        let result = self.task.execute(ctx.control()).await;
        if let Some(tx) = reply {
            let _ = tx.send(result);
        }
    }
}

/// Waits for a queued segment, downloading it in place if nobody has
/// picked it up within `stall`.
async fn await_segment(
    task: Arc<SegmentTask>,
    mut rx: oneshot::Receiver<SegmentResult>,
    control: Control,
    stall: Duration,
) -> (Segment, SegmentResult) {
    let segment = task.segment.clone();
    loop {
        match tokio::time::timeout(stall, &mut rx).await {
            Ok(Ok(result)) => return (segment, result),
            Ok(Err(_)) => {
                if task.claim() {
                    return (segment, task.execute(&control).await);
                }
                let index = segment.sequence_index;
                return (segment, Err(UnitError::Internal(format!("segment {index} worker stopped without a result"))));
            }
            Err(_) => {
                if task.claim() {
                    return (segment, task.execute(&control).await);
                }
            }
        }
    }
}

pub struct HlsRequest<'a> {
    pub resource: &'a Resource,
    pub target: &'a Path,
    pub out_dir: &'a Path,
    pub recorder: &'a Recorder,
    pub generation: &'a Generation,
}

pub struct HlsDriver {
    http: Arc<HttpDriver>,
    merger: Arc<dyn MergeTool>,
    settings: HlsSettings,
    policy: RetryPolicy,
}

impl HlsDriver {
    pub fn new(http: Arc<HttpDriver>, merger: Arc<dyn MergeTool>, settings: HlsSettings, policy: RetryPolicy) -> Self {
        Self { http, merger, settings, policy }
    }

    pub fn merger(&self) -> &Arc<dyn MergeTool> {
        &self.merger
    }

    /// Fetches the playlist, following at most one master indirection.
    pub async fn resolve_playlist(&self, url: &str, referer: Option<&str>) -> Result<Vec<Segment>, UnitError> {
        let mut current = Url::parse(url).map_err(|e| UnitError::NetworkPermanent(format!("{url}: {e}")))?;
        for _ in 0..2 {
            let body = self.http.fetch_bytes(current.as_str(), referer, None).await?;
            match playlist::parse(&body, &current)? {
                Parsed::Media(segments) => return Ok(segments),
                Parsed::Master(variant) => {
                    tracing::debug!(master = %current, variant = %variant, "selected rendition");
                    current = variant;
                }
            }
        }
        Err(UnitError::PlaylistParse(format!("{url}: nested master playlists")))
    }

    /// Downloads every segment then merges them into `target`. Segment
    /// files live in a scratch directory that is removed on every exit.
    pub async fn download(&self, req: HlsRequest<'_>) -> Result<PathBuf, UnitError> {
        let res = req.resource;
        let control = req.generation.control().clone();
        let url = res
            .locator
            .url()
            .ok_or_else(|| UnitError::Internal("playlist without url".to_string()))?;
        let referer = res.referer.as_deref();

        req.recorder.suspension_point(&res.id, &control).await?;
        let segments = self.resolve_playlist(url, referer).await?;
        for s in &segments {
            req.recorder.record_segment(&res.id, s).await;
        }
        tracing::info!(resource = %res.id, segments = segments.len(), "playlist resolved");

        tokio::fs::create_dir_all(req.out_dir).await?;
        let scratch = tempfile::Builder::new().prefix("m3u8_").tempdir_in(req.out_dir)?;

        let paths = self.fetch_segments(&req, &segments, scratch.path(), &control).await;
        let paths = match paths {
            Ok(p) => p,
            Err(e) => {
                drop(scratch);
                return Err(e);
            }
        };

        req.recorder.suspension_point(&res.id, &control).await?;
        req.recorder.publish(EngineEvent::MergeStarted { resource_id: res.id.clone(), segments: paths.len() });
        let ext = req.target.extension().and_then(|e| e.to_str()).unwrap_or("mp4");
        let merged = scratch.path().join(format!("merged.{ext}"));
        self.merger.merge(&paths, &merged).await?;

        if tokio::fs::metadata(req.target).await.is_ok() {
            tokio::fs::remove_file(req.target).await?;
        }
        tokio::fs::rename(&merged, req.target).await?;
        req.recorder.progress_fraction(&res.id, 1.0, paths.len() as u64);
        Ok(req.target.to_path_buf())
    }

    /// Returns segment files in sequence order, or the first failure.
    async fn fetch_segments(
        &self,
        req: &HlsRequest<'_>,
        segments: &[Segment],
        scratch: &Path,
        control: &Control,
    ) -> Result<Vec<PathBuf>, UnitError> {
        let res = req.resource;
        let total = segments.len();
        let window = self.settings.segment_concurrency.max(1);
        let abort = Arc::new(AtomicBool::new(false));
        let mut done: Vec<(u64, PathBuf)> = Vec::with_capacity(total);
        let mut failure: Option<UnitError> = None;

        for (chunk_no, chunk) in segments.chunks(window).enumerate() {
            if let Err(e) = req.recorder.suspension_point(&res.id, control).await {
                failure = Some(e);
                break;
            }

            let mut waits = FuturesUnordered::new();
            for (i, seg) in chunk.iter().enumerate() {
                let (tx, rx) = oneshot::channel();
                let task = Arc::new(SegmentTask {
                    segment: seg.clone(),
                    dest: scratch.join(format!("segment_{:05}.ts", chunk_no * window + i)),
                    referer: res.referer.clone(),
                    http: self.http.clone(),
                    policy: self.policy.clone(),
                    abort: abort.clone(),
                    claimed: AtomicBool::new(false),
                    reply: Mutex::new(Some(tx)),
                });
                let unit = Box::new(SegmentUnit { playlist: res.id.clone(), task: task.clone() });
                if req.generation.submit(unit).is_err() {
                    // Our generation is draining; we run the segment ourselves.
                    tracing::debug!(resource = %res.id, segment = seg.sequence_index, "pool closed, fetching inline");
                }
                waits.push(await_segment(task, rx, control.clone(), self.settings.stall_interval));
            }

            while let Some((mut seg, result)) = waits.next().await {
                let index = seg.sequence_index;
                match result {
                    Ok(path) => {
                        seg.status = SegmentStatus::Completed;
                        done.push((index, path));
                        req.recorder.progress_fraction(
                            &res.id,
                            done.len() as f64 / total as f64 * DOWNLOAD_SHARE,
                            done.len() as u64,
                        );
                    }
                    Err(e) => {
                        seg.status = if matches!(e, UnitError::Cancelled) { SegmentStatus::Cancelled } else { SegmentStatus::Failed };
                        abort.store(true, Ordering::SeqCst);
                        if failure.is_none() || matches!(e, UnitError::Cancelled) {
                            failure = Some(match e {
                                UnitError::Cancelled => UnitError::Cancelled,
                                other => UnitError::SegmentIncomplete { index, detail: other.to_string() },
                            });
                        }
                    }
                }
                req.recorder.record_segment(&res.id, &seg).await;
            }

            if failure.is_some() {
                break;
            }
        }

        if let Some(e) = failure {
            tracing::warn!(resource = %res.id, error = %e, "playlist aborted");
            return Err(e);
        }
        done.sort_by_key(|(index, _)| *index);
        Ok(done.into_iter().map(|(_, p)| p).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::RecordingMerger;
    use crate::plugins::registry::DriverContext;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn driver() -> HlsDriver {
        let http = Arc::new(HttpDriver::new(DriverContext::default()).unwrap());
        HlsDriver::new(http, Arc::new(RecordingMerger::default()), HlsSettings::default(), RetryPolicy::default())
    }

    async fn serve(server: &MockServer, at: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn master_playlist_is_followed_once() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/master.m3u8",
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=500000\nlow.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=900000\nhigh.m3u8\n",
        )
        .await;
        serve(&server, "/high.m3u8", "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4,\na.ts\n#EXTINF:4,\nb.ts\n#EXT-X-ENDLIST\n").await;

        let segs = driver().resolve_playlist(&format!("{}/master.m3u8", server.uri()), None).await.unwrap();
        let uris: Vec<String> = segs.iter().map(|s| s.uri.clone()).collect();
        assert_eq!(uris, vec![format!("{}/a.ts", server.uri()), format!("{}/b.ts", server.uri())]);
    }

    #[tokio::test]
    async fn nested_master_playlists_are_rejected() {
        let server = MockServer::start().await;
        serve(&server, "/one.m3u8", "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\ntwo.m3u8\n").await;
        serve(&server, "/two.m3u8", "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nthree.m3u8\n").await;

        let err = driver().resolve_playlist(&format!("{}/one.m3u8", server.uri()), None).await.unwrap_err();
        assert!(matches!(err, UnitError::PlaylistParse(_)));
    }

    #[tokio::test]
    async fn playlist_fetch_errors_keep_their_kind() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.m3u8"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let err = driver().resolve_playlist(&format!("{}/gone.m3u8", server.uri()), None).await.unwrap_err();
        assert!(matches!(err, UnitError::NetworkPermanent(_)));
    }
}
