use crate::core::error::{ErrorKind, UnitError};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use url::Url;
use uuid::Uuid;

pub type JobId = Uuid;

/// Stable identity of a discovered resource: a digest of the normalized
/// URL, or of the payload for inline data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn for_locator(locator: &SourceLocator) -> Self {
        let mut hasher = Sha256::new();
        match locator {
            SourceLocator::Url(raw) => {
                hasher.update(b"url:");
                let normalized = Url::parse(raw)
                    .map(|mut u| {
                        u.set_fragment(None);
                        u.to_string()
                    })
                    .unwrap_or_else(|_| raw.trim().to_string());
                hasher.update(normalized.as_bytes());
            }
            SourceLocator::Inline(payload) => {
                hasher.update(b"data:");
                hasher.update(payload.media_type.as_bytes());
                hasher.update(payload.data.as_bytes());
            }
        }
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..8]))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Image,
    Video,
    M3u8Playlist,
    InlineData,
    Other,
}

/// What a unit has to do with a resource of a given kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub fetch: bool,
    pub decode: bool,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "svg", "ico", "avif"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "avi", "mov", "mkv", "flv", "wmv", "ts"];

impl ResourceKind {
    pub fn capabilities(&self) -> Capabilities {
        match self {
            ResourceKind::InlineData => Capabilities { fetch: false, decode: true },
            _ => Capabilities { fetch: true, decode: false },
        }
    }

    /// Guesses the kind from a URL's path extension.
    pub fn infer(url: &str) -> Self {
        let path = Url::parse(url)
            .map(|u| u.path().to_ascii_lowercase())
            .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or("").to_ascii_lowercase());
        if path.ends_with(".m3u8") || path.ends_with(".m3u") {
            return ResourceKind::M3u8Playlist;
        }
        let ext = path.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
        if IMAGE_EXTENSIONS.contains(&ext) {
            ResourceKind::Image
        } else if VIDEO_EXTENSIONS.contains(&ext) {
            ResourceKind::Video
        } else {
            ResourceKind::Other
        }
    }

    pub fn from_content_type(content_type: &str) -> Self {
        let ct = content_type.to_ascii_lowercase();
        if ct.contains("mpegurl") {
            ResourceKind::M3u8Playlist
        } else if ct.starts_with("image/") {
            ResourceKind::Image
        } else if ct.starts_with("video/") {
            ResourceKind::Video
        } else {
            ResourceKind::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Image => "image",
            ResourceKind::Video => "video",
            ResourceKind::M3u8Playlist => "m3u8",
            ResourceKind::InlineData => "inline",
            ResourceKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim().to_ascii_lowercase().as_str() {
            "image" | "images" => ResourceKind::Image,
            "video" | "videos" => ResourceKind::Video,
            "m3u8" | "hls" => ResourceKind::M3u8Playlist,
            "inline" | "data" => ResourceKind::InlineData,
            "other" => ResourceKind::Other,
            _ => return None,
        })
    }
}

/// A `data:` URI split into its parts; the payload is kept encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlinePayload {
    pub media_type: String,
    pub base64: bool,
    pub data: String,
}

impl InlinePayload {
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.trim().strip_prefix("data:")?;
        let (meta, data) = rest.split_once(',')?;
        let mut parts = meta.split(';');
        let media_type = parts.next().unwrap_or("").trim();
        let base64 = parts.any(|p| p.trim().eq_ignore_ascii_case("base64"));
        Some(Self {
            media_type: if media_type.is_empty() { "text/plain".to_string() } else { media_type.to_ascii_lowercase() },
            base64,
            data: data.to_string(),
        })
    }
}

impl fmt::Display for InlinePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let enc = if self.base64 { ";base64" } else { "" };
        write!(f, "data:{}{},{}", self.media_type, enc, self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    Url(String),
    Inline(InlinePayload),
}

impl SourceLocator {
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.trim_start().starts_with("data:") {
            InlinePayload::parse(raw).map(SourceLocator::Inline)
        } else if raw.trim().is_empty() {
            None
        } else {
            Some(SourceLocator::Url(raw.trim().to_string()))
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            SourceLocator::Url(u) => Some(u),
            SourceLocator::Inline(_) => None,
        }
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::Url(u) => f.write_str(u),
            SourceLocator::Inline(p) => p.fmt(f),
        }
    }
}

/// What discovery hands back: a locator plus whatever it learned about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub locator: SourceLocator,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceStatus {
    Discovered,
    Queued,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Discovered => "discovered",
            ResourceStatus::Queued => "queued",
            ResourceStatus::InProgress => "in_progress",
            ResourceStatus::Paused => "paused",
            ResourceStatus::Completed => "completed",
            ResourceStatus::Failed => "failed",
            ResourceStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "discovered" => ResourceStatus::Discovered,
            "queued" => ResourceStatus::Queued,
            "in_progress" => ResourceStatus::InProgress,
            "paused" => ResourceStatus::Paused,
            "completed" => ResourceStatus::Completed,
            "failed" => ResourceStatus::Failed,
            "cancelled" => ResourceStatus::Cancelled,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&UnitError> for ErrorDetail {
    fn from(e: &UnitError) -> Self {
        Self { kind: e.kind(), message: e.to_string() }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("resource {id}: cannot go from {from:?} to {to:?}")]
pub struct TransitionError {
    pub id: ResourceId,
    pub from: ResourceStatus,
    pub to: ResourceStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub locator: SourceLocator,
    pub title: String,
    pub referer: Option<String>,
    pub status: ResourceStatus,
    pub progress: f64,
    pub local_path: Option<PathBuf>,
    pub error: Option<ErrorDetail>,
    pub attempt: u32,
    pub max_attempts: u32,
}

impl Resource {
    pub fn discovered(r: ResourceRef, referer: Option<String>, max_attempts: u32) -> Self {
        let title = r.title.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| default_title(&r.locator));
        Self {
            id: ResourceId::for_locator(&r.locator),
            kind: r.kind,
            locator: r.locator,
            title,
            referer,
            status: ResourceStatus::Discovered,
            progress: 0.0,
            local_path: None,
            error: None,
            attempt: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Completed, Cancelled, or Failed with no attempts left.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            ResourceStatus::Completed | ResourceStatus::Cancelled => true,
            ResourceStatus::Failed => !self.can_retry(),
            _ => false,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    fn transition(&mut self, allowed: bool, to: ResourceStatus) -> Result<(), TransitionError> {
        if !allowed {
            return Err(TransitionError { id: self.id.clone(), from: self.status, to });
        }
        self.status = to;
        Ok(())
    }

    pub fn queue(&mut self) -> Result<(), TransitionError> {
        self.transition(self.status == ResourceStatus::Discovered, ResourceStatus::Queued)
    }

    /// Queued → InProgress; every start consumes one attempt.
    pub fn begin(&mut self) -> Result<(), TransitionError> {
        self.transition(self.status == ResourceStatus::Queued, ResourceStatus::InProgress)?;
        self.attempt += 1;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), TransitionError> {
        self.transition(self.status == ResourceStatus::InProgress, ResourceStatus::Paused)
    }

    pub fn resume(&mut self) -> Result<(), TransitionError> {
        self.transition(self.status == ResourceStatus::Paused, ResourceStatus::InProgress)
    }

    pub fn set_progress(&mut self, fraction: f64) -> bool {
        if self.status != ResourceStatus::InProgress {
            return false;
        }
        let clamped = fraction.clamp(0.0, 1.0);
        if clamped > self.progress {
            self.progress = clamped;
            return true;
        }
        false
    }

    pub fn complete(&mut self, path: PathBuf) -> Result<(), TransitionError> {
        self.transition(self.status == ResourceStatus::InProgress, ResourceStatus::Completed)?;
        self.progress = 1.0;
        self.local_path = Some(path);
        self.error = None;
        Ok(())
    }

    pub fn fail(&mut self, detail: ErrorDetail) -> Result<(), TransitionError> {
        let allowed = matches!(self.status, ResourceStatus::InProgress | ResourceStatus::Paused);
        self.transition(allowed, ResourceStatus::Failed)?;
        self.local_path = None;
        self.error = Some(detail);
        Ok(())
    }

    /// Failed → Queued for another attempt; clears the error.
    pub fn requeue(&mut self) -> Result<(), TransitionError> {
        let allowed = self.status == ResourceStatus::Failed && self.can_retry();
        self.transition(allowed, ResourceStatus::Queued)?;
        self.error = None;
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        let allowed = !self.is_terminal();
        self.transition(allowed, ResourceStatus::Cancelled)?;
        self.local_path = None;
        self.error = None;
        Ok(())
    }

    /// Load-time only: a record left mid-flight by a previous process
    /// becomes downloadable again with a fresh attempt budget.
    pub fn recover_interrupted(&mut self) -> bool {
        if matches!(self.status, ResourceStatus::Queued | ResourceStatus::InProgress | ResourceStatus::Paused) {
            self.status = ResourceStatus::Discovered;
            self.progress = 0.0;
            self.attempt = 0;
            self.error = None;
            self.local_path = None;
            return true;
        }
        false
    }

    pub fn invariants_hold(&self) -> bool {
        let completed = self.status == ResourceStatus::Completed;
        let failed = self.status == ResourceStatus::Failed;
        completed == self.local_path.is_some() && failed == self.error.is_some()
    }
}

fn default_title(locator: &SourceLocator) -> String {
    match locator {
        SourceLocator::Url(u) => Url::parse(u)
            .ok()
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut s| s.next_back().map(|s| s.to_string()))
                    .filter(|s| !s.is_empty())
            })
            .unwrap_or_else(|| u.clone()),
        SourceLocator::Inline(p) => format!("inline {}", p.media_type),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub length: u64,
    pub offset: u64,
}

impl ByteRange {
    /// One past the last byte, or `None` when that does not fit in a u64.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentStatus::Pending => "pending",
            SegmentStatus::InProgress => "in_progress",
            SegmentStatus::Completed => "completed",
            SegmentStatus::Failed => "failed",
            SegmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => SegmentStatus::Pending,
            "in_progress" => SegmentStatus::InProgress,
            "completed" => SegmentStatus::Completed,
            "failed" => SegmentStatus::Failed,
            "cancelled" => SegmentStatus::Cancelled,
            _ => return None,
        })
    }
}

/// One media fragment of a playlist; `sequence_index` fixes merge order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub sequence_index: u64,
    pub uri: String,
    pub byte_range: Option<ByteRange>,
    pub status: SegmentStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_resource(url: &str) -> Resource {
        Resource::discovered(
            ResourceRef { kind: ResourceKind::infer(url), locator: SourceLocator::Url(url.to_string()), title: None },
            None,
            3,
        )
    }

    #[test]
    fn id_ignores_fragment_but_not_query() {
        let a = ResourceId::for_locator(&SourceLocator::Url("https://x.test/a.png#top".into()));
        let b = ResourceId::for_locator(&SourceLocator::Url("https://x.test/a.png".into()));
        let c = ResourceId::for_locator(&SourceLocator::Url("https://x.test/a.png?v=2".into()));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn kind_inference() {
        assert_eq!(ResourceKind::infer("https://x.test/live/stream.m3u8?token=1"), ResourceKind::M3u8Playlist);
        assert_eq!(ResourceKind::infer("https://x.test/a/b.JPG"), ResourceKind::Image);
        assert_eq!(ResourceKind::infer("https://x.test/clip.webm"), ResourceKind::Video);
        assert_eq!(ResourceKind::infer("https://x.test/page.html"), ResourceKind::Other);
        assert_eq!(ResourceKind::from_content_type("application/vnd.apple.mpegurl"), ResourceKind::M3u8Playlist);
        assert!(!ResourceKind::InlineData.capabilities().fetch);
    }

    #[test]
    fn inline_payload_parses_and_prints() {
        let p = InlinePayload::parse("data:image/png;base64,AAAA").unwrap();
        assert_eq!(p.media_type, "image/png");
        assert!(p.base64);
        assert_eq!(p.data, "AAAA");
        assert_eq!(p.to_string(), "data:image/png;base64,AAAA");

        let plain = InlinePayload::parse("data:,hello%20world").unwrap();
        assert_eq!(plain.media_type, "text/plain");
        assert!(!plain.base64);
        assert!(InlinePayload::parse("data:no-comma").is_none());
    }

    #[test]
    fn happy_path_keeps_invariants() {
        let mut r = url_resource("https://x.test/a.png");
        assert_eq!(r.title, "a.png");
        assert!(r.invariants_hold());
        r.queue().unwrap();
        r.begin().unwrap();
        assert_eq!(r.attempt, 1);
        assert!(r.set_progress(0.5));
        assert!(!r.set_progress(0.25));
        assert_eq!(r.progress, 0.5);
        r.pause().unwrap();
        assert!(!r.set_progress(0.9));
        r.resume().unwrap();
        r.complete(PathBuf::from("/tmp/a.png")).unwrap();
        assert!(r.invariants_hold());
        assert!(r.is_terminal());
        assert!(r.cancel().is_err());
        assert!(r.queue().is_err());
    }

    #[test]
    fn retry_budget_bounds_requeue() {
        let mut r = url_resource("https://x.test/a.bin");
        r.queue().unwrap();
        for n in 1..=3 {
            r.begin().unwrap();
            r.fail(ErrorDetail { kind: ErrorKind::NetworkTransient, message: "503".into() }).unwrap();
            assert!(r.invariants_hold());
            assert_eq!(r.attempt, n);
            if n < 3 {
                r.requeue().unwrap();
                assert!(r.error.is_none());
                assert!(r.invariants_hold());
            }
        }
        assert!(r.is_terminal());
        assert!(r.requeue().is_err());
        assert!(r.cancel().is_err());
    }

    #[test]
    fn cancel_from_any_live_state() {
        for setup in 0..4 {
            let mut r = url_resource("https://x.test/a.bin");
            if setup >= 1 {
                r.queue().unwrap();
            }
            if setup >= 2 {
                r.begin().unwrap();
            }
            if setup >= 3 {
                r.pause().unwrap();
            }
            r.cancel().unwrap();
            assert_eq!(r.status, ResourceStatus::Cancelled);
            assert!(r.invariants_hold());
        }
    }

    #[test]
    fn interrupted_records_recover() {
        let mut r = url_resource("https://x.test/a.bin");
        r.queue().unwrap();
        r.begin().unwrap();
        r.set_progress(0.3);
        assert!(r.recover_interrupted());
        assert_eq!(r.status, ResourceStatus::Discovered);
        assert_eq!(r.attempt, 0);

        let mut done = url_resource("https://x.test/b.bin");
        done.queue().unwrap();
        done.begin().unwrap();
        done.complete(PathBuf::from("b.bin")).unwrap();
        assert!(!done.recover_interrupted());
    }

    #[test]
    fn illegal_transition_is_not_reported_as_a_panic() {
        let mut r = url_resource("https://x.test/a.bin");
        let err: UnitError = r.begin().unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        let text = err.to_string();
        assert!(text.contains("cannot go from Discovered to InProgress"), "{text}");
        assert!(!text.contains("panicked"), "{text}");
        assert_eq!(r.status, ResourceStatus::Discovered);
        assert_eq!(r.attempt, 0);
    }
}
