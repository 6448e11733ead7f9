//! Finds media references and follow-up pages in a page. Pure: no I/O,
//! no state.

use crate::core::model::{InlinePayload, ResourceKind, ResourceRef, SourceLocator};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use url::Url;

static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(img|video|source|audio|a)\b([^>]*)>").unwrap());
static ATTR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)([a-zA-Z_:][-a-zA-Z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
});
static M3U8_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)https?://[^\s"'<>\\]+\.m3u8[^\s"'<>\\]*"#).unwrap());

/// Images declared smaller than this on both axes are icons.
const MIN_IMAGE_EDGE: u32 = 100;

/// Trims input and assumes https when no scheme is given.
pub fn normalize_url(input: &str) -> Option<Url> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    let candidate = if lower.starts_with("http://") || lower.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    Url::parse(&candidate).ok().filter(|u| u.host_str().is_some())
}

struct Tag {
    name: String,
    attrs: Vec<(String, String)>,
}

impl Tag {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn title(&self) -> Option<String> {
        self.attr("alt").or_else(|| self.attr("title")).map(str::to_string)
    }

    fn is_icon_sized(&self) -> bool {
        let dim = |k| self.attr(k).and_then(|v| v.trim_end_matches("px").parse::<u32>().ok());
        matches!((dim("width"), dim("height")), (Some(w), Some(h)) if w < MIN_IMAGE_EDGE || h < MIN_IMAGE_EDGE)
    }
}

fn unescape(s: &str) -> String {
    s.replace("&amp;", "&").replace("&quot;", "\"").replace("&#39;", "'").replace("&#x2F;", "/")
}

fn parse_tags(page: &str) -> impl Iterator<Item = Tag> + '_ {
    TAG_REGEX.captures_iter(page).map(|c| {
        let name = c[1].to_ascii_lowercase();
        let attrs = ATTR_REGEX
            .captures_iter(&c[2])
            .map(|a| {
                let key = a[1].to_ascii_lowercase();
                let value = a.get(2).or_else(|| a.get(3)).or_else(|| a.get(4)).map(|m| m.as_str()).unwrap_or("");
                (key, unescape(value))
            })
            .collect();
        Tag { name, attrs }
    })
}

fn resolve(base: &Url, raw: &str) -> Option<SourceLocator> {
    let raw = raw.trim();
    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("data:") {
        return InlinePayload::parse(raw).map(SourceLocator::Inline);
    }
    if raw.starts_with('#') || ["javascript:", "mailto:", "blob:", "about:", "tel:"].iter().any(|p| lower.starts_with(p)) {
        return None;
    }
    let mut url = base.join(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(SourceLocator::Url(url.to_string()))
}

fn kind_for(locator: &SourceLocator, tag: &str) -> ResourceKind {
    match locator {
        SourceLocator::Inline(_) => ResourceKind::InlineData,
        SourceLocator::Url(u) => match (ResourceKind::infer(u), tag) {
            (ResourceKind::Other, "video" | "source") => ResourceKind::Video,
            (ResourceKind::Other, "img") => ResourceKind::Image,
            (kind, _) => kind,
        },
    }
}

/// Every media reference in `page`, resolved against `base`, deduplicated
/// in first-seen order.
pub fn discover_resources(page: &str, base: &Url) -> Vec<ResourceRef> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut push = |r: ResourceRef| {
        if seen.insert(r.locator.to_string()) {
            out.push(r);
        }
    };

    for tag in parse_tags(page) {
        let sources: Vec<&str> = match tag.name.as_str() {
            "img" => {
                if tag.is_icon_sized() {
                    continue;
                }
                tag.attr("src").or_else(|| tag.attr("data-src")).or_else(|| tag.attr("data-lazy-src")).into_iter().collect()
            }
            "video" | "source" | "audio" => tag.attr("src").or_else(|| tag.attr("data-src")).into_iter().collect(),
            "a" => tag.attr("href").into_iter().collect(),
            _ => Vec::new(),
        };
        for raw in sources {
            let Some(locator) = resolve(base, raw) else { continue };
            let kind = kind_for(&locator, &tag.name);
            // Links only count when they point at media.
            if tag.name == "a" && matches!(kind, ResourceKind::Other | ResourceKind::InlineData) {
                continue;
            }
            push(ResourceRef { kind, locator, title: tag.title() });
        }
    }

    for m in M3U8_REGEX.find_iter(page) {
        let raw = unescape(m.as_str());
        if let Some(locator) = resolve(base, &raw) {
            push(ResourceRef { kind: ResourceKind::M3u8Playlist, locator, title: None });
        }
    }

    out
}

/// Extensions that still name a page rather than a download.
const PAGE_EXTENSIONS: &[&str] = &["html", "htm", "xhtml", "shtml", "php", "asp", "aspx", "jsp"];

fn looks_like_page(url: &Url) -> bool {
    let last = url.path_segments().and_then(|mut s| s.next_back()).unwrap_or("");
    match last.rsplit_once('.') {
        None => true,
        Some((_, ext)) => PAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
    }
}

/// Anchors on the same host as `base` that lead to further pages, in
/// first-seen order. Media links and `base` itself are left out.
pub fn discover_links(page: &str, base: &Url) -> Vec<Url> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for tag in parse_tags(page).filter(|t| t.name == "a") {
        let Some(SourceLocator::Url(raw)) = tag.attr("href").and_then(|h| resolve(base, h)) else { continue };
        let Ok(url) = Url::parse(&raw) else { continue };
        if url.host_str() != base.host_str() || url.as_str() == base.as_str() {
            continue;
        }
        if ResourceKind::infer(url.as_str()) != ResourceKind::Other || !looks_like_page(&url) {
            continue;
        }
        if seen.insert(url.to_string()) {
            out.push(url);
        }
    }
    out
}
