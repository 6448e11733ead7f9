use crate::core::model::{Resource, ResourceKind, SourceLocator};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use url::Url;

/// Picks a unique on-disk name per resource for one batch.
pub struct TargetPlanner {
    out_dir: PathBuf,
    taken: HashSet<PathBuf>,
}

impl TargetPlanner {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self { out_dir: out_dir.into(), taken: HashSet::new() }
    }

    pub fn plan(&mut self, resource: &Resource) -> PathBuf {
        let name = file_name_for(resource);
        let (stem, ext) = split_ext(&name);
        let mut candidate = self.out_dir.join(&name);
        let mut n = 1;
        while self.taken.contains(&candidate) || candidate.exists() {
            candidate = self.out_dir.join(format!("{stem}_{n}{ext}"));
            n += 1;
        }
        self.taken.insert(candidate.clone());
        candidate
    }
}

fn split_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    }
}

fn file_name_for(resource: &Resource) -> String {
    let fallback = format!("file_{}", &resource.id.as_str()[..8.min(resource.id.as_str().len())]);
    match &resource.locator {
        SourceLocator::Inline(p) => format!("{}.{}", fallback, extension_for_media_type(&p.media_type)),
        SourceLocator::Url(raw) => {
            let last = Url::parse(raw)
                .ok()
                .and_then(|u| u.path_segments().and_then(|mut s| s.next_back().map(|s| s.to_string())))
                .map(|s| urlencoding::decode(&s).map(|d| d.into_owned()).unwrap_or(s))
                .unwrap_or_default();
            let mut name = sanitize_filename::sanitize(last.trim());
            if name.is_empty() || name.starts_with('.') {
                name = fallback;
            }
            if resource.kind == ResourceKind::M3u8Playlist {
                let (stem, _) = split_ext(&name);
                name = format!("{stem}.mp4");
            }
            name
        }
    }
}

pub fn extension_for_media_type(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "image/bmp" => "bmp",
        "image/x-icon" | "image/vnd.microsoft.icon" => "ico",
        "image/avif" => "avif",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "text/plain" => "txt",
        "text/html" => "html",
        "text/css" => "css",
        "application/json" => "json",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}

/// Creates the output directory for a batch.
pub async fn prepare_out_dir(out_dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(out_dir).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::ResourceRef;

    fn resource(raw: &str) -> Resource {
        let locator = SourceLocator::parse(raw).unwrap();
        let kind = match &locator {
            SourceLocator::Inline(_) => ResourceKind::InlineData,
            SourceLocator::Url(u) => ResourceKind::infer(u),
        };
        Resource::discovered(ResourceRef { kind, locator, title: None }, None, 3)
    }

    #[test]
    fn names_come_from_the_last_path_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = TargetPlanner::new(dir.path());
        assert_eq!(p.plan(&resource("https://x.test/a/cat%20pic.png?x=1")), dir.path().join("cat pic.png"));
        assert_eq!(p.plan(&resource("https://x.test/live/index.m3u8")), dir.path().join("index.mp4"));
    }

    #[test]
    fn collisions_get_numbered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.png"), b"old").unwrap();
        let mut p = TargetPlanner::new(dir.path());
        assert_eq!(p.plan(&resource("https://one.test/a.png")), dir.path().join("a_1.png"));
        assert_eq!(p.plan(&resource("https://two.test/a.png")), dir.path().join("a_2.png"));
    }

    #[test]
    fn fallbacks_for_inline_and_bare_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = TargetPlanner::new(dir.path());
        let inline = resource("data:image/png;base64,AAAA");
        let path = p.plan(&inline);
        assert_eq!(path, dir.path().join(format!("file_{}.png", &inline.id.as_str()[..8])));

        let bare = resource("https://x.test/");
        let name = p.plan(&bare).file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("file_"));
    }
}
