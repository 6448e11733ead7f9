pub mod cli;
pub mod driver;
pub mod merge;
pub mod playlist;

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HlsSettings {
    /// Segments in flight per playlist.
    pub segment_concurrency: usize,
    /// How long a queued segment may sit unclaimed before the playlist's
    /// own unit downloads it itself.
    pub stall_interval: Duration,
    pub ffmpeg_bin: PathBuf,
}

impl Default for HlsSettings {
    fn default() -> Self {
        Self {
            segment_concurrency: 4,
            stall_interval: Duration::from_millis(250),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
        }
    }
}
