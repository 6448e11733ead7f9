use crate::core::config::EngineConfig;
use crate::plugins::registry::CliPlugin;
use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;
use std::time::Duration;

pub struct HlsCliPlugin;

impl HlsCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for HlsCliPlugin {
    fn name(&self) -> &'static str {
        "hls"
    }

    fn augment_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("hls_ffmpeg")
                .long("ffmpeg")
                .help_heading("HLS")
                .help("ffmpeg binary used to merge playlist segments")
                .default_value("ffmpeg")
                .num_args(1),
        )
        .arg(
            Arg::new("hls_segment_concurrency")
                .long("segment-concurrency")
                .help_heading("HLS")
                .help("Segments downloaded at once per playlist")
                .default_value("4")
                .num_args(1),
        )
        .arg(
            Arg::new("hls_segment_stall_ms")
                .long("segment-stall-ms")
                .help_heading("HLS")
                .help("How long a queued segment may wait for a worker before the playlist fetches it itself")
                .default_value("250")
                .num_args(1),
        )
    }

    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut EngineConfig) -> anyhow::Result<()> {
        if let Some(bin) = matches.get_one::<String>("hls_ffmpeg") {
            cfg.hls.ffmpeg_bin = PathBuf::from(bin);
        }
        if let Some(s) = matches.get_one::<String>("hls_segment_concurrency") {
            cfg.hls.segment_concurrency = s.parse::<usize>()?.max(1);
        }
        if let Some(s) = matches.get_one::<String>("hls_segment_stall_ms") {
            cfg.hls.stall_interval = Duration::from_millis(s.parse()?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(args: &[&str]) -> EngineConfig {
        let plugin = HlsCliPlugin::new();
        let m = plugin.augment_command(Command::new("grab")).try_get_matches_from(args).unwrap();
        let mut cfg = EngineConfig::default();
        plugin.apply_matches(&m, &mut cfg).unwrap();
        cfg
    }

    #[test]
    fn defaults_match_engine_defaults() {
        let cfg = apply(&["grab"]);
        assert_eq!(cfg.hls.segment_concurrency, 4);
        assert_eq!(cfg.hls.stall_interval, Duration::from_millis(250));
        assert_eq!(cfg.hls.ffmpeg_bin, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn segment_flags_are_applied() {
        let cfg = apply(&["grab", "--segment-concurrency", "0", "--segment-stall-ms", "1000", "--ffmpeg", "/opt/ff"]);
        assert_eq!(cfg.hls.segment_concurrency, 1);
        assert_eq!(cfg.hls.stall_interval, Duration::from_secs(1));
        assert_eq!(cfg.hls.ffmpeg_bin, PathBuf::from("/opt/ff"));
    }
}
