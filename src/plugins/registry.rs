use crate::core::config::EngineConfig;
use clap::{ArgMatches, Command};
use std::collections::BTreeMap;

/// Knobs shared by every network driver.
#[derive(Debug, Clone)]
pub struct DriverContext {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub headers: BTreeMap<String, String>,
    /// Content-type prefixes that are never fetched whole during analysis.
    pub discovery_exclusions: Vec<String>,
    /// Bodies larger than this are not fetched whole during analysis.
    pub probe_size_threshold: u64,
    /// Free space a download must leave on the output volume.
    pub min_free_space: u64,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self {
            user_agent: concat!("OrangeHarvester/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 30,
            headers: BTreeMap::new(),
            discovery_exclusions: ["video/", "audio/", "image/", "application/octet-stream", "application/zip"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            probe_size_threshold: 2 * 1024 * 1024,
            min_free_space: 50 * 1024 * 1024,
        }
    }
}

/// Adds a flag group to the commands that build an engine and copies the
/// parsed values into its config.
pub trait CliPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn augment_command(&self, cmd: Command) -> Command;
    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut EngineConfig) -> anyhow::Result<()>;
}

pub struct PluginRegistry {
    cli_plugins: Vec<Box<dyn CliPlugin>>,
}

impl PluginRegistry {
    pub fn with_defaults() -> Self {
        let mut reg = Self { cli_plugins: vec![] };
        reg.cli_plugins.push(Box::new(crate::plugins::http::cli::HttpCliPlugin::new()));
        reg.cli_plugins.push(Box::new(crate::plugins::hls::cli::HlsCliPlugin::new()));
        reg.cli_plugins.push(Box::new(crate::plugins::html::cli::HtmlCliPlugin::new()));
        reg
    }

    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.cli_plugins.iter().map(|p| p.name()).collect()
    }

    pub fn augment_command(&self, cmd: Command) -> Command {
        self.cli_plugins.iter().fold(cmd, |c, p| p.augment_command(c))
    }

    pub fn apply_matches(&self, matches: &ArgMatches, cfg: &mut EngineConfig) -> anyhow::Result<()> {
        for p in &self.cli_plugins {
            p.apply_matches(matches, cfg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugins_fill_the_engine_config() {
        let reg = PluginRegistry::with_defaults();
        assert_eq!(reg.plugin_names(), vec!["http", "hls", "html"]);
        let cmd = reg.augment_command(Command::new("grab"));
        let m = cmd
            .try_get_matches_from([
                "grab",
                "--header",
                "Cookie: a=b",
                "--timeout-secs",
                "5",
                "--retries",
                "4",
                "--segment-concurrency",
                "2",
                "--ffmpeg",
                "/opt/ffmpeg",
            ])
            .unwrap();
        let mut cfg = EngineConfig::default();
        reg.apply_matches(&m, &mut cfg).unwrap();
        assert_eq!(cfg.driver.timeout_secs, 5);
        assert_eq!(cfg.driver.headers.get("Cookie").map(String::as_str), Some("a=b"));
        assert_eq!(cfg.retry.max_attempts, 4);
        assert_eq!(cfg.hls.segment_concurrency, 2);
        assert_eq!(cfg.hls.ffmpeg_bin, std::path::PathBuf::from("/opt/ffmpeg"));
    }

    #[test]
    fn bad_header_is_rejected() {
        let reg = PluginRegistry::with_defaults();
        let m = reg
            .augment_command(Command::new("grab"))
            .try_get_matches_from(["grab", "--header", "no-colon"])
            .unwrap();
        let mut cfg = EngineConfig::default();
        assert!(reg.apply_matches(&m, &mut cfg).is_err());
    }
}
