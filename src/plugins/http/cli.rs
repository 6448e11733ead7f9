use crate::core::config::EngineConfig;
use crate::plugins::registry::CliPlugin;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::time::Duration;

pub struct HttpCliPlugin;

impl HttpCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for HttpCliPlugin {
    fn name(&self) -> &'static str {
        "http"
    }

    fn augment_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("http_header")
                .long("header")
                .help_heading("HTTP")
                .help("Extra HTTP header (repeatable), e.g. --header 'Cookie: sid=xxx'")
                .action(ArgAction::Append)
                .num_args(1),
        )
        .arg(
            Arg::new("http_user_agent")
                .long("user-agent")
                .help_heading("HTTP")
                .help("HTTP User-Agent")
                .num_args(1),
        )
        .arg(
            Arg::new("http_timeout_secs")
                .long("timeout-secs")
                .help_heading("HTTP")
                .help("Timeout per request in seconds")
                .default_value("30")
                .num_args(1),
        )
        .arg(
            Arg::new("http_retries")
                .long("retries")
                .help_heading("HTTP")
                .help("Attempts per resource and per segment, the first one included")
                .default_value("3")
                .num_args(1),
        )
        .arg(
            Arg::new("http_retry_backoff_ms")
                .long("retry-backoff-ms")
                .help_heading("HTTP")
                .help("Backoff before the first retry in milliseconds; doubles per retry")
                .default_value("500")
                .num_args(1),
        )
    }

    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut EngineConfig) -> anyhow::Result<()> {
        if let Some(ua) = matches.get_one::<String>("http_user_agent") {
            cfg.driver.user_agent = ua.clone();
        }
        if let Some(s) = matches.get_one::<String>("http_timeout_secs") {
            cfg.driver.timeout_secs = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("http_retries") {
            cfg.retry.max_attempts = s.parse::<u32>()?.max(1);
        }
        if let Some(s) = matches.get_one::<String>("http_retry_backoff_ms") {
            cfg.retry.base_delay = Duration::from_millis(s.parse()?);
        }

        for raw in matches.get_many::<String>("http_header").into_iter().flatten() {
            let (k, v) = parse_header(raw)?;
            cfg.driver.headers.insert(k, v);
        }
        Ok(())
    }
}

/// `Name: value`, trimmed. Values may contain further colons.
fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    let (k, v) = raw
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("invalid header format: {raw}"))?;
    let name = k.trim();
    if name.is_empty() {
        anyhow::bail!("header without a name: {raw}");
    }
    Ok((name.to_string(), v.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_split_on_the_first_colon() {
        assert_eq!(
            parse_header("Referer: https://site.test/a").unwrap(),
            ("Referer".to_string(), "https://site.test/a".to_string())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn retry_flags_land_in_the_policy() {
        let plugin = HttpCliPlugin::new();
        let m = plugin
            .augment_command(Command::new("grab"))
            .try_get_matches_from(["grab", "--retries", "5", "--retry-backoff-ms", "250"])
            .unwrap();
        let mut cfg = EngineConfig::default();
        plugin.apply_matches(&m, &mut cfg).unwrap();
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.base_delay, Duration::from_millis(250));
        assert_eq!(cfg.driver.timeout_secs, 30);
    }
}
