use crate::core::config::EngineConfig;
use crate::plugins::registry::CliPlugin;
use clap::{Arg, ArgMatches, Command};

pub struct HtmlCliPlugin;

impl HtmlCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for HtmlCliPlugin {
    fn name(&self) -> &'static str {
        "html"
    }

    fn augment_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("html_depth")
                .long("depth")
                .help_heading("Crawl")
                .help("Same-site link hops to follow from the page (0 = the page only)")
                .default_value("1")
                .num_args(1),
        )
        .arg(
            Arg::new("html_max_pages")
                .long("max-pages")
                .help_heading("Crawl")
                .help("Upper bound on pages fetched while analysing")
                .default_value("50")
                .num_args(1),
        )
    }

    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut EngineConfig) -> anyhow::Result<()> {
        if let Some(s) = matches.get_one::<String>("html_depth") {
            cfg.crawl.max_depth = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("html_max_pages") {
            cfg.crawl.max_pages = s.parse::<usize>()?.max(1);
        }
        Ok(())
    }
}
