mod core;
mod i18n;
mod plugins;

use crate::core::config::EngineConfig;
use crate::core::engine::Engine;
use crate::core::events::EngineEvent;
use crate::core::jobs::JobOutcome;
use crate::core::model::{JobId, Resource, ResourceId, ResourceKind, ResourceStatus, SourceLocator};
use crate::core::store::{Repository, SqliteStore};
use crate::i18n::{Locale, Messages};
use crate::plugins::registry::PluginRegistry;
use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

fn build_cli(registry: &PluginRegistry) -> Command {
    let analyze = Command::new("analyze")
        .about("List the media a page references")
        .arg(Arg::new("url").help("Page to analyze").required(true).num_args(1));

    let grab = Command::new("grab")
        .about("Analyze a page and download what it references")
        .arg(Arg::new("url").help("Page to analyze").required(true).num_args(1))
        .arg(
            Arg::new("out_dir")
                .long("out-dir")
                .help("Output directory")
                .default_value("./downloads")
                .num_args(1),
        )
        .arg(
            Arg::new("kinds")
                .long("kinds")
                .help("Comma-separated kinds to download: image, video, m3u8, inline, other")
                .default_value("image,video,m3u8,inline")
                .num_args(1),
        )
        .arg(
            Arg::new("min_workers")
                .long("min-workers")
                .help("Executors kept alive while idle")
                .default_value("1")
                .num_args(1),
        )
        .arg(
            Arg::new("max_workers")
                .long("max-workers")
                .help("Upper bound on concurrent executors")
                .default_value("20")
                .num_args(1),
        );

    let history = Command::new("history").about("Show every resource recorded so far");

    Command::new("harvester")
        .about("Finds images, videos, HLS streams and inline assets on a page and downloads them")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("db")
                .long("db")
                .global(true)
                .help("State database")
                .default_value("./.harvester.sqlite")
                .num_args(1),
        )
        .arg(
            Arg::new("locale")
                .long("locale")
                .global(true)
                .help("Message language (en, zh)")
                .default_value("en")
                .num_args(1),
        )
        .arg(Arg::new("verbose").short('v').long("verbose").global(true).action(ArgAction::SetTrue))
        .arg(Arg::new("quiet").short('q').long("quiet").global(true).action(ArgAction::SetTrue))
        .subcommand(registry.augment_command(analyze))
        .subcommand(registry.augment_command(grab))
        .subcommand(history)
}

fn init_tracing(m: &ArgMatches) {
    let filter = if m.get_flag("verbose") {
        EnvFilter::new("debug")
    } else if m.get_flag("quiet") {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn parse_kinds(raw: &str) -> anyhow::Result<HashSet<ResourceKind>> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| ResourceKind::parse(s).ok_or_else(|| anyhow::anyhow!("unknown kind: {s}")))
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let registry = PluginRegistry::with_defaults();
    let matches = build_cli(&registry).get_matches();
    let Some((name, m)) = matches.subcommand() else { return Ok(()) };
    init_tracing(m);

    let msgs = i18n::get_messages(m.get_one::<String>("locale").map(|s| Locale::parse(s)).unwrap_or_default());
    let db: PathBuf = m.get_one::<String>("db").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".harvester.sqlite"));

    match name {
        "analyze" => {
            let mut cfg = EngineConfig::default();
            registry.apply_matches(m, &mut cfg)?;
            let engine = Engine::open(&db, cfg).await?;
            let url = m.get_one::<String>("url").map(String::as_str).unwrap_or_default();
            let found = analyze(&engine, url, msgs).await?;
            for r in &found {
                println!("{}  {:<7} {:<11} {}  {}", r.id, r.kind.as_str(), r.status.as_str(), r.title, short_locator(&r.locator));
            }
        }
        "grab" => {
            let mut cfg = EngineConfig::default();
            registry.apply_matches(m, &mut cfg)?;
            if let Some(n) = m.get_one::<String>("min_workers") {
                cfg.pool.floor = n.parse::<usize>()?.max(1);
            }
            if let Some(n) = m.get_one::<String>("max_workers") {
                cfg.pool.ceiling = n.parse::<usize>()?.max(cfg.pool.floor);
            }
            let kinds = parse_kinds(m.get_one::<String>("kinds").map(String::as_str).unwrap_or_default())?;
            let out_dir: PathBuf = m.get_one::<String>("out_dir").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./downloads"));
            let url = m.get_one::<String>("url").map(String::as_str).unwrap_or_default();

            let engine = Engine::open(&db, cfg).await?;
            let found = analyze(&engine, url, msgs).await?;
            grab(&engine, found, &kinds, out_dir, msgs).await?;
        }
        "history" => {
            let store = SqliteStore::open(&db).await?;
            let mut all = store.load_resources().await?;
            if all.is_empty() {
                println!("{}", msgs.history_empty);
            }
            all.sort_by(|a, b| a.title.cmp(&b.title));
            for r in all {
                let detail = match (&r.local_path, &r.error) {
                    (Some(p), _) => p.display().to_string(),
                    (_, Some(e)) => format!("{}: {}", e.kind, e.message),
                    _ => short_locator(&r.locator),
                };
                println!("{}  {:<7} {:<11} {}/{}  {}  {}", r.id, r.kind.as_str(), r.status.as_str(), r.attempt, r.max_attempts, r.title, detail);
            }
        }
        _ => {}
    }

    Ok(())
}

async fn analyze(engine: &Engine, url: &str, msgs: &Messages) -> anyhow::Result<Vec<Resource>> {
    let job = engine.analyze(url).await?;
    eprintln!("{} {url}", msgs.analyzing);
    match engine.wait(job).await {
        Some(JobOutcome::Analyzed { found }) => {
            let resources: Vec<Resource> = found.iter().filter_map(|id| engine.resource(id)).collect();
            if resources.is_empty() {
                eprintln!("{}", msgs.nothing_found);
            } else {
                eprintln!("{}: {}", msgs.found, resources.len());
            }
            Ok(resources)
        }
        Some(JobOutcome::AnalysisFailed { reason }) => anyhow::bail!("{}: {reason}", msgs.analysis_failed),
        _ => anyhow::bail!("{}", msgs.analysis_failed),
    }
}

async fn grab(
    engine: &Engine,
    found: Vec<Resource>,
    kinds: &HashSet<ResourceKind>,
    out_dir: PathBuf,
    msgs: &'static Messages,
) -> anyhow::Result<()> {
    let merge_ready = match engine.merge_preflight() {
        Ok(path) => {
            tracing::debug!(tool = %path.display(), "merge tool found");
            true
        }
        Err(_) => false,
    };

    let mut selected: Vec<Resource> = Vec::new();
    let mut skipped_playlists = false;
    for r in found.into_iter().filter(|r| kinds.contains(&r.kind)) {
        if r.status == ResourceStatus::Completed {
            eprintln!("{} ({}): {}", r.title, msgs.already_downloaded, r.local_path.as_ref().map(|p| p.display().to_string()).unwrap_or_default());
            continue;
        }
        if r.kind == ResourceKind::M3u8Playlist && !merge_ready {
            skipped_playlists = true;
            continue;
        }
        selected.push(r);
    }
    if skipped_playlists {
        eprintln!("{}", msgs.merge_tool_missing);
    }
    if selected.is_empty() {
        eprintln!("{}", msgs.nothing_selected);
        return Ok(());
    }

    let titles: HashMap<ResourceId, String> = selected.iter().map(|r| (r.id.clone(), r.title.clone())).collect();
    let ids: Vec<ResourceId> = selected.iter().map(|r| r.id.clone()).collect();

    let rx = engine.subscribe();
    let job = engine.download(&ids, &out_dir).await?;
    eprintln!("{}: {} -> {}", msgs.batch_started, ids.len(), out_dir.display());
    eprintln!("{}", msgs.controls_hint);

    let ui_task = tokio::spawn(render_progress(rx, job, titles, msgs, styles()?));
    let keys_task = tokio::spawn(read_commands(engine.clone(), msgs));

    let outcome = tokio::select! {
        outcome = engine.wait(job) => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", msgs.cancelling);
            engine.cancel();
            engine.wait(job).await
        }
    };
    keys_task.abort();
    let _ = ui_task.await;

    if let Some(JobOutcome::Batch(s)) = outcome {
        println!();
        println!("{}: {}/{} {}, {} {}, {} {}", msgs.summary_header, s.completed, s.total, msgs.status_done, s.failed, msgs.status_failed, s.cancelled, msgs.status_cancelled);
    }
    Ok(())
}

async fn read_commands(engine: Engine, msgs: &'static Messages) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "p" => {
                if let Err(e) = engine.pause() {
                    eprintln!("{}: {e}", msgs.command_rejected);
                }
            }
            "r" => engine.resume(),
            "c" => {
                eprintln!("{}", msgs.cancelling);
                engine.cancel();
            }
            "R" => {
                engine.restart_pool();
            }
            _ => {}
        }
    }
}

struct Styles {
    spinner: ProgressStyle,
    bytes: ProgressStyle,
    percent: ProgressStyle,
}

fn styles() -> anyhow::Result<Styles> {
    Ok(Styles {
        spinner: ProgressStyle::with_template("{spinner:.green} {prefix} {wide_msg}")?.tick_chars("|/-\\ "),
        bytes: ProgressStyle::with_template("{prefix} {bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}) {wide_msg}")?,
        percent: ProgressStyle::with_template("{prefix} {bar:40.cyan/blue} {pos:>3}% {wide_msg}")?,
    })
}

async fn render_progress(
    mut rx: broadcast::Receiver<EngineEvent>,
    job: JobId,
    titles: HashMap<ResourceId, String>,
    msgs: &'static Messages,
    sty: Styles,
) {
    let mp = MultiProgress::new();
    let mut bars: HashMap<ResourceId, ProgressBar> = HashMap::new();

    let mut bar_for = |id: &ResourceId, mp: &MultiProgress| -> ProgressBar {
        bars.entry(id.clone())
            .or_insert_with(|| {
                let pb = mp.add(ProgressBar::new_spinner());
                pb.set_style(sty.spinner.clone());
                pb.set_prefix(format!("[{}]", titles.get(id).map(String::as_str).unwrap_or(id.as_str())));
                pb.enable_steady_tick(std::time::Duration::from_millis(120));
                pb
            })
            .clone()
    };

    loop {
        let evt = match rx.recv().await {
            Ok(e) => e,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match evt {
            EngineEvent::DownloadStarted { resource_id, attempt } => {
                let pb = bar_for(&resource_id, &mp);
                pb.set_message(format!("#{attempt}"));
            }
            EngineEvent::Progress { resource_id, fraction, downloaded, total } => {
                let pb = bar_for(&resource_id, &mp);
                match (total, fraction) {
                    (Some(t), _) => {
                        if pb.length() != Some(t) {
                            pb.set_style(sty.bytes.clone());
                            pb.set_length(t);
                        }
                        pb.set_position(downloaded.min(t));
                    }
                    (None, Some(f)) => {
                        if pb.length() != Some(100) {
                            pb.set_style(sty.percent.clone());
                            pb.set_length(100);
                        }
                        pb.set_position((f * 100.0) as u64);
                    }
                    (None, None) => pb.set_message(fmt_bytes(downloaded)),
                }
            }
            EngineEvent::MergeStarted { resource_id, segments } => {
                bar_for(&resource_id, &mp).set_message(format!("{} {segments}", msgs.merging));
            }
            EngineEvent::Retrying { resource_id, attempt, delay, reason } => {
                bar_for(&resource_id, &mp).set_message(format!("{} #{} in {:.1}s: {reason}", msgs.retrying, attempt + 1, delay.as_secs_f64()));
            }
            EngineEvent::Paused { resource_id } => bar_for(&resource_id, &mp).set_message(msgs.paused),
            EngineEvent::Resumed { resource_id } => bar_for(&resource_id, &mp).set_message(msgs.resumed),
            EngineEvent::Completed { resource_id, path } => {
                bar_for(&resource_id, &mp).finish_with_message(format!("{} -> {}", msgs.status_done, path.display()));
            }
            EngineEvent::Failed { resource_id, kind, reason } => {
                bar_for(&resource_id, &mp).abandon_with_message(format!("{} [{kind}] {reason}", msgs.status_failed));
            }
            EngineEvent::Cancelled { resource_id } => {
                bar_for(&resource_id, &mp).abandon_with_message(msgs.status_cancelled);
            }
            EngineEvent::PoolRestarted { generation } => {
                let _ = mp.println(format!("{} {generation}", msgs.pool_restarted));
            }
            EngineEvent::BatchFinished { job_id, .. } if job_id == job => break,
            _ => {}
        }
    }
}

fn short_locator(locator: &SourceLocator) -> String {
    match locator {
        SourceLocator::Url(u) => u.clone(),
        SourceLocator::Inline(p) => format!("data:{} ({} chars)", p.media_type, p.data.len()),
    }
}

fn fmt_bytes(n: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let f = n as f64;
    if f >= GB {
        format!("{:.2}GiB", f / GB)
    } else if f >= MB {
        format!("{:.2}MiB", f / MB)
    } else if f >= KB {
        format!("{:.2}KiB", f / KB)
    } else {
        format!("{}B", n)
    }
}
