mod cli;

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::Path;
use tracing::{info, warn};

use cli::{Cli, Command};
use warden::config::WardenConfig;
use warden::doctor::{
    CheckContext, CheckResult, CheckStatus, Doctor, FixOutcome, OrphanProcessCheck,
    OrphanSessionCheck, SystemProcessLister,
};
use warden::events::{EventSink, JsonlFeed, NullSink};
use warden::names::SessionName;
use warden::proc::ProcFs;
use warden::proc::signal::KernelSignaller;
use warden::reap::{Reaper, ShutdownReport};
use warden::session::{AgentMatcher, Freshness, SessionController};
use warden::tmux::Tmux;

fn config_source_label(config_path: Option<&Path>) -> String {
    match config_path {
        Some(path) => path.display().to_string(),
        None => "(defaults, no .warden/config.toml found)".to_string(),
    }
}

fn list_label(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<24} {value}\n"));
}

fn render_config_human(config: &WardenConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Agents\n");
    push_kv(&mut output, "names", list_label(&config.agents.names));
    push_kv(&mut output, "defaults", list_label(&config.agents.defaults));
    push_kv(
        &mut output,
        "version_pattern",
        &config.agents.version_pattern,
    );
    output.push('\n');

    output.push_str("Orphans\n");
    push_kv(&mut output, "session_prefix", &config.orphans.session_prefix);
    push_kv(
        &mut output,
        "max_ancestry_depth",
        config.orphans.max_ancestry_depth,
    );
    push_kv(&mut output, "runtime_pattern", &config.orphans.runtime_pattern);
    push_kv(&mut output, "exclude_pattern", &config.orphans.exclude_pattern);
    output.push('\n');

    output.push_str("Cleanup\n");
    push_kv(
        &mut output,
        "sigterm_grace",
        format!("{}ms", config.cleanup.sigterm_grace_millis),
    );
    push_kv(
        &mut output,
        "settle",
        format!("{}ms", config.cleanup.settle_millis),
    );
    push_kv(
        &mut output,
        "descendant_rescans",
        format!(
            "{} x {}ms",
            config.cleanup.descendant_rescan_attempts,
            config.cleanup.descendant_rescan_delay_millis
        ),
    );
    push_kv(
        &mut output,
        "daemon_patterns",
        list_label(&config.cleanup.daemon_patterns),
    );
    output.push('\n');

    output.push_str("Town\n");
    push_kv(&mut output, "mayor_session", &config.town.mayor_session);
    push_kv(&mut output, "deacon_session", &config.town.deacon_session);
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

fn render_config_json(config: &WardenConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    payload["source_path"] = serde_json::Value::String(config_source_label(config_path));
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

fn render_check(result: &CheckResult) -> String {
    let mut output = format!(
        "{} {}: {}\n",
        result.status.symbol(),
        result.name,
        result.message
    );
    for detail in &result.details {
        output.push_str(&format!("    {detail}\n"));
    }
    if let Some(hint) = &result.fix_hint {
        output.push_str(&format!("    → {hint}\n"));
    }
    output
}

fn render_fix(outcome: &FixOutcome) -> String {
    let report = &outcome.report;
    let verb = if report.dry_run { "would kill" } else { "killed" };
    let mut output = format!(
        "{}: {verb} {}, skipped {}, protected {}, vanished {}\n",
        outcome.check, report.killed, report.skipped, report.protected, report.vanished
    );
    for action in &report.actions {
        output.push_str(&format!("    {action}\n"));
    }
    for error in &report.errors {
        output.push_str(&format!("    error: {error}\n"));
    }
    output
}

fn render_shutdown(report: &ShutdownReport) -> String {
    let mut output = String::new();
    for outcome in &report.outcomes {
        if report.dry_run {
            output.push_str(&format!(
                "  {:<20} would stop {}\n",
                outcome.pattern, outcome.before
            ));
        } else {
            output.push_str(&format!(
                "  {:<20} stopped {}, remaining {}\n",
                outcome.pattern, outcome.killed, outcome.remaining
            ));
        }
    }
    output
}

fn freshness_label(freshness: Freshness) -> &'static str {
    match freshness {
        Freshness::AlreadyRunning => "agent already running",
        Freshness::Created => "created",
        Freshness::Recreated => "replaced zombie session",
    }
}

/// The town's event feed when recording, `NullSink` otherwise. An
/// unwritable feed must not stop the checks from reporting.
fn event_sink(town_root: &Path, record: bool) -> Box<dyn EventSink> {
    if !record {
        return Box::new(NullSink);
    }
    match JsonlFeed::for_town(town_root) {
        Ok(feed) => Box::new(feed),
        Err(e) => {
            warn!(
                error = %format!("{e:#}"),
                "event feed unavailable, session deaths will not be recorded"
            );
            Box::new(NullSink)
        }
    }
}

fn run_doctor(
    config: &WardenConfig,
    town_root: &Path,
    fix: bool,
    dry_run: bool,
) -> Result<()> {
    let events = event_sink(town_root, fix && !dry_run);
    let lister = SystemProcessLister::new(ProcFs::new(), Tmux::new(), &config.orphans)?;

    let mut doctor = Doctor::new()
        .with_check(Box::new(OrphanSessionCheck::new(
            Tmux::new(),
            events,
            config.town.clone(),
            config.orphans.session_prefix.clone(),
        )))
        .with_check(Box::new(OrphanProcessCheck::new(
            lister,
            KernelSignaller,
            config.orphans.max_ancestry_depth,
        )));

    let ctx = CheckContext {
        town_root: town_root.to_path_buf(),
        dry_run,
    };
    let results = doctor.run(&ctx);
    for result in &results {
        print!("{}", render_check(result));
    }

    if !fix {
        if results.iter().any(|r| r.status == CheckStatus::Error) {
            bail!("doctor found errors");
        }
        return Ok(());
    }

    println!();
    let outcomes = doctor.fix(&ctx, &results)?;
    if outcomes.is_empty() {
        println!("Nothing to fix.");
    }
    let mut failures = Vec::new();
    for outcome in outcomes {
        print!("{}", render_fix(&outcome));
        if let Err(err) = outcome.report.into_result(&outcome.check) {
            failures.push(err.to_string());
        }
    }
    if !failures.is_empty() {
        bail!("fix failed: {}", failures.join("; "));
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "warden=warn",
        0 => "warden=info",
        1 => "warden=debug",
        _ => "warden=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let town_root = match &cli.command {
        Command::Doctor {
            town: Some(town), ..
        } => town.clone(),
        _ => cwd,
    };
    let (config, config_path) = WardenConfig::load(&town_root)?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .warden/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Doctor { fix, dry_run, .. } => {
            run_doctor(&config, &town_root, fix, dry_run)?;
        }
        Command::Sessions => {
            let records = Tmux::new().list_session_records()?;
            if records.is_empty() {
                println!("No tmux sessions.");
            }
            for record in records {
                let address = SessionName::parse(&record.name)
                    .map(|name| name.to_address())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<32} {:<24} {:>3}w  {}",
                    record.name, address, record.windows, record.pane_command
                );
            }
        }
        Command::Ensure { name, dir } => {
            let controller = SessionController::new(Tmux::new(), KernelSignaller)
                .with_matcher(AgentMatcher::from_config(&config.agents)?)
                .with_cleanup(config.cleanup.clone());
            let freshness = controller.ensure_session_fresh(&name, dir.as_deref())?;
            println!("{name}: {}", freshness_label(freshness));
        }
        Command::AgentRunning { name, names } => {
            let controller = SessionController::new(Tmux::new(), KernelSignaller)
                .with_matcher(AgentMatcher::from_config(&config.agents)?);
            if !controller.is_agent_running(&name, &names) {
                println!("{name}: no agent running");
                std::process::exit(1);
            }
            println!("{name}: agent running");
        }
        Command::KillSession { name } => {
            let controller = SessionController::new(Tmux::new(), KernelSignaller)
                .with_cleanup(config.cleanup.clone());
            let report = controller.kill_session_with_processes(&name)?;
            println!(
                "{name}: killed (terminated {}, force-killed {})",
                report.terminated, report.force_killed
            );
            if report.remaining > 0 {
                warn!(session = %name, remaining = report.remaining, "processes survived SIGKILL");
            }
        }
        Command::StopDaemons { force, dry_run } => {
            let reaper = Reaper::new(ProcFs::new(), KernelSignaller, &config.cleanup);
            let report = reaper.stop_all(&config.cleanup.daemon_patterns, force, dry_run);
            print!("{}", render_shutdown(&report));
            report.into_result()?;
        }
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
        }
    }

    Ok(())
}
