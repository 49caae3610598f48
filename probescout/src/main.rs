//! `probescout`: goal-driven nmap reconnaissance from the command line.
//!
//! Live scanner output and `[step N]` log lines go to stderr; the final report
//! (or JSON summary) goes to stdout.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use probescout::core::goal::{Goal, default_goal, goal_by_id, list_goals};
use probescout::core::target::validate_target;
use probescout::exit_codes;
use probescout::io::config::{DEFAULT_CONFIG_FILE, ScoutConfig, load_config, write_config};
use probescout::io::engine::NmapScanner;
use probescout::io::oracle::OpenAiOracle;
use probescout::io::preflight::preflight;
use probescout::logging;
use probescout::orchestrator::{LoopSettings, LoopStop, run_scan};
use probescout::report::render_report;
use probescout::session::{ScanEvent, SessionHandle};

#[derive(Parser)]
#[command(
    name = "probescout",
    version,
    about = "Goal-driven nmap reconnaissance steered by a decision oracle"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file if missing.
    Init {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Run a scan until the goal is met, the oracle finishes, or a budget runs out.
    Scan {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Single hostname or IPv4 address (overrides `target` in the config).
        #[arg(short, long)]
        target: Option<String>,
        /// Goal id (see `probescout goals`).
        #[arg(short, long)]
        goal: Option<String>,
        /// Decide actions without running the scanner.
        #[arg(long)]
        dry_run: bool,
        /// Print the JSON summary instead of the text report.
        #[arg(long)]
        json: bool,
    },
    /// List the available goals.
    Goals {
        #[arg(long)]
        json: bool,
    },
    /// Run pre-flight checks only.
    Check {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

fn main() {
    logging::init("warn");
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { config, force } => cmd_init(&config, force),
        Command::Scan {
            config,
            target,
            goal,
            dry_run,
            json,
        } => cmd_scan(&config, target, goal, dry_run, json),
        Command::Goals { json } => cmd_goals(json),
        Command::Check { config } => cmd_check(&config),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &ScoutConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_goals(json: bool) -> Result<i32> {
    let goals = list_goals();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&goals).context("serialize goals")?
        );
        return Ok(exit_codes::OK);
    }
    for goal in goals {
        println!("{:<20} {}", goal.id, goal.label);
        println!("{:<20} {}", "", goal.description);
    }
    Ok(exit_codes::OK)
}

fn cmd_check(path: &Path) -> Result<i32> {
    let config = load_config(path)?;
    let report = preflight(&config)?;
    match report.scanner_version {
        Some(version) => println!("ok: {version}"),
        None => println!("ok (dry run)"),
    }
    Ok(exit_codes::OK)
}

fn resolve_goal(requested: Option<&str>) -> Result<&'static Goal> {
    match requested {
        None => Ok(default_goal()),
        Some(id) => goal_by_id(id).ok_or_else(|| {
            let known: Vec<&str> = list_goals().into_iter().map(|goal| goal.id).collect();
            anyhow!("unknown goal {id:?}; expected one of {}", known.join(", "))
        }),
    }
}

fn cmd_scan(
    path: &Path,
    target: Option<String>,
    goal: Option<String>,
    dry_run: bool,
    json: bool,
) -> Result<i32> {
    let mut config = load_config(path)?;
    if dry_run {
        config.scanner.dry_run = true;
    }
    let target = target
        .or_else(|| config.target.clone())
        .ok_or_else(|| anyhow!("no target: pass --target or set target in {}", path.display()))?;
    let target = validate_target(&target).context("invalid target")?;
    let goal = resolve_goal(goal.as_deref().or(config.goal.as_deref()))?;

    preflight(&config).context("pre-flight")?;
    let oracle = OpenAiOracle::from_config(&config.oracle).context("oracle setup")?;
    let scanner = NmapScanner {
        grace: config.grace(),
    };
    let settings = LoopSettings::from_config(&config);

    let (session, events) = SessionHandle::new(
        Uuid::new_v4().to_string(),
        target,
        goal,
        config.budget.max_iterations,
    );
    let printer = thread::spawn(move || {
        let mut stderr = std::io::stderr();
        for event in events {
            let line = match event {
                ScanEvent::Log { line } | ScanEvent::Output { line } => line,
                ScanEvent::Progress(_) | ScanEvent::Completed { .. } => continue,
            };
            let _ = writeln!(stderr, "{line}");
        }
    });

    let outcome = run_scan(&session, &settings, &oracle, &scanner);
    let summary = session.snapshot();
    drop(session);
    let _ = printer.join();
    let outcome = outcome?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serialize summary")?
        );
    } else {
        print!("{}", render_report(&summary));
    }

    Ok(match outcome.stop {
        LoopStop::Finished(_) => exit_codes::OK,
        LoopStop::Aborted(_) => exit_codes::ABORTED,
    })
}
