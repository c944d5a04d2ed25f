//! Obfuscated command corpus factory.
//!
//! Combines a primitive library with generated obfuscation recipes, executes
//! every job on the lab host, and keeps only the commands that still run.
//! Progress is checkpointed under the project root so `factory run` can be
//! interrupted and resumed.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use factory::core::recipes::generate_recipes;
use factory::exit_codes;
use factory::factory::{JobReport, RunOptions, RunStop, RunSummary, run_factory};
use factory::io::config::load_config;
use factory::io::engine::ProcessEngine;
use factory::io::init::{FactoryPaths, InitOptions, init_factory};
use factory::io::session::ShellSession;
use factory::io::shutdown::install_signal_handlers;
use factory::logging;
use factory::status::{render_status, status};

#[derive(Parser)]
#[command(
    name = "factory",
    version,
    about = "Resumable obfuscated command corpus factory"
)]
struct Cli {
    /// Project root containing `.factory/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.factory/config.toml` and a sample primitive library.
    Init {
        /// Overwrite the existing configuration.
        #[arg(short, long)]
        force: bool,
    },
    /// Print every generated recipe in job order.
    Recipes,
    /// Show job space size, checkpoint progress, and audit tallies.
    Status,
    /// Attempt every job not yet completed.
    Run {
        /// Stop after attempting this many jobs.
        #[arg(long)]
        limit: Option<u64>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.root, force),
        Command::Recipes => cmd_recipes(&cli.root),
        Command::Status => cmd_status(&cli.root),
        Command::Run { limit } => cmd_run(&cli.root, limit),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_factory(root, &InitOptions { force })?;
    println!("initialized {}", paths.config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_recipes(root: &Path) -> Result<i32> {
    let config = load_config(&FactoryPaths::new(root).config_path)?;
    let recipes = generate_recipes(&config.recipes).context("generate recipes")?;
    for recipe in &recipes {
        println!("{recipe}");
    }
    Ok(exit_codes::OK)
}

fn cmd_status(root: &Path) -> Result<i32> {
    let config = load_config(&FactoryPaths::new(root).config_path)?;
    let report = status(root, &config)?;
    print!("{}", render_status(&report));
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, limit: Option<u64>) -> Result<i32> {
    let config = load_config(&FactoryPaths::new(root).config_path)?;
    let engine = ProcessEngine::new(&config.engine).context("configure technique engine")?;
    let mut session = ShellSession::new(config.session.clone()).context("configure lab session")?;
    let shutdown = install_signal_handlers()?;

    let summary = run_factory(
        root,
        &config,
        &engine,
        &mut session,
        &shutdown,
        &RunOptions { limit },
        print_job,
    )?;
    print_summary(&summary);
    match summary.stop {
        RunStop::Interrupted => Ok(exit_codes::INTERRUPTED),
        RunStop::Exhausted | RunStop::Limit => Ok(exit_codes::OK),
    }
}

fn print_job(report: &JobReport) {
    if report.details.is_empty() {
        println!("{:<18} {}", report.outcome, report.key);
    } else {
        let first_line = report.details.lines().next().unwrap_or_default();
        println!("{:<18} {}: {}", report.outcome, report.key, first_line);
    }
}

fn print_summary(summary: &RunSummary) {
    println!(
        "stop: {:?}, attempted: {}, already completed: {}, accepted total: {}, resets: {}",
        summary.stop,
        summary.attempted,
        summary.skipped_completed,
        summary.accepted_total,
        summary.resets
    );
    println!(
        "success: {}, skipped_exclusion: {}, failure_engine: {}, failure_lab: {}, failure_validation: {}",
        summary.counts.success,
        summary.counts.skipped_exclusion,
        summary.counts.failure_engine,
        summary.counts.failure_lab,
        summary.counts.failure_validation
    );
}
