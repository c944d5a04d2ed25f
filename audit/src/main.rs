mod cli;
mod report;
mod uniqueness;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "audit", version, about = "Failure analysis for factory output")]
struct Cli {
    /// Project root containing `.factory/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Totals, per-primitive and per-technique rates, and top lab failures.
    Report {
        /// Audit log to read instead of the configured one.
        path: Option<PathBuf>,
    },
    /// Count duplicate prompts in the accepted dataset.
    Uniqueness {
        /// Dataset to read instead of the configured one.
        dataset: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    factory::logging::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Report { path } => cli::report_audit(&cli.root, path),
        Command::Uniqueness { dataset } => cli::report_uniqueness(&cli.root, dataset),
    }
}
