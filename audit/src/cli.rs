//! CLI command implementations.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use factory::core::types::Outcome;
use factory::io::audit_log::read_audit_log;
use factory::io::config::{ArtifactPaths, load_config};
use factory::io::init::FactoryPaths;
use tracing::debug;

use crate::report::aggregate;
use crate::uniqueness::{load_dataset, uniqueness};

const TOP_REASONS: usize = 10;

/// Artifact locations from the project config under `root`.
fn artifact_paths(root: &Path) -> Result<ArtifactPaths> {
    let config = load_config(&FactoryPaths::new(root).config_path).context("load config")?;
    Ok(config.artifact_paths(root))
}

/// Summarize an audit log; defaults to the project's configured log.
pub fn report_audit(root: &Path, path: Option<PathBuf>) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => artifact_paths(root)?.audit_log,
    };
    let records = read_audit_log(&path)?;
    debug!(records = records.len(), path = %path.display(), "audit log loaded");
    let report = aggregate(&records);

    println!("report: path={} records={}", path.display(), report.total);
    for outcome in Outcome::ALL {
        println!("report: {}={}", outcome, report.outcomes.get(outcome));
    }
    for (primitive, tally) in &report.per_primitive {
        println!(
            "report: primitive {} {}/{} ({:.1}%)",
            primitive,
            tally.success,
            tally.attempted,
            tally.success_rate() * 100.0
        );
    }
    for (technique, tally) in &report.per_technique {
        println!(
            "report: technique {} {}/{} ({:.1}%)",
            technique,
            tally.success,
            tally.attempted,
            tally.success_rate() * 100.0
        );
    }
    for (reason, count) in report.top_lab_reasons(TOP_REASONS) {
        println!("report: lab_failure {} {}", count, reason);
    }
    Ok(())
}

/// Report duplicate prompts; defaults to the project's configured dataset.
pub fn report_uniqueness(root: &Path, dataset: Option<PathBuf>) -> Result<()> {
    let path = match dataset {
        Some(path) => path,
        None => artifact_paths(root)?.dataset,
    };
    let records = load_dataset(&path)?;
    let report = uniqueness(&records);

    println!(
        "uniqueness: total={} unique={} duplicated={} ratio={:.3}",
        report.total,
        report.unique,
        report.duplicated.len(),
        report.unique_ratio()
    );
    for (prompt, count) in &report.duplicated {
        println!("uniqueness: duplicate {} {}", count, prompt);
    }
    Ok(())
}
