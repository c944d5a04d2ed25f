//! Progress report for `factory status`.

use std::path::Path;

use anyhow::{Context, Result};

use crate::core::jobs::JobSpace;
use crate::core::recipes::generate_recipes;
use crate::core::record::RecordBuilder;
use crate::core::types::Outcome;
use crate::factory::{OutcomeCounts, reconcile_audit};
use crate::io::audit_log::read_audit_log;
use crate::io::config::FactoryConfig;
use crate::io::primitives::load_primitives;
use crate::io::state_store::{StatePaths, load_state};

/// Snapshot of a dataset's progress through its job space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub primitives: usize,
    pub dropped_primitives: usize,
    pub recipes: usize,
    pub jobs_total: usize,
    /// Jobs of the current space already attempted.
    pub jobs_completed: usize,
    pub accepted: usize,
    /// Outcome tallies over the whole audit log.
    pub audit: OutcomeCounts,
}

impl StatusReport {
    pub fn jobs_remaining(&self) -> usize {
        self.jobs_total.saturating_sub(self.jobs_completed)
    }
}

/// Read inputs and checkpoints without touching the lab session.
pub fn status(root: &Path, config: &FactoryConfig) -> Result<StatusReport> {
    let paths = config.artifact_paths(root);
    let library = load_primitives(&paths.primitives, config.require_telemetry)?;
    let recipes = generate_recipes(&config.recipes).context("generate recipes")?;
    let mut state = load_state(&StatePaths {
        dataset: paths.dataset.clone(),
        completed: paths.completed.clone(),
    })
    .context("load checkpoint")?;
    let audit_records = read_audit_log(&paths.audit_log)?;
    let builder = RecordBuilder::new()?;
    reconcile_audit(&audit_records, &mut state, &library.primitives, &builder);

    let space = JobSpace::new(&library.primitives, &recipes);
    let jobs_completed = space
        .iter()
        .filter(|job| state.completed.contains(&job.key()))
        .count();

    let mut audit = OutcomeCounts::default();
    for record in &audit_records {
        audit.record(record.status);
    }

    Ok(StatusReport {
        primitives: library.primitives.len(),
        dropped_primitives: library.dropped.len(),
        recipes: recipes.len(),
        jobs_total: space.len(),
        jobs_completed,
        accepted: state.records.len(),
        audit,
    })
}

/// Render a report as `key: value` lines.
pub fn render_status(report: &StatusReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "primitives: {} ({} dropped)\n",
        report.primitives, report.dropped_primitives
    ));
    out.push_str(&format!("recipes: {}\n", report.recipes));
    out.push_str(&format!(
        "jobs: {} total, {} completed, {} remaining\n",
        report.jobs_total,
        report.jobs_completed,
        report.jobs_remaining()
    ));
    out.push_str(&format!("accepted: {}\n", report.accepted));
    for outcome in Outcome::ALL {
        out.push_str(&format!("{outcome}: {}\n", report.audit.get(outcome)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FactoryFixture, primitive};

    #[test]
    fn fresh_project_has_everything_remaining() {
        let fixture = FactoryFixture::new(&[primitive("P1", "whoami")]).expect("fixture");
        let report = status(fixture.root(), &fixture.config).expect("status");
        assert_eq!(report.primitives, 1);
        assert_eq!(report.jobs_total, report.recipes);
        assert_eq!(report.jobs_completed, 0);
        assert_eq!(report.jobs_remaining(), report.jobs_total);
        assert_eq!(report.audit.total(), 0);
    }

    /// Verifies jobs logged after the last checkpoint count as completed, as a run would treat them.
    #[test]
    fn audit_lines_past_checkpoint_count_as_completed() {
        use crate::core::types::{JobKey, Recipe};
        use crate::io::audit_log::{AuditLog, audit_record};

        let fixture = FactoryFixture::new(&[primitive("P1", "whoami"), primitive("P2", "hostname")])
            .expect("fixture");
        {
            let mut log = AuditLog::open(&fixture.paths().audit_log).expect("open audit log");
            log.append(&audit_record(
                &JobKey::new("P1", Recipe::empty()),
                Outcome::FailureLab,
                "exit code 1",
                100,
            ))
            .expect("append");
            log.append(
                &audit_record(&JobKey::new("P2", Recipe::empty()), Outcome::Success, "", 100)
                    .with_prompt("hostname"),
            )
            .expect("append");
        }

        let report = status(fixture.root(), &fixture.config).expect("status");
        assert_eq!(report.jobs_completed, 2);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.audit.total(), 2);
    }

    #[test]
    fn renders_every_outcome() {
        let fixture = FactoryFixture::new(&[primitive("P1", "whoami")]).expect("fixture");
        let report = status(fixture.root(), &fixture.config).expect("status");
        let rendered = render_status(&report);
        for outcome in Outcome::ALL {
            assert!(rendered.contains(&format!("{outcome}: 0")));
        }
    }
}
