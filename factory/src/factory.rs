//! Job loop for `factory run`.
//!
//! Phases: `Initializing → Running → Draining → Terminated`. Initializing
//! loads every input and opens the lab session; any failure there aborts
//! before a job is attempted. Running walks the job space in fixed order,
//! skipping jobs already in the completion set. Every attempted job ends in
//! exactly one [`Outcome`], one audit line, and one completion entry. Per-job
//! failures never stop the loop; only a failed session rebuild or persistent
//! audit/checkpoint I/O failure does.

use std::fmt;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, warn};

use crate::core::classifier::{LabVerdict, classify_exit};
use crate::core::jobs::{Job, JobSpace, find_exclusion};
use crate::core::recipes::generate_recipes;
use crate::core::record::RecordBuilder;
use crate::core::types::{AuditRecord, CompletionSet, DatasetRecord, JobKey, Outcome, Primitive, Recipe};
use crate::io::audit_log::{AuditLog, audit_record, read_audit_log};
use crate::io::config::{ArtifactPaths, FactoryConfig};
use crate::io::engine::{TechniqueEngine, apply_recipe};
use crate::io::primitives::load_primitives;
use crate::io::session::{RemoteSession, SessionState, check_command_length};
use crate::io::shutdown::ShutdownFlag;
use crate::io::state_store::{JobState, StatePaths, load_state, save_state};

/// Orchestrator phase, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Running,
    Draining,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Initializing => "initializing",
            Phase::Running => "running",
            Phase::Draining => "draining",
            Phase::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Reason why `run_factory` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStop {
    /// Every job in the space has been attempted.
    Exhausted,
    /// A shutdown signal was observed at a job boundary.
    Interrupted,
    /// The `--limit` attempt cap was reached.
    Limit,
}

/// Per-outcome tallies for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub success: u64,
    pub skipped_exclusion: u64,
    pub failure_engine: u64,
    pub failure_lab: u64,
    pub failure_validation: u64,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: Outcome) {
        *self.slot(outcome) += 1;
    }

    pub fn get(&self, outcome: Outcome) -> u64 {
        match outcome {
            Outcome::Success => self.success,
            Outcome::SkippedExclusion => self.skipped_exclusion,
            Outcome::FailureEngine => self.failure_engine,
            Outcome::FailureLab => self.failure_lab,
            Outcome::FailureValidation => self.failure_validation,
        }
    }

    pub fn total(&self) -> u64 {
        Outcome::ALL.iter().map(|outcome| self.get(*outcome)).sum()
    }

    fn slot(&mut self, outcome: Outcome) -> &mut u64 {
        match outcome {
            Outcome::Success => &mut self.success,
            Outcome::SkippedExclusion => &mut self.skipped_exclusion,
            Outcome::FailureEngine => &mut self.failure_engine,
            Outcome::FailureLab => &mut self.failure_lab,
            Outcome::FailureValidation => &mut self.failure_validation,
        }
    }
}

/// Summary of a `run_factory` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub stop: RunStop,
    /// Jobs attempted by this invocation.
    pub attempted: u64,
    /// Jobs skipped because an earlier run already attempted them.
    pub skipped_completed: u64,
    pub counts: OutcomeCounts,
    /// Accepted records in the dataset after the final checkpoint.
    pub accepted_total: usize,
    pub resets: u64,
}

/// Per-job report passed to the `on_job` callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub key: JobKey,
    pub outcome: Outcome,
    pub details: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop after attempting this many jobs.
    pub limit: Option<u64>,
}

/// Inputs loaded during Initializing.
struct Inputs {
    primitives: Vec<Primitive>,
    recipes: Vec<Recipe>,
    state: JobState,
    audit: AuditLog,
    builder: RecordBuilder,
    state_paths: StatePaths,
}

/// Run every unattempted job under `root`.
///
/// `engine` and `session` are injected so tests can substitute doubles; the
/// session must be closed on entry and is closed again on return.
pub fn run_factory<E, S, F>(
    root: &Path,
    config: &FactoryConfig,
    engine: &E,
    session: &mut S,
    shutdown: &ShutdownFlag,
    options: &RunOptions,
    on_job: F,
) -> Result<RunSummary>
where
    E: TechniqueEngine + ?Sized,
    S: RemoteSession + ?Sized,
    F: FnMut(&JobReport),
{
    info!(phase = %Phase::Initializing, root = %root.display(), "factory phase");
    let paths = config.artifact_paths(root);
    let inputs = initialize(config, &paths)?;
    session.open().context("open lab session")?;

    let mut job_loop = JobLoop {
        config,
        engine,
        session,
        builder: inputs.builder,
        audit: inputs.audit,
        state_paths: inputs.state_paths,
        records: inputs.state.records,
        completed: inputs.state.completed,
        jobs_since_reset: 0,
        since_checkpoint: 0,
        counts: OutcomeCounts::default(),
        resets: 0,
    };
    let space = JobSpace::new(&inputs.primitives, &inputs.recipes);
    info!(
        phase = %Phase::Running,
        jobs = space.len(),
        completed = job_loop.completed.len(),
        "factory phase"
    );
    let result = job_loop.run(space, shutdown, options, on_job);

    info!(phase = %Phase::Draining, "factory phase");
    let (stop, skipped_completed) = match result {
        Ok(progress) => progress,
        Err(err) => {
            if let Err(checkpoint_err) = job_loop.checkpoint() {
                error!(err = %format!("{checkpoint_err:#}"), "final checkpoint after fatal error failed");
            }
            job_loop.session.close();
            info!(phase = %Phase::Terminated, "factory phase");
            return Err(err);
        }
    };
    let checkpoint = job_loop.checkpoint();
    job_loop.session.close();
    checkpoint.context("final checkpoint")?;

    let summary = RunSummary {
        stop,
        attempted: job_loop.counts.total(),
        skipped_completed,
        counts: job_loop.counts,
        accepted_total: job_loop.records.len(),
        resets: job_loop.resets,
    };
    info!(
        phase = %Phase::Terminated,
        stop = ?summary.stop,
        attempted = summary.attempted,
        accepted_total = summary.accepted_total,
        resets = summary.resets,
        "factory phase"
    );
    Ok(summary)
}

fn initialize(config: &FactoryConfig, paths: &ArtifactPaths) -> Result<Inputs> {
    config.validate()?;
    let library = load_primitives(&paths.primitives, config.require_telemetry)?;
    if !library.dropped.is_empty() {
        warn!(
            dropped = library.dropped.len(),
            "primitives without telemetry rules excluded from the job space"
        );
    }
    let recipes = generate_recipes(&config.recipes).context("generate recipes")?;
    debug!(recipes = recipes.len(), "recipes generated");

    let state_paths = StatePaths {
        dataset: paths.dataset.clone(),
        completed: paths.completed.clone(),
    };
    let mut state = load_state(&state_paths).context("load checkpoint")?;
    let builder = RecordBuilder::new().context("compile dataset record schema")?;
    let audit_records = read_audit_log(&paths.audit_log)?;
    let recovery = reconcile_audit(&audit_records, &mut state, &library.primitives, &builder);
    if recovery != AuditRecovery::default() {
        warn!(
            restored = recovery.restored,
            rebuilt = recovery.rebuilt,
            retried = recovery.retried,
            "audit log was ahead of the last checkpoint"
        );
    }

    let audit = AuditLog::open(&paths.audit_log)?;
    Ok(Inputs {
        primitives: library.primitives,
        recipes,
        state,
        audit,
        builder,
        state_paths,
    })
}

/// Jobs recovered from audit lines written after the last checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditRecovery {
    /// Non-success outcomes marked complete.
    pub restored: usize,
    /// Successes whose dataset record was rebuilt from the logged prompt.
    pub rebuilt: usize,
    /// Successes that could not be rebuilt and will be attempted again.
    pub retried: usize,
}

/// Fold durable outcomes from the audit log into `state`.
///
/// The audit line is written before the checkpoint, so a crash can leave jobs
/// that were attempted but not yet checkpointed. Failures carry no record and
/// are marked complete. A success carries its transformed command, which is
/// enough to rebuild the record without touching the lab again. Only a success
/// with no prompt, or whose primitive is gone, is left for re-attempt.
pub fn reconcile_audit(
    audit: &[AuditRecord],
    state: &mut JobState,
    primitives: &[Primitive],
    builder: &RecordBuilder,
) -> AuditRecovery {
    let mut recovery = AuditRecovery::default();
    for record in audit {
        let key = record.job_key();
        if state.completed.contains(&key) {
            continue;
        }
        if !record.status.is_success() {
            state.completed.insert(key);
            recovery.restored += 1;
            continue;
        }
        let primitive = primitives.iter().find(|p| p.id == record.primitive_id);
        let (Some(primitive), Some(prompt)) = (primitive, record.prompt.as_deref()) else {
            warn!(job = %key, "success in audit log cannot be rebuilt, attempting again");
            recovery.retried += 1;
            continue;
        };
        match builder.build(primitive, prompt, key.clone()) {
            Ok(rebuilt) => {
                state.records.push(rebuilt);
                state.completed.insert(key);
                recovery.rebuilt += 1;
            }
            Err(err) => {
                warn!(job = %key, err = %err, "rebuilding record from audit log failed, attempting again");
                recovery.retried += 1;
            }
        }
    }
    recovery
}

struct JobLoop<'a, E: ?Sized, S: ?Sized> {
    config: &'a FactoryConfig,
    engine: &'a E,
    session: &'a mut S,
    builder: RecordBuilder,
    audit: AuditLog,
    state_paths: StatePaths,
    records: Vec<DatasetRecord>,
    completed: CompletionSet,
    jobs_since_reset: u64,
    since_checkpoint: u64,
    counts: OutcomeCounts,
    resets: u64,
}

/// Outcome of one job before it is made durable.
struct Attempt {
    outcome: Outcome,
    details: String,
    record: Option<DatasetRecord>,
}

impl Attempt {
    fn failed(outcome: Outcome, details: impl Into<String>) -> Self {
        Self {
            outcome,
            details: details.into(),
            record: None,
        }
    }
}

impl<E, S> JobLoop<'_, E, S>
where
    E: TechniqueEngine + ?Sized,
    S: RemoteSession + ?Sized,
{
    fn run<F: FnMut(&JobReport)>(
        &mut self,
        space: JobSpace<'_>,
        shutdown: &ShutdownFlag,
        options: &RunOptions,
        mut on_job: F,
    ) -> Result<(RunStop, u64)> {
        let mut skipped_completed = 0u64;
        for job in space.iter() {
            if shutdown.is_requested() {
                info!("shutdown requested, draining");
                return Ok((RunStop::Interrupted, skipped_completed));
            }
            if options
                .limit
                .is_some_and(|limit| self.counts.total() >= limit)
            {
                return Ok((RunStop::Limit, skipped_completed));
            }
            let key = job.key();
            if self.completed.contains(&key) {
                skipped_completed += 1;
                continue;
            }

            let attempt = self.attempt(&job)?;
            let report = JobReport {
                key,
                outcome: attempt.outcome,
                details: attempt.details.clone(),
            };
            self.commit(&report.key, attempt)?;
            on_job(&report);
        }
        Ok((RunStop::Exhausted, skipped_completed))
    }

    /// Drive one job to an outcome. Errors are run-fatal.
    fn attempt(&mut self, job: &Job<'_>) -> Result<Attempt> {
        if let Some(rule) = find_exclusion(&self.config.exclusions, job) {
            return Ok(Attempt::failed(Outcome::SkippedExclusion, rule.describe()));
        }

        let started = Instant::now();
        let transformed = match apply_recipe(
            self.engine,
            &job.primitive.command,
            job.recipe,
            started,
            self.config.job_timeout(),
        ) {
            Ok(transformed) => transformed,
            Err(err) => return Ok(Attempt::failed(Outcome::FailureEngine, err.to_string())),
        };

        self.ensure_session()?;

        if let Err(err) = check_command_length(&transformed, self.config.max_command_bytes) {
            return Ok(Attempt::failed(Outcome::FailureLab, err.to_string()));
        }
        let output = match self.session.run(&transformed) {
            Ok(output) => output,
            Err(err) => return Ok(Attempt::failed(Outcome::FailureLab, err.to_string())),
        };
        if let LabVerdict::Rejected(details) = classify_exit(output.exit_code, &output.stderr) {
            return Ok(Attempt::failed(Outcome::FailureLab, details));
        }

        match self.builder.build(job.primitive, &transformed, job.key()) {
            Ok(record) => Ok(Attempt {
                outcome: Outcome::Success,
                details: String::new(),
                record: Some(record),
            }),
            Err(err) => {
                error!(job = %job.key(), err = %err, "dataset record failed validation");
                Ok(Attempt::failed(Outcome::FailureValidation, err.to_string()))
            }
        }
    }

    /// Rebuild the session when it is due for a prophylactic reset or not usable.
    fn ensure_session(&mut self) -> Result<()> {
        let state = self.session.state();
        let due = self.jobs_since_reset >= self.config.reset_every;
        if !due && state == SessionState::Open {
            return Ok(());
        }
        info!(
            jobs_since_reset = self.jobs_since_reset,
            state = ?state,
            "resetting lab session"
        );
        self.session
            .reset()
            .map_err(|err| anyhow!("reset lab session: {err}"))?;
        self.resets += 1;
        self.jobs_since_reset = 0;
        Ok(())
    }

    /// Make an outcome durable: audit line, completion entry, record, checkpoint cadence.
    fn commit(&mut self, key: &JobKey, attempt: Attempt) -> Result<()> {
        let mut line = audit_record(
            key,
            attempt.outcome,
            &attempt.details,
            self.config.audit_detail_limit,
        );
        if let Some(record) = &attempt.record {
            line = line.with_prompt(record.prompt.clone());
        }
        let audit = &mut self.audit;
        retry_once("append audit record", || audit.append(&line))?;

        self.completed.insert(key.clone());
        if let Some(record) = attempt.record {
            self.records.push(record);
        }
        self.counts.record(attempt.outcome);
        debug!(job = %key, outcome = %attempt.outcome, "job committed");

        self.jobs_since_reset += 1;
        self.since_checkpoint += 1;
        if self.since_checkpoint >= self.config.checkpoint_every {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<()> {
        let (records, completed, paths) = (&self.records, &self.completed, &self.state_paths);
        retry_once("write checkpoint", || save_state(records, completed, paths))?;
        self.since_checkpoint = 0;
        Ok(())
    }
}

/// Run `op`, retrying once on failure. A second failure is returned.
fn retry_once<T>(what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    match op() {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "{what} failed, retrying once");
            op().with_context(|| format!("{what} failed twice"))
        }
    }
}
