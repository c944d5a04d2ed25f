//! Test doubles and fixtures for the job loop.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::core::recipes::{RecipeConfig, TechniqueSpec};
use crate::core::types::{Labels, Primitive, TelemetryRule};
use crate::io::config::{ArtifactPaths, FactoryConfig};
use crate::io::engine::{EngineError, TechniqueEngine};
use crate::io::session::{ConnectError, RemoteSession, RunError, RunOutput, SessionState};

/// Usable primitive with one telemetry rule.
pub fn primitive(id: &str, command: &str) -> Primitive {
    Primitive {
        id: id.to_string(),
        command: command.to_string(),
        labels: Labels {
            intent: vec!["Discovery".to_string()],
            mitre_ttps: vec!["T1033".to_string()],
            telemetry_rules: vec![TelemetryRule {
                source: "Sysmon".to_string(),
                event_id: 1,
                details: format!("Process Create: {command}"),
            }],
        },
    }
}

/// Recipe config over plain technique names, no pruning beyond `max_length`.
pub fn recipe_config(max_length: usize, techniques: &[&str]) -> RecipeConfig {
    RecipeConfig {
        max_length,
        exclusive: Vec::new(),
        techniques: techniques
            .iter()
            .map(|name| TechniqueSpec::new(name, 1, false))
            .collect(),
    }
}

/// Scripted behavior of one technique.
#[derive(Debug, Clone)]
pub enum EngineStep {
    /// Append `|<technique>` to the input.
    Suffix,
    /// Replace the input with a fixed string.
    Output(String),
    Fail(EngineError),
}

/// Engine that returns predetermined results without spawning processes.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    steps: BTreeMap<String, EngineStep>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step(mut self, technique: &str, step: EngineStep) -> Self {
        self.steps.insert(technique.to_string(), step);
        self
    }

    /// Technique names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl TechniqueEngine for ScriptedEngine {
    fn apply(&self, command: &str, technique: &str) -> Result<String, EngineError> {
        self.calls.borrow_mut().push(technique.to_string());
        match self.steps.get(technique).unwrap_or(&EngineStep::Suffix) {
            EngineStep::Suffix => Ok(format!("{command}|{technique}")),
            EngineStep::Output(output) => Ok(output.clone()),
            EngineStep::Fail(err) => Err(err.clone()),
        }
    }
}

/// One call observed by [`RecordingSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Open,
    Run(String),
    Reset,
    Close,
}

/// Session double that records call order and replays scripted results.
///
/// Without a scripted result, `run` echoes the command with exit code zero.
#[derive(Debug)]
pub struct RecordingSession {
    pub calls: Vec<SessionCall>,
    results: VecDeque<Result<RunOutput, RunError>>,
    fail_open: bool,
    fail_reset: bool,
    state: SessionState,
}

impl Default for RecordingSession {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            results: VecDeque::new(),
            fail_open: false,
            fail_reset: false,
            state: SessionState::Closed,
        }
    }
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next `run` call.
    pub fn push_result(&mut self, result: Result<RunOutput, RunError>) {
        self.results.push_back(result);
    }

    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub fn failing_reset() -> Self {
        Self {
            fail_reset: true,
            ..Self::default()
        }
    }

    /// Commands passed to `run`, in order.
    pub fn runs(&self) -> Vec<&str> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                SessionCall::Run(command) => Some(command.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn reset_count(&self) -> usize {
        self.calls
            .iter()
            .filter(|call| **call == SessionCall::Reset)
            .count()
    }
}

/// Successful run output with the given stdout.
pub fn run_ok(stdout: &str) -> RunOutput {
    RunOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
        elapsed: Duration::from_millis(5),
    }
}

/// Failed run output with the given exit code and stderr.
pub fn run_failed(exit_code: i32, stderr: &str) -> RunOutput {
    RunOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code,
        elapsed: Duration::from_millis(5),
    }
}

impl RemoteSession for RecordingSession {
    fn open(&mut self) -> Result<(), ConnectError> {
        self.calls.push(SessionCall::Open);
        if self.fail_open {
            return Err(ConnectError::Handshake("lab host unreachable".to_string()));
        }
        self.state = SessionState::Open;
        Ok(())
    }

    fn run(&mut self, command: &str) -> Result<RunOutput, RunError> {
        self.calls.push(SessionCall::Run(command.to_string()));
        if self.state != SessionState::Open {
            return Err(RunError::NotOpen);
        }
        let result = self
            .results
            .pop_front()
            .unwrap_or_else(|| Ok(run_ok(command)));
        if matches!(result, Err(RunError::Timeout { .. } | RunError::Transport(_))) {
            self.state = SessionState::Dead;
        }
        result
    }

    fn reset(&mut self) -> Result<(), ConnectError> {
        self.calls.push(SessionCall::Reset);
        if self.fail_reset {
            self.state = SessionState::Dead;
            return Err(ConnectError::Timeout {
                after: Duration::from_secs(30),
            });
        }
        self.state = SessionState::Open;
        Ok(())
    }

    fn close(&mut self) {
        self.calls.push(SessionCall::Close);
        self.state = SessionState::Closed;
    }

    fn state(&self) -> SessionState {
        self.state
    }
}

/// Temporary project root with a primitive library and an in-memory config.
///
/// The default config yields only the empty recipe, so each primitive is one job.
pub struct FactoryFixture {
    temp: TempDir,
    pub config: FactoryConfig,
}

impl FactoryFixture {
    pub fn new(primitives: &[Primitive]) -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let config = FactoryConfig {
            recipes: recipe_config(0, &[]),
            ..FactoryConfig::default()
        };
        let fixture = Self { temp, config };
        fixture.write_primitives(primitives)?;
        Ok(fixture)
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> ArtifactPaths {
        self.config.artifact_paths(self.root())
    }

    pub fn write_primitives(&self, primitives: &[Primitive]) -> Result<()> {
        let path = self.paths().primitives;
        let mut buf = serde_json::to_string_pretty(primitives)?;
        buf.push('\n');
        fs::write(&path, buf).with_context(|| format!("write {}", path.display()))
    }
}
