//! Technique engine adapter.
//!
//! The [`TechniqueEngine`] trait decouples the job loop from the process that
//! actually performs an obfuscation technique. Tests use scripted engines that
//! return predetermined outputs without spawning processes.

use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use minijinja::{Environment, context};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::budget::remaining_budget;
use crate::core::types::Recipe;
use crate::io::config::EngineConfig;
use crate::io::process::run_with_timeout;
use crate::io::template::{check_template, command_env};

/// Prefix a technique prints on stdout to report a failure with exit code zero.
const ENGINE_ERROR_PREFIX: &str = "ENGINE_ERROR";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("technique {technique} timed out after {after:?}")]
    Timeout { technique: String, after: Duration },
    #[error("{message}")]
    Technique { technique: String, message: String },
    #[error("failed to start engine for {technique}: {message}")]
    Spawn { technique: String, message: String },
    #[error("technique {technique} produced no output")]
    EmptyOutput { technique: String },
    #[error("technique {technique} output exceeded {limit} bytes")]
    OutputTooLarge { technique: String, limit: usize },
}

/// First failing step of a recipe chain.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{technique}: {source}")]
pub struct ChainError {
    pub technique: String,
    pub source: EngineError,
}

/// Abstraction over technique engine backends.
pub trait TechniqueEngine {
    /// Apply one technique to `command` and return the transformed command.
    fn apply(&self, command: &str, technique: &str) -> Result<String, EngineError>;
}

/// Engine that spawns one process per technique call.
pub struct ProcessEngine {
    env: Environment<'static>,
    argv: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl ProcessEngine {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        if config.command.is_empty() {
            return Err(anyhow!("engine.command must be a non-empty array"));
        }
        let env = command_env();
        for arg in &config.command {
            check_template(&env, arg)?;
        }
        Ok(Self {
            env,
            argv: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        })
    }

    fn render_argv(&self, command: &str, technique: &str) -> Result<Vec<String>, EngineError> {
        self.argv
            .iter()
            .map(|arg| {
                self.env
                    .render_str(arg, context! { technique => technique, command => command })
                    .map_err(|err| EngineError::Spawn {
                        technique: technique.to_string(),
                        message: format!("render engine argument: {err}"),
                    })
            })
            .collect()
    }
}

impl TechniqueEngine for ProcessEngine {
    #[instrument(skip_all, fields(technique = technique, timeout_secs = self.timeout.as_secs()))]
    fn apply(&self, command: &str, technique: &str) -> Result<String, EngineError> {
        let argv = self.render_argv(command, technique)?;
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);

        let output = run_with_timeout(cmd, self.timeout, self.output_limit_bytes).map_err(
            |err| EngineError::Spawn {
                technique: technique.to_string(),
                message: format!("{err:#}"),
            },
        )?;

        if output.timed_out {
            warn!(
                timeout_secs = self.timeout.as_secs(),
                elapsed_ms = output.elapsed.as_millis() as u64,
                "technique engine timed out"
            );
            return Err(EngineError::Timeout {
                technique: technique.to_string(),
                after: self.timeout,
            });
        }
        if output.stdout_truncated > 0 {
            warn!(
                limit = self.output_limit_bytes,
                dropped = output.stdout_truncated,
                "technique output over limit"
            );
            return Err(EngineError::OutputTooLarge {
                technique: technique.to_string(),
                limit: self.output_limit_bytes,
            });
        }

        let stdout = output.stdout_lossy();
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            let message = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            let message = if message.is_empty() {
                format!("engine exited with status {:?}", output.status.code())
            } else {
                message.to_string()
            };
            return Err(EngineError::Technique {
                technique: technique.to_string(),
                message,
            });
        }
        if stdout.starts_with(ENGINE_ERROR_PREFIX) {
            return Err(EngineError::Technique {
                technique: technique.to_string(),
                message: stdout.trim().to_string(),
            });
        }

        let transformed = strip_trailing_newline(&stdout);
        if transformed.trim().is_empty() {
            return Err(EngineError::EmptyOutput {
                technique: technique.to_string(),
            });
        }
        debug!(
            input_len = command.len(),
            output_len = transformed.len(),
            "technique applied"
        );
        Ok(transformed.to_string())
    }
}

fn strip_trailing_newline(text: &str) -> &str {
    let text = text.strip_suffix('\n').unwrap_or(text);
    text.strip_suffix('\r').unwrap_or(text)
}

/// Apply every technique of `recipe` in order, feeding each output forward.
///
/// Stops at the first failure. The job's patience budget is checked before
/// each step; a step that cannot start in time counts as a timeout of that
/// step. An empty recipe returns `command` unchanged.
pub fn apply_recipe<E: TechniqueEngine + ?Sized>(
    engine: &E,
    command: &str,
    recipe: &Recipe,
    started: Instant,
    budget: Duration,
) -> Result<String, ChainError> {
    let deadline = started + budget;
    let mut current = command.to_string();
    for technique in recipe.techniques() {
        if remaining_budget(deadline).is_none() {
            return Err(ChainError {
                technique: technique.clone(),
                source: EngineError::Timeout {
                    technique: technique.clone(),
                    after: budget,
                },
            });
        }
        current = engine
            .apply(&current, technique)
            .map_err(|source| ChainError {
                technique: technique.clone(),
                source,
            })?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    /// Appends the technique name, or fails on the configured technique.
    struct SuffixEngine {
        fail_on: Option<&'static str>,
        calls: RefCell<Vec<String>>,
    }

    impl TechniqueEngine for SuffixEngine {
        fn apply(&self, command: &str, technique: &str) -> Result<String, EngineError> {
            self.calls.borrow_mut().push(technique.to_string());
            if self.fail_on == Some(technique) {
                return Err(EngineError::Technique {
                    technique: technique.to_string(),
                    message: format!("{technique} cannot parse input"),
                });
            }
            Ok(format!("{command}+{technique}"))
        }
    }

    fn engine(fail_on: Option<&'static str>) -> SuffixEngine {
        SuffixEngine {
            fail_on,
            calls: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn chains_in_recipe_order() {
        let engine = engine(None);
        let recipe: Recipe = ["a", "b", "c"].into_iter().collect();
        let out = apply_recipe(&engine, "cmd", &recipe, Instant::now(), Duration::from_secs(5))
            .expect("chain");
        assert_eq!(out, "cmd+a+b+c");
    }

    #[test]
    fn empty_recipe_is_identity() {
        let engine = engine(None);
        let out = apply_recipe(
            &engine,
            "whoami",
            &Recipe::empty(),
            Instant::now(),
            Duration::from_secs(5),
        )
        .expect("chain");
        assert_eq!(out, "whoami");
        assert!(engine.calls.borrow().is_empty());
    }

    #[test]
    fn short_circuits_on_first_failure() {
        let engine = engine(Some("b"));
        let recipe: Recipe = ["a", "b", "c"].into_iter().collect();
        let err = apply_recipe(&engine, "cmd", &recipe, Instant::now(), Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err.technique, "b");
        assert_eq!(err.source.to_string(), "b cannot parse input");
        assert_eq!(*engine.calls.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn exhausted_budget_is_a_timeout() {
        let engine = engine(None);
        let recipe: Recipe = ["a"].into_iter().collect();
        let err = apply_recipe(&engine, "cmd", &recipe, Instant::now(), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err.source, EngineError::Timeout { .. }));
        assert!(engine.calls.borrow().is_empty());
    }

    #[cfg(unix)]
    fn sh_engine(script: &str, timeout_secs: u64) -> ProcessEngine {
        ProcessEngine::new(&EngineConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs,
            output_limit_bytes: 4096,
        })
        .expect("engine")
    }

    #[cfg(unix)]
    #[test]
    fn process_engine_renders_argv_and_strips_newline() {
        let engine = sh_engine("echo {{ technique }}:{{ command | shquote }}", 5);
        let out = engine.apply("it's", "Upper").expect("apply");
        assert_eq!(out, "Upper:it's");
    }

    #[cfg(unix)]
    #[test]
    fn process_engine_reports_technique_failure_verbatim() {
        let engine = sh_engine("echo 'unsupported token' >&2; exit 2", 5);
        let err = engine.apply("x", "Broken").unwrap_err();
        assert_eq!(
            err,
            EngineError::Technique {
                technique: "Broken".to_string(),
                message: "unsupported token".to_string(),
            }
        );

        let engine = sh_engine("echo 'ENGINE_ERROR: bad input'", 5);
        let err = engine.apply("x", "Broken").unwrap_err();
        assert_eq!(err.to_string(), "ENGINE_ERROR: bad input");
    }

    #[cfg(unix)]
    #[test]
    fn process_engine_times_out() {
        let engine = ProcessEngine {
            timeout: Duration::from_millis(100),
            ..sh_engine("exec sleep 5", 1)
        };
        let err = engine.apply("x", "Slow").unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn process_engine_rejects_empty_output() {
        let engine = sh_engine("true", 5);
        let err = engine.apply("x", "Silent").unwrap_err();
        assert!(matches!(err, EngineError::EmptyOutput { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn process_engine_rejects_oversize_output() {
        let engine = ProcessEngine {
            output_limit_bytes: 16,
            ..sh_engine("echo 'Write-Output abcdefghijklmnop'", 5)
        };
        let err = engine.apply("x", "Pad").unwrap_err();
        assert_eq!(
            err,
            EngineError::OutputTooLarge {
                technique: "Pad".to_string(),
                limit: 16,
            }
        );
    }

    #[cfg(unix)]
    #[test]
    fn process_engine_timeout_is_bounded_with_forking_engine() {
        let engine = sh_engine("sleep 4; echo late", 1);
        let started = Instant::now();
        let err = engine.apply("x", "Slow").unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }

    #[test]
    fn invalid_argv_template_is_rejected() {
        let config = EngineConfig {
            command: vec!["engine".to_string(), "{{ technique".to_string()],
            ..EngineConfig::default()
        };
        assert!(ProcessEngine::new(&config).is_err());
    }
}
