//! Factory configuration stored under `.factory/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::jobs::ExclusionRule;
use crate::core::recipes::RecipeConfig;

/// Factory configuration (TOML).
///
/// Edited by humans. Missing fields fall back to defaults; relative paths are
/// resolved against the project root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FactoryConfig {
    /// Primitive library (JSON array).
    pub primitives_path: PathBuf,
    /// Accepted dataset checkpoint.
    pub dataset_path: PathBuf,
    /// Completed-job checkpoint.
    pub completed_path: PathBuf,
    /// Append-only audit log (JSON lines).
    pub audit_log_path: PathBuf,

    /// Persist checkpoints after this many processed jobs.
    pub checkpoint_every: u64,

    /// Rebuild the remote session after this many processed jobs.
    pub reset_every: u64,

    /// Commands longer than this many bytes never reach the remote host.
    pub max_command_bytes: usize,

    /// Patience budget for one job (all technique calls plus the remote run).
    pub job_timeout_secs: u64,

    /// Truncate audit record details beyond this many characters.
    pub audit_detail_limit: usize,

    /// Drop primitives without telemetry rules at load.
    pub require_telemetry: bool,

    pub engine: EngineConfig,
    pub session: SessionConfig,
    pub recipes: RecipeConfig,
    pub exclusions: Vec<ExclusionRule>,
}

/// Technique engine process (`[engine]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Argv templates rendered per call with `technique` and `command`.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "pwsh".to_string(),
                "-NoLogo".to_string(),
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
                "-Command".to_string(),
                "Import-Module ./engine/Sentinel.psd1; {{ technique }} -ScriptBlock {{ command | psquote }}"
                    .to_string(),
            ],
            timeout_secs: 30,
            output_limit_bytes: 1_000_000,
        }
    }
}

/// Framing dialect spoken by the remote shell.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShellDialect {
    Posix,
    Powershell,
}

/// Remote execution host (`[session]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Argv of the process that hosts the persistent shell.
    pub command: Vec<String>,
    pub dialect: ShellDialect,
    pub connect_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "ssh".to_string(),
                "-T".to_string(),
                "lab-host".to_string(),
                "pwsh".to_string(),
                "-NoLogo".to_string(),
                "-NoProfile".to_string(),
                "-Command".to_string(),
                "-".to_string(),
            ],
            dialect: ShellDialect::Powershell,
            connect_timeout_secs: 30,
            run_timeout_secs: 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            primitives_path: PathBuf::from("primitives.json"),
            dataset_path: PathBuf::from("output/dataset.json"),
            completed_path: PathBuf::from("output/completed.json"),
            audit_log_path: PathBuf::from("output/audit_log.jsonl"),
            checkpoint_every: 25,
            reset_every: 50,
            max_command_bytes: 8000,
            job_timeout_secs: 120,
            audit_detail_limit: 2000,
            require_telemetry: true,
            engine: EngineConfig::default(),
            session: SessionConfig::default(),
            recipes: RecipeConfig::default(),
            exclusions: Vec::new(),
        }
    }
}

/// Artifact paths with relative entries resolved against the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub primitives: PathBuf,
    pub dataset: PathBuf,
    pub completed: PathBuf,
    pub audit_log: PathBuf,
}

impl FactoryConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("primitives_path", &self.primitives_path),
            ("dataset_path", &self.dataset_path),
            ("completed_path", &self.completed_path),
            ("audit_log_path", &self.audit_log_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(anyhow!("{name} must not be empty"));
            }
        }
        if self.dataset_path == self.completed_path {
            return Err(anyhow!("dataset_path and completed_path must differ"));
        }
        if self.checkpoint_every == 0 {
            return Err(anyhow!("checkpoint_every must be > 0"));
        }
        if self.reset_every == 0 {
            return Err(anyhow!("reset_every must be > 0"));
        }
        if self.max_command_bytes == 0 {
            return Err(anyhow!("max_command_bytes must be > 0"));
        }
        if self.job_timeout_secs == 0 {
            return Err(anyhow!("job_timeout_secs must be > 0"));
        }
        if self.engine.command.is_empty() || self.engine.command[0].trim().is_empty() {
            return Err(anyhow!("engine.command must be a non-empty array"));
        }
        if self.engine.timeout_secs == 0 {
            return Err(anyhow!("engine.timeout_secs must be > 0"));
        }
        if self.engine.output_limit_bytes <= self.max_command_bytes {
            return Err(anyhow!(
                "engine.output_limit_bytes ({}) must exceed max_command_bytes ({})",
                self.engine.output_limit_bytes,
                self.max_command_bytes
            ));
        }
        if self.session.command.is_empty() || self.session.command[0].trim().is_empty() {
            return Err(anyhow!("session.command must be a non-empty array"));
        }
        if self.session.connect_timeout_secs == 0 {
            return Err(anyhow!("session.connect_timeout_secs must be > 0"));
        }
        if self.session.run_timeout_secs == 0 {
            return Err(anyhow!("session.run_timeout_secs must be > 0"));
        }
        if self.session.run_timeout_secs >= self.job_timeout_secs {
            return Err(anyhow!(
                "session.run_timeout_secs ({}) must be shorter than job_timeout_secs ({})",
                self.session.run_timeout_secs,
                self.job_timeout_secs
            ));
        }
        if self.session.output_limit_bytes == 0 {
            return Err(anyhow!("session.output_limit_bytes must be > 0"));
        }
        self.recipes.validate().context("invalid [recipes]")?;
        for (idx, rule) in self.exclusions.iter().enumerate() {
            if !rule.is_valid() {
                return Err(anyhow!(
                    "exclusions[{idx}] must name a primitive or a technique"
                ));
            }
        }
        Ok(())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn artifact_paths(&self, root: &Path) -> ArtifactPaths {
        ArtifactPaths {
            primitives: root.join(&self.primitives_path),
            dataset: root.join(&self.dataset_path),
            completed: root.join(&self.completed_path),
            audit_log: root.join(&self.audit_log_path),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `FactoryConfig::default()`.
pub fn load_config(path: &Path) -> Result<FactoryConfig> {
    if !path.exists() {
        let cfg = FactoryConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: FactoryConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FactoryConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, FactoryConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = FactoryConfig::default();
        cfg.exclusions.push(ExclusionRule {
            primitive: Some("PS-007".to_string()),
            technique: None,
            reason: Some("reboots the lab host".to_string()),
        });
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "reset_every = 10\n\n[session]\ncommand = [\"sh\"]\ndialect = \"posix\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.reset_every, 10);
        assert_eq!(cfg.session.dialect, ShellDialect::Posix);
        assert_eq!(cfg.session.run_timeout_secs, 60);
        assert_eq!(cfg.max_command_bytes, 8000);
    }

    #[test]
    fn run_timeout_must_fit_job_budget() {
        let mut cfg = FactoryConfig::default();
        cfg.session.run_timeout_secs = cfg.job_timeout_secs;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must be shorter"));
    }

    #[test]
    fn engine_output_limit_must_exceed_command_ceiling() {
        let mut cfg = FactoryConfig::default();
        cfg.engine.output_limit_bytes = cfg.max_command_bytes;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must exceed max_command_bytes"));
    }

    #[test]
    fn rejects_empty_exclusion() {
        let mut cfg = FactoryConfig::default();
        cfg.exclusions.push(ExclusionRule {
            primitive: None,
            technique: None,
            reason: None,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn resolves_relative_paths_against_root() {
        let cfg = FactoryConfig::default();
        let paths = cfg.artifact_paths(Path::new("/work"));
        assert_eq!(paths.dataset, PathBuf::from("/work/output/dataset.json"));
        let mut cfg = cfg;
        cfg.audit_log_path = PathBuf::from("/var/log/audit.jsonl");
        let paths = cfg.artifact_paths(Path::new("/work"));
        assert_eq!(paths.audit_log, PathBuf::from("/var/log/audit.jsonl"));
    }
}
