//! Initialization helpers for `.factory/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use super::config::{FactoryConfig, write_config};

/// Canonical paths within `.factory/` for a project root.
#[derive(Debug, Clone)]
pub struct FactoryPaths {
    pub root: PathBuf,
    pub factory_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
}

impl FactoryPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let factory_dir = root.join(".factory");
        Self {
            root: root.clone(),
            factory_dir: factory_dir.clone(),
            gitignore_path: factory_dir.join(".gitignore"),
            config_path: factory_dir.join("config.toml"),
        }
    }
}

/// Options for `init_factory`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite the existing configuration.
    pub force: bool,
}

/// Create `.factory/` scaffolding in `root`.
///
/// Fails if `.factory/` already exists unless `options.force` is set. A sample
/// primitive library is written only when none exists yet; it is never
/// overwritten.
pub fn init_factory(root: &Path, options: &InitOptions) -> Result<FactoryPaths> {
    let paths = FactoryPaths::new(root);
    if paths.factory_dir.exists() && !options.force {
        return Err(anyhow!(
            "factory init: .factory already exists (use --force to overwrite)"
        ));
    }
    if paths.factory_dir.exists() && !paths.factory_dir.is_dir() {
        return Err(anyhow!(
            "factory init: .factory exists but is not a directory"
        ));
    }

    fs::create_dir_all(&paths.factory_dir)
        .with_context(|| format!("create directory {}", paths.factory_dir.display()))?;
    write_file(&paths.gitignore_path, FACTORY_GITIGNORE)?;
    let config = FactoryConfig::default();
    write_config(&paths.config_path, &config)?;

    let primitives = config.artifact_paths(root).primitives;
    if !primitives.exists() {
        write_file(&primitives, SAMPLE_PRIMITIVES)?;
        info!(path = %primitives.display(), "wrote sample primitive library");
    }

    Ok(paths)
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const FACTORY_GITIGNORE: &str = "*.tmp\n";
const SAMPLE_PRIMITIVES: &str = r#"[
  {
    "primitive_id": "PS-001",
    "primitive_command": "whoami",
    "intent": ["System Owner/User Discovery"],
    "mitre_ttps": ["T1033"],
    "telemetry_rules": [
      { "source": "Sysmon", "event_id": 1, "details": "Process Create: whoami.exe" }
    ]
  }
]
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Primitive;
    use crate::io::config::load_config;

    /// Verifies init_factory writes a loadable default config and a sample library.
    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();

        let paths = init_factory(root, &InitOptions { force: false }).expect("init");

        assert!(paths.factory_dir.is_dir());
        assert!(paths.gitignore_path.is_file());
        let cfg = load_config(&paths.config_path).expect("load config");
        assert_eq!(cfg, FactoryConfig::default());

        let library = fs::read_to_string(root.join("primitives.json")).expect("read library");
        let primitives: Vec<Primitive> = serde_json::from_str(&library).expect("parse library");
        assert_eq!(primitives.len(), 1);
        assert!(primitives[0].is_usable());
    }

    /// Verifies init_factory refuses to overwrite without --force.
    #[test]
    fn init_without_force_refuses_existing_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_factory(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_factory(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    /// Verifies --force rewrites the config but leaves the primitive library alone.
    #[test]
    fn init_with_force_keeps_existing_library() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        let paths = init_factory(root, &InitOptions { force: false }).expect("init");

        fs::write(&paths.config_path, "reset_every = 3\n").expect("customize config");
        fs::write(root.join("primitives.json"), "[]").expect("customize library");

        init_factory(root, &InitOptions { force: true }).expect("re-init");

        let cfg = load_config(&paths.config_path).expect("load config");
        assert_eq!(cfg.reset_every, FactoryConfig::default().reset_every);
        let library = fs::read_to_string(root.join("primitives.json")).expect("read library");
        assert_eq!(library, "[]");
    }
}
