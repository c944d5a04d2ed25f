//! Primitive library loading.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::types::Primitive;

/// Primitives admitted to the job space, plus the ids dropped at load.
#[derive(Debug, Clone, Default)]
pub struct PrimitiveLibrary {
    pub primitives: Vec<Primitive>,
    pub dropped: Vec<String>,
}

/// Load the primitive library (JSON array) from `path`, preserving file order.
///
/// Duplicate ids are an error. With `require_telemetry`, primitives that carry
/// no telemetry rules are dropped with a warning, since they could never
/// produce a valid record.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_primitives(path: &Path, require_telemetry: bool) -> Result<PrimitiveLibrary> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read primitive library {}", path.display()))?;
    let all: Vec<Primitive> = serde_json::from_str(&contents)
        .with_context(|| format!("parse primitive library {}", path.display()))?;

    let mut seen = BTreeSet::new();
    for primitive in &all {
        if primitive.id.trim().is_empty() {
            return Err(anyhow!("primitive library contains an empty primitive_id"));
        }
        if !seen.insert(primitive.id.as_str()) {
            return Err(anyhow!("duplicate primitive_id {}", primitive.id));
        }
    }

    let mut library = PrimitiveLibrary::default();
    for primitive in all {
        if require_telemetry && !primitive.is_usable() {
            warn!(primitive_id = %primitive.id, "dropping primitive without telemetry rules");
            library.dropped.push(primitive.id);
            continue;
        }
        library.primitives.push(primitive);
    }
    debug!(
        loaded = library.primitives.len(),
        dropped = library.dropped.len(),
        "loaded primitive library"
    );
    Ok(library)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIBRARY: &str = r#"[
        {"primitive_id": "P1", "primitive_command": "whoami",
         "telemetry_rules": [{"source": "Sysmon", "event_id": 1, "details": "Process Create"}]},
        {"primitive_id": "P2", "primitive_command": "hostname"},
        {"primitive_id": "P3", "primitive_command": "Get-Process",
         "telemetry_rules": [{"source": "Security", "event_id": 4688, "details": "New Process"}]}
    ]"#;

    fn write_library(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("primitives.json");
        fs::write(&path, contents).expect("write library");
        (temp, path)
    }

    #[test]
    fn drops_primitives_without_telemetry() {
        let (_temp, path) = write_library(LIBRARY);
        let library = load_primitives(&path, true).expect("load");
        let ids: Vec<&str> = library.primitives.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["P1", "P3"]);
        assert_eq!(library.dropped, vec!["P2"]);
    }

    #[test]
    fn keeps_everything_when_telemetry_not_required() {
        let (_temp, path) = write_library(LIBRARY);
        let library = load_primitives(&path, false).expect("load");
        assert_eq!(library.primitives.len(), 3);
        assert!(library.dropped.is_empty());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let (_temp, path) = write_library(
            r#"[{"primitive_id": "P1", "primitive_command": "a"},
                {"primitive_id": "P1", "primitive_command": "b"}]"#,
        );
        let err = load_primitives(&path, false).unwrap_err();
        assert!(err.to_string().contains("duplicate primitive_id P1"));
    }

    #[test]
    fn missing_library_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(load_primitives(&temp.path().join("nope.json"), true).is_err());
    }
}
