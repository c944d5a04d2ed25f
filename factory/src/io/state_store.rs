//! Durable job state: accepted dataset plus the completed-job set.
//!
//! Both artifacts are written to `<file>.tmp` and renamed into place, dataset
//! first. A crash between the two renames leaves a dataset that is ahead of
//! the completion set; `load_state` repairs that by folding every record's
//! source job back into the set.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::types::{CompletionSet, DatasetRecord, JobKey};

const COMPLETED_VERSION: u32 = 1;

/// Checkpoint file locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub dataset: PathBuf,
    pub completed: PathBuf,
}

/// On-disk shape of the completed-job checkpoint.
#[derive(Debug, Serialize, Deserialize)]
struct CompletedFile {
    version: u32,
    completed: Vec<JobKey>,
}

/// In-memory job state restored from the last checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobState {
    pub records: Vec<DatasetRecord>,
    pub completed: CompletionSet,
}

/// Load both checkpoints. Missing or empty files yield empty collections.
#[instrument(skip_all, fields(dataset = %paths.dataset.display()))]
pub fn load_state(paths: &StatePaths) -> Result<JobState> {
    let records: Vec<DatasetRecord> = match read_nonempty(&paths.dataset)? {
        Some(contents) => serde_json::from_str(&contents)
            .with_context(|| format!("parse dataset {}", paths.dataset.display()))?,
        None => Vec::new(),
    };
    let mut completed: CompletionSet = match read_nonempty(&paths.completed)? {
        Some(contents) => {
            let file: CompletedFile = serde_json::from_str(&contents)
                .with_context(|| format!("parse completed jobs {}", paths.completed.display()))?;
            if file.version != COMPLETED_VERSION {
                return Err(anyhow!(
                    "unsupported completed jobs version {} in {}",
                    file.version,
                    paths.completed.display()
                ));
            }
            file.completed.into_iter().collect()
        }
        None => CompletionSet::new(),
    };

    let mut seen = BTreeSet::new();
    let mut unique = Vec::with_capacity(records.len());
    for record in records {
        if !seen.insert(record.source.clone()) {
            warn!(job = %record.source, "dropping duplicate dataset record");
            continue;
        }
        if completed.insert(record.source.clone()) {
            warn!(job = %record.source, "dataset record missing from completed jobs, restoring");
        }
        unique.push(record);
    }

    debug!(
        records = unique.len(),
        completed = completed.len(),
        "job state loaded"
    );
    Ok(JobState {
        records: unique,
        completed,
    })
}

/// Persist both checkpoints, dataset first.
#[instrument(skip_all, fields(records = records.len(), completed = completed.len()))]
pub fn save_state(
    records: &[DatasetRecord],
    completed: &CompletionSet,
    paths: &StatePaths,
) -> Result<()> {
    let mut dataset = serde_json::to_string_pretty(records).context("serialize dataset")?;
    dataset.push('\n');
    write_atomic(&paths.dataset, &dataset)?;

    let file = CompletedFile {
        version: COMPLETED_VERSION,
        completed: completed.iter().cloned().collect(),
    };
    let mut buf = serde_json::to_string_pretty(&file).context("serialize completed jobs")?;
    buf.push('\n');
    write_atomic(&paths.completed, &buf)?;
    debug!("checkpoint written");
    Ok(())
}

fn read_nonempty(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    if contents.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(contents))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("checkpoint path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    let tmp_path = PathBuf::from(tmp_path);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp checkpoint {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace checkpoint {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Analysis, Recipe, RecordResponse, TelemetryRule};

    fn paths(root: &Path) -> StatePaths {
        StatePaths {
            dataset: root.join("out/dataset.json"),
            completed: root.join("out/completed.json"),
        }
    }

    fn record(primitive_id: &str, recipe: Recipe, prompt: &str) -> DatasetRecord {
        DatasetRecord {
            prompt: prompt.to_string(),
            response: RecordResponse {
                deobfuscated_command: "whoami".to_string(),
                analysis: Analysis {
                    intent: vec!["Discovery".to_string()],
                    mitre_ttps: vec!["T1033".to_string()],
                    telemetry_signature: vec![TelemetryRule {
                        source: "Sysmon".to_string(),
                        event_id: 1,
                        details: "Process Create".to_string(),
                    }],
                },
            },
            source: JobKey::new(primitive_id, recipe),
        }
    }

    #[test]
    fn missing_files_load_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = load_state(&paths(temp.path())).expect("load");
        assert_eq!(state, JobState::default());
    }

    #[test]
    fn empty_files_load_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = paths(temp.path());
        fs::create_dir_all(paths.dataset.parent().expect("parent")).expect("mkdir");
        fs::write(&paths.dataset, "").expect("write");
        fs::write(&paths.completed, "\n").expect("write");
        let state = load_state(&paths).expect("load");
        assert_eq!(state, JobState::default());
    }

    /// Verifies save then load reproduces the same dataset and completion set.
    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = paths(temp.path());
        let a: Recipe = ["a"].into_iter().collect();
        let records = vec![
            record("P1", Recipe::empty(), "whoami"),
            record("P1", a.clone(), "who'ami"),
        ];
        let completed: CompletionSet = [
            JobKey::new("P1", Recipe::empty()),
            JobKey::new("P1", a),
            JobKey::new("P2", Recipe::empty()),
        ]
        .into_iter()
        .collect();

        save_state(&records, &completed, &paths).expect("save");
        let state = load_state(&paths).expect("load");
        assert_eq!(state.records, records);
        assert_eq!(state.completed, completed);
        assert!(!paths.dataset.with_extension("json.tmp").exists());
    }

    #[test]
    fn completed_file_is_versioned_and_sorted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = paths(temp.path());
        let completed: CompletionSet = [
            JobKey::new("P2", Recipe::empty()),
            JobKey::new("P1", Recipe::empty()),
        ]
        .into_iter()
        .collect();
        save_state(&[], &completed, &paths).expect("save");

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.completed).expect("read"))
                .expect("parse");
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["completed"][0]["primitive_id"], "P1");
        assert_eq!(raw["completed"][1]["primitive_id"], "P2");
    }

    /// Verifies a dataset written without its completion set is repaired on load.
    #[test]
    fn reconciles_dataset_ahead_of_completed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = paths(temp.path());
        let records = vec![record("P1", Recipe::empty(), "whoami")];
        save_state(&records, &CompletionSet::new(), &paths).expect("save");

        let state = load_state(&paths).expect("load");
        assert!(state.completed.contains(&JobKey::new("P1", Recipe::empty())));
    }

    #[test]
    fn drops_duplicate_dataset_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = paths(temp.path());
        let records = vec![
            record("P1", Recipe::empty(), "whoami"),
            record("P1", Recipe::empty(), "whoami again"),
        ];
        save_state(&records, &CompletionSet::new(), &paths).expect("save");

        let state = load_state(&paths).expect("load");
        assert_eq!(state.records.len(), 1);
        assert_eq!(state.records[0].prompt, "whoami");
    }

    #[test]
    fn rejects_unknown_completed_version() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = paths(temp.path());
        fs::create_dir_all(paths.completed.parent().expect("parent")).expect("mkdir");
        fs::write(&paths.completed, r#"{"version": 9, "completed": []}"#).expect("write");
        let err = load_state(&paths).unwrap_err();
        assert!(err.to_string().contains("unsupported completed jobs version 9"));
    }
}
