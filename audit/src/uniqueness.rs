//! Prompt uniqueness over the accepted dataset.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use factory::core::types::DatasetRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniquenessReport {
    pub total: usize,
    pub unique: usize,
    /// Prompts that occur more than once, with their occurrence counts.
    pub duplicated: Vec<(String, usize)>,
}

impl UniquenessReport {
    pub fn unique_ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.unique as f64 / self.total as f64
        }
    }
}

/// Read the dataset array. A missing file is an empty dataset.
pub fn load_dataset(path: &Path) -> Result<Vec<DatasetRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

pub fn uniqueness(records: &[DatasetRecord]) -> UniquenessReport {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for record in records {
        *counts.entry(record.prompt.as_str()).or_default() += 1;
    }
    let mut duplicated: Vec<(String, usize)> = counts
        .iter()
        .filter(|(_, count)| **count > 1)
        .map(|(prompt, count)| (prompt.to_string(), *count))
        .collect();
    duplicated.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    UniquenessReport {
        total: records.len(),
        unique: counts.len(),
        duplicated,
    }
}
