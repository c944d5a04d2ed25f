//! Deterministic enumeration of obfuscation recipes.
//!
//! Recipes are emitted in shortlex order: by length, then lexicographically by
//! the configured technique order. The empty recipe is always first. Pruning
//! predicates are evaluated on every partial candidate, so a violating sequence
//! is abandoned before it can be emitted.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::Recipe;

/// One technique in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechniqueSpec {
    pub name: String,
    /// Maximum occurrences within a single recipe.
    #[serde(default = "default_max_repeats")]
    pub max_repeats: u32,
    /// Terminal techniques may only appear as the final step.
    #[serde(default)]
    pub terminal: bool,
}

fn default_max_repeats() -> u32 {
    1
}

impl TechniqueSpec {
    pub fn new(name: &str, max_repeats: u32, terminal: bool) -> Self {
        Self {
            name: name.to_string(),
            max_repeats,
            terminal,
        }
    }
}

/// Static configuration for the recipe generator (`[recipes]` table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipeConfig {
    pub max_length: usize,
    /// Pairs of techniques that may not appear together in one recipe.
    pub exclusive: Vec<[String; 2]>,
    pub techniques: Vec<TechniqueSpec>,
}

impl Default for RecipeConfig {
    fn default() -> Self {
        Self {
            max_length: 3,
            exclusive: vec![
                [
                    "Invoke-SentinelVariable".to_string(),
                    "Invoke-SentinelFormat".to_string(),
                ],
                [
                    "Invoke-SentinelBase64".to_string(),
                    "Invoke-SentinelCommand".to_string(),
                ],
            ],
            techniques: vec![
                TechniqueSpec::new("Invoke-SentinelConcat", 2, false),
                TechniqueSpec::new("Invoke-SentinelType", 1, false),
                TechniqueSpec::new("Invoke-SentinelVariable", 1, false),
                TechniqueSpec::new("Invoke-SentinelFormat", 1, false),
                TechniqueSpec::new("Invoke-SentinelBase64", 1, true),
                TechniqueSpec::new("Invoke-SentinelCommand", 1, true),
            ],
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecipeConfigError {
    #[error("technique name must not be empty")]
    EmptyName,
    #[error("duplicate technique {0}")]
    DuplicateTechnique(String),
    #[error("technique {0} must allow at least one repeat")]
    ZeroRepeats(String),
    #[error("exclusive pair references unknown technique {0}")]
    UnknownTechnique(String),
    #[error("exclusive pair repeats technique {0}")]
    SelfExclusive(String),
}

impl RecipeConfig {
    pub fn validate(&self) -> Result<(), RecipeConfigError> {
        let mut seen = BTreeSet::new();
        for spec in &self.techniques {
            if spec.name.trim().is_empty() {
                return Err(RecipeConfigError::EmptyName);
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(RecipeConfigError::DuplicateTechnique(spec.name.clone()));
            }
            if spec.max_repeats == 0 {
                return Err(RecipeConfigError::ZeroRepeats(spec.name.clone()));
            }
        }
        for [a, b] in &self.exclusive {
            for name in [a, b] {
                if !seen.contains(name.as_str()) {
                    return Err(RecipeConfigError::UnknownTechnique(name.clone()));
                }
            }
            if a == b {
                return Err(RecipeConfigError::SelfExclusive(a.clone()));
            }
        }
        Ok(())
    }

    pub fn technique_names(&self) -> impl Iterator<Item = &str> {
        self.techniques.iter().map(|spec| spec.name.as_str())
    }
}

/// Enumerate every admissible recipe in deterministic order.
pub fn generate_recipes(config: &RecipeConfig) -> Result<Vec<Recipe>, RecipeConfigError> {
    config.validate()?;
    let rules = Rules::new(config);
    let mut recipes = Vec::new();
    let mut prefix = Vec::with_capacity(config.max_length);
    let mut counts = vec![0u32; config.techniques.len()];
    for length in 0..=config.max_length {
        extend(&rules, length, &mut prefix, &mut counts, &mut recipes);
    }
    Ok(recipes
        .into_iter()
        .map(|indices| {
            indices
                .into_iter()
                .map(|idx| config.techniques[idx].name.clone())
                .collect()
        })
        .collect())
}

/// Index-based view of the pruning predicates.
struct Rules<'a> {
    techniques: &'a [TechniqueSpec],
    /// For each technique, the indices it is mutually exclusive with.
    excludes: Vec<Vec<usize>>,
}

impl<'a> Rules<'a> {
    fn new(config: &'a RecipeConfig) -> Self {
        let index_of = |name: &str| {
            config
                .techniques
                .iter()
                .position(|spec| spec.name == name)
        };
        let mut excludes = vec![Vec::new(); config.techniques.len()];
        for [a, b] in &config.exclusive {
            if let (Some(a), Some(b)) = (index_of(a.as_str()), index_of(b.as_str())) {
                excludes[a].push(b);
                excludes[b].push(a);
            }
        }
        Self {
            techniques: &config.techniques,
            excludes,
        }
    }

    /// Whether `candidate` may be placed at `position` of a recipe of `length`.
    fn admits(&self, candidate: usize, position: usize, length: usize, counts: &[u32]) -> bool {
        let spec = &self.techniques[candidate];
        if counts[candidate] >= spec.max_repeats {
            return false;
        }
        if spec.terminal && position + 1 != length {
            return false;
        }
        !self.excludes[candidate]
            .iter()
            .any(|&other| counts[other] > 0)
    }
}

fn extend(
    rules: &Rules<'_>,
    length: usize,
    prefix: &mut Vec<usize>,
    counts: &mut [u32],
    out: &mut Vec<Vec<usize>>,
) {
    if prefix.len() == length {
        out.push(prefix.clone());
        return;
    }
    let position = prefix.len();
    for candidate in 0..rules.techniques.len() {
        if !rules.admits(candidate, position, length, counts) {
            continue;
        }
        prefix.push(candidate);
        counts[candidate] += 1;
        extend(rules, length, prefix, counts, out);
        counts[candidate] -= 1;
        prefix.pop();
    }
}
