//! Shared deterministic types for the factory core.
//!
//! These types define stable contracts between the engine components and the
//! on-disk artifacts (checkpoints, audit log, dataset). They carry no I/O.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single curated telemetry signal attached to a primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryRule {
    pub source: String,
    pub event_id: i64,
    pub details: String,
}

/// Classification labels carried by a primitive and copied into dataset records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labels {
    #[serde(default)]
    pub intent: Vec<String>,
    #[serde(default)]
    pub mitre_ttps: Vec<String>,
    #[serde(default)]
    pub telemetry_rules: Vec<TelemetryRule>,
}

/// A known-good source command plus its labels (one entry of the primitive library).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Primitive {
    #[serde(rename = "primitive_id")]
    pub id: String,
    #[serde(rename = "primitive_command")]
    pub command: String,
    #[serde(flatten)]
    pub labels: Labels,
}

impl Primitive {
    /// Primitives without telemetry rules cannot produce a complete record.
    pub fn is_usable(&self) -> bool {
        !self.labels.telemetry_rules.is_empty()
    }
}

/// Ordered sequence of technique names. Order is significant.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Recipe(Vec<String>);

impl Recipe {
    pub fn new(techniques: Vec<String>) -> Self {
        Self(techniques)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn techniques(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, technique: &str) -> bool {
        self.0.iter().any(|t| t == technique)
    }
}

impl<S: Into<String>> FromIterator<S> for Recipe {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

/// Identity of a job: the unit of idempotency across restarts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub primitive_id: String,
    pub recipe: Recipe,
}

impl JobKey {
    pub fn new(primitive_id: impl Into<String>, recipe: Recipe) -> Self {
        Self {
            primitive_id: primitive_id.into(),
            recipe,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.primitive_id, self.recipe)
    }
}

/// Jobs already attempted, regardless of outcome.
pub type CompletionSet = BTreeSet<JobKey>;

/// Terminal classification of a job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Executed on the lab host with exit code zero and produced a record.
    Success,
    /// Forbidden by a static exclusion rule; never transformed or executed.
    SkippedExclusion,
    /// The technique engine errored or timed out.
    FailureEngine,
    /// The lab host rejected the command, or the pre-flight guard did.
    FailureLab,
    /// The record could not be constructed. Indicates a defect, not bad data.
    FailureValidation,
}

impl Outcome {
    pub const ALL: [Outcome; 5] = [
        Outcome::Success,
        Outcome::SkippedExclusion,
        Outcome::FailureEngine,
        Outcome::FailureLab,
        Outcome::FailureValidation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::SkippedExclusion => "skipped_exclusion",
            Outcome::FailureEngine => "failure_engine",
            Outcome::FailureLab => "failure_lab",
            Outcome::FailureValidation => "failure_validation",
        }
    }

    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub primitive_id: String,
    pub recipe: Recipe,
    pub status: Outcome,
    #[serde(default)]
    pub details: String,
    /// Transformed command of a `success`, so its dataset record can be
    /// rebuilt if the run dies before the next checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl AuditRecord {
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn job_key(&self) -> JobKey {
        JobKey::new(self.primitive_id.clone(), self.recipe.clone())
    }
}

/// Structured analysis copied from the source primitive's labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub intent: Vec<String>,
    pub mitre_ttps: Vec<String>,
    pub telemetry_signature: Vec<TelemetryRule>,
}

/// Expected response for a dataset prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordResponse {
    pub deobfuscated_command: String,
    pub analysis: Analysis,
}

/// Accepted output unit of the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    /// The fully transformed command.
    pub prompt: String,
    pub response: RecordResponse,
    /// The job that produced this record.
    pub source: JobKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipe_order_is_significant() {
        let ab: Recipe = ["a", "b"].into_iter().collect();
        let ba: Recipe = ["b", "a"].into_iter().collect();
        assert_ne!(ab, ba);
        assert_ne!(JobKey::new("P1", ab), JobKey::new("P1", ba));
    }

    #[test]
    fn recipe_displays_as_list() {
        assert_eq!(Recipe::empty().to_string(), "[]");
        let recipe: Recipe = ["Invoke-SentinelConcat", "Invoke-SentinelBase64"]
            .into_iter()
            .collect();
        assert_eq!(
            recipe.to_string(),
            "[Invoke-SentinelConcat, Invoke-SentinelBase64]"
        );
    }

    #[test]
    fn outcome_serializes_snake_case() {
        for outcome in Outcome::ALL {
            let json = serde_json::to_string(&outcome).expect("serialize");
            assert_eq!(json, format!("\"{}\"", outcome.as_str()));
        }
    }

    #[test]
    fn primitive_parses_library_shape() {
        let raw = r#"{
            "primitive_id": "PS-001",
            "primitive_command": "Get-Process",
            "intent": ["Process Discovery"],
            "mitre_ttps": ["T1057"],
            "telemetry_rules": [{"source": "Sysmon", "event_id": 1, "details": "Process Create"}]
        }"#;
        let primitive: Primitive = serde_json::from_str(raw).expect("parse");
        assert_eq!(primitive.id, "PS-001");
        assert_eq!(primitive.command, "Get-Process");
        assert_eq!(primitive.labels.mitre_ttps, vec!["T1057"]);
        assert!(primitive.is_usable());
    }
}
