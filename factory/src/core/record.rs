//! Dataset record construction with schema validation.

use jsonschema::Validator;
use serde_json::Value;
use thiserror::Error;

use crate::core::types::{Analysis, DatasetRecord, JobKey, Primitive, RecordResponse};

const DATASET_RECORD_SCHEMA: &str = include_str!("../../schemas/dataset_record.schema.json");

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("record schema violations: {}", .0.join("; "))]
    Schema(Vec<String>),
}

/// Compiled dataset record schema.
pub struct RecordBuilder {
    validator: Validator,
}

impl RecordBuilder {
    pub fn new() -> anyhow::Result<Self> {
        let schema: Value = serde_json::from_str(DATASET_RECORD_SCHEMA)?;
        let validator = jsonschema::validator_for(&schema)
            .map_err(|err| anyhow::anyhow!("invalid dataset record schema: {err}"))?;
        Ok(Self { validator })
    }

    /// Build the record for a successfully executed job and check it against the schema.
    pub fn build(
        &self,
        primitive: &Primitive,
        prompt: &str,
        source: JobKey,
    ) -> Result<DatasetRecord, RecordError> {
        let record = DatasetRecord {
            prompt: prompt.to_string(),
            response: RecordResponse {
                deobfuscated_command: primitive.command.clone(),
                analysis: Analysis {
                    intent: primitive.labels.intent.clone(),
                    mitre_ttps: primitive.labels.mitre_ttps.clone(),
                    telemetry_signature: primitive.labels.telemetry_rules.clone(),
                },
            },
            source,
        };
        self.validate(&record)?;
        Ok(record)
    }

    pub fn validate(&self, record: &DatasetRecord) -> Result<(), RecordError> {
        let value = serde_json::to_value(record)?;
        let messages: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if messages.is_empty() {
            Ok(())
        } else {
            Err(RecordError::Schema(messages))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Labels, Recipe, TelemetryRule};

    fn primitive(rules: Vec<TelemetryRule>) -> Primitive {
        Primitive {
            id: "P1".to_string(),
            command: "whoami".to_string(),
            labels: Labels {
                intent: vec!["System Owner/User Discovery".to_string()],
                mitre_ttps: vec!["T1033".to_string()],
                telemetry_rules: rules,
            },
        }
    }

    fn rule() -> TelemetryRule {
        TelemetryRule {
            source: "Sysmon".to_string(),
            event_id: 1,
            details: "Process Create".to_string(),
        }
    }

    #[test]
    fn builds_record_from_primitive_labels() {
        let builder = RecordBuilder::new().expect("schema");
        let primitive = primitive(vec![rule()]);
        let record = builder
            .build(
                &primitive,
                "wh''oami",
                JobKey::new("P1", Recipe::empty()),
            )
            .expect("record");
        assert_eq!(record.prompt, "wh''oami");
        assert_eq!(record.response.deobfuscated_command, "whoami");
        assert_eq!(record.response.analysis.mitre_ttps, vec!["T1033"]);
        assert_eq!(record.response.analysis.telemetry_signature, vec![rule()]);
    }

    #[test]
    fn rejects_record_without_telemetry() {
        let builder = RecordBuilder::new().expect("schema");
        let err = builder
            .build(&primitive(Vec::new()), "whoami", JobKey::new("P1", Recipe::empty()))
            .unwrap_err();
        assert!(matches!(err, RecordError::Schema(ref messages) if messages.len() == 1));
    }

    #[test]
    fn rejects_empty_prompt() {
        let builder = RecordBuilder::new().expect("schema");
        let err = builder
            .build(&primitive(vec![rule()]), "", JobKey::new("P1", Recipe::empty()))
            .unwrap_err();
        assert!(matches!(err, RecordError::Schema(_)));
    }
}
