//! Aggregation over the factory audit log.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use factory::core::types::{AuditRecord, Outcome};
use factory::factory::OutcomeCounts;
use regex::Regex;

/// Longest normalized failure reason kept as a grouping key.
const REASON_LIMIT: usize = 160;

/// Attempts and successes for one primitive or technique.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub attempted: usize,
    pub success: usize,
}

impl Tally {
    fn record(&mut self, outcome: Outcome) {
        self.attempted += 1;
        if outcome.is_success() {
            self.success += 1;
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.success as f64 / self.attempted as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct AuditReport {
    pub total: usize,
    pub outcomes: OutcomeCounts,
    pub per_primitive: BTreeMap<String, Tally>,
    /// Keyed by technique name; a recipe counts once per distinct technique.
    pub per_technique: BTreeMap<String, Tally>,
    /// Normalized `failure_lab` reasons and how often each occurred.
    pub lab_reasons: BTreeMap<String, usize>,
}

impl AuditReport {
    /// Most frequent lab failure reasons, ties broken alphabetically.
    pub fn top_lab_reasons(&self, n: usize) -> Vec<(&str, usize)> {
        let mut reasons: Vec<(&str, usize)> = self
            .lab_reasons
            .iter()
            .map(|(reason, count)| (reason.as_str(), *count))
            .collect();
        reasons.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        reasons.truncate(n);
        reasons
    }
}

pub fn aggregate(records: &[AuditRecord]) -> AuditReport {
    let mut report = AuditReport::default();
    for record in records {
        report.total += 1;
        report.outcomes.record(record.status);
        report
            .per_primitive
            .entry(record.primitive_id.clone())
            .or_default()
            .record(record.status);

        let mut seen: Vec<&str> = Vec::new();
        for technique in record.recipe.techniques() {
            if seen.contains(&technique.as_str()) {
                continue;
            }
            seen.push(technique);
            report
                .per_technique
                .entry(technique.clone())
                .or_default()
                .record(record.status);
        }

        if record.status == Outcome::FailureLab {
            *report
                .lab_reasons
                .entry(normalize_reason(&record.details))
                .or_default() += 1;
        }
    }
    report
}

/// Reduce a lab failure detail string to a grouping key.
///
/// Prefers the stderr text when present, keeps its first line, and replaces
/// digit runs with `N` so line numbers and exit codes do not split groups.
pub fn normalize_reason(details: &str) -> String {
    static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());
    static SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

    let text = match details.split_once("Stderr:") {
        Some((_, stderr)) => stderr,
        None => details,
    };
    let first_line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    if first_line.is_empty() {
        return "(no details)".to_string();
    }
    let normalized = DIGITS.replace_all(first_line, "N");
    let normalized = SPACE.replace_all(&normalized, " ");
    normalized.chars().take(REASON_LIMIT).collect()
}
