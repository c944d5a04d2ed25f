//! Deterministic classification of lab execution results.

/// Verdict for a command that reached the lab host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabVerdict {
    Accepted,
    Rejected(String),
}

/// Classify a completed remote execution.
///
/// - Exit code `0` is accepted regardless of stderr content.
/// - Any other exit code is rejected with a `exit code N. Stderr: ...` detail;
///   the `Stderr:` marker is what failure analysis groups on.
pub fn classify_exit(exit_code: i32, stderr: &str) -> LabVerdict {
    if exit_code == 0 {
        return LabVerdict::Accepted;
    }
    let stderr = stderr.trim();
    if stderr.is_empty() {
        LabVerdict::Rejected(format!("exit code {exit_code}"))
    } else {
        LabVerdict::Rejected(format!("exit code {exit_code}. Stderr: {stderr}"))
    }
}

/// Truncate audit details to `limit` characters, noting how much was dropped.
pub fn truncate_details(details: &str, limit: usize) -> String {
    let total = details.chars().count();
    if total <= limit {
        return details.to_string();
    }
    let kept: String = details.chars().take(limit).collect();
    format!("{kept}…[truncated {} chars]", total - limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_exit_is_accepted() {
        assert_eq!(classify_exit(0, "warning: noisy"), LabVerdict::Accepted);
    }

    #[test]
    fn nonzero_exit_carries_stderr() {
        assert_eq!(
            classify_exit(1, "  The term 'Invoke-Foo' is not recognized\n"),
            LabVerdict::Rejected(
                "exit code 1. Stderr: The term 'Invoke-Foo' is not recognized".to_string()
            )
        );
        assert_eq!(
            classify_exit(127, ""),
            LabVerdict::Rejected("exit code 127".to_string())
        );
    }

    #[test]
    fn truncation_counts_chars() {
        assert_eq!(truncate_details("short", 10), "short");
        assert_eq!(truncate_details("ééééé", 2), "éé…[truncated 3 chars]");
    }
}
