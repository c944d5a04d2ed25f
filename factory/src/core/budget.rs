//! Per-job time budget helpers.

use std::time::{Duration, Instant};

/// Remaining time until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return None;
    }
    Some(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_deadline_has_no_budget() {
        assert_eq!(remaining_budget(Instant::now()), None);
    }

    #[test]
    fn future_deadline_has_budget() {
        let remaining = remaining_budget(Instant::now() + Duration::from_secs(60)).expect("budget");
        assert!(remaining > Duration::from_secs(50));
    }
}
