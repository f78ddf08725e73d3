//! Retry and Catch matching with exponential backoff.
//!
//! Each Retry rule keeps its own attempt counter for the lifetime of one
//! state visit. `maxAttempts` counts total invocations for errors matching
//! the rule, so `maxAttempts: 3` allows two retries. The delay before retry
//! `n` (1-based) is `intervalSeconds * backoffRate^(n-1)`.

use std::time::Duration;

use complyflow_types::workflow::{CatchRule, RetryRule};

use crate::task::error_class;

/// Whether `class` is matched by a rule's error list.
///
/// `States.ALL` matches everything except `States.Runtime`; the fatal
/// classes are never matched.
pub fn matches_error(error_equals: &[String], class: &str) -> bool {
    if error_class::is_fatal(class) {
        return false;
    }
    error_equals
        .iter()
        .any(|e| e == class || (e == error_class::ALL && class != error_class::RUNTIME))
}

/// Delay before retry number `retry_number` (1-based) under `rule`.
pub fn backoff_delay(rule: &RetryRule, retry_number: u32) -> Duration {
    let exponent = retry_number.saturating_sub(1) as i32;
    let secs = rule.interval_seconds * rule.backoff_rate.powi(exponent);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// First catch rule matching `class`, in declaration order.
pub fn find_catch<'a>(rules: &'a [CatchRule], class: &str) -> Option<&'a CatchRule> {
    rules.iter().find(|r| matches_error(&r.error_equals, class))
}

/// Per-visit retry bookkeeping for one Task state.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    retries_used: Vec<u32>,
}

impl RetryTracker {
    pub fn new(rules: &[RetryRule]) -> Self {
        Self {
            retries_used: vec![0; rules.len()],
        }
    }

    /// Decide whether a failure with `class` is retried.
    ///
    /// Returns the delay before the next attempt and consumes one retry of
    /// the first matching rule, or `None` when no rule matches or the
    /// matching rule is exhausted.
    pub fn next_delay(&mut self, rules: &[RetryRule], class: &str) -> Option<Duration> {
        let (idx, rule) = rules
            .iter()
            .enumerate()
            .find(|(_, r)| matches_error(&r.error_equals, class))?;
        let used = self.retries_used.get_mut(idx)?;
        if *used + 1 >= rule.max_attempts {
            return None;
        }
        *used += 1;
        Some(backoff_delay(rule, *used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry(classes: &[&str], interval: f64, max: u32, rate: f64) -> RetryRule {
        RetryRule {
            error_equals: classes.iter().map(|s| s.to_string()).collect(),
            interval_seconds: interval,
            max_attempts: max,
            backoff_rate: rate,
        }
    }

    #[test]
    fn test_all_excludes_runtime_and_fatal() {
        let all = vec![error_class::ALL.to_string()];
        assert!(matches_error(&all, error_class::TASK_FAILED));
        assert!(matches_error(&all, "InvalidFrameworkError"));
        assert!(!matches_error(&all, error_class::RUNTIME));
        assert!(!matches_error(&all, error_class::NO_CHOICE_MATCHED));
        assert!(!matches_error(&all, error_class::ABORTED));

        let runtime = vec![error_class::RUNTIME.to_string()];
        assert!(matches_error(&runtime, error_class::RUNTIME));
    }

    #[test]
    fn test_backoff_sequence() {
        let rule = retry(&[error_class::ALL], 1.0, 4, 2.0);
        assert_eq!(backoff_delay(&rule, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&rule, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&rule, 3), Duration::from_secs(4));
    }

    #[test]
    fn test_tracker_honours_max_attempts() {
        let rules = vec![retry(&[error_class::TASK_FAILED], 1.0, 3, 2.0)];
        let mut tracker = RetryTracker::new(&rules);
        assert_eq!(
            tracker.next_delay(&rules, error_class::TASK_FAILED),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            tracker.next_delay(&rules, error_class::TASK_FAILED),
            Some(Duration::from_secs(2))
        );
        assert_eq!(tracker.next_delay(&rules, error_class::TASK_FAILED), None);
    }

    #[test]
    fn test_tracker_counts_per_rule() {
        let rules = vec![
            retry(&[error_class::TIMEOUT], 0.5, 2, 1.0),
            retry(&[error_class::ALL], 1.0, 2, 1.0),
        ];
        let mut tracker = RetryTracker::new(&rules);
        assert!(tracker.next_delay(&rules, error_class::TIMEOUT).is_some());
        assert!(tracker.next_delay(&rules, error_class::TIMEOUT).is_none());
        // The ALL rule has its own budget.
        assert!(tracker.next_delay(&rules, error_class::TASK_FAILED).is_some());
        assert!(tracker.next_delay(&rules, error_class::TASK_FAILED).is_none());
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let rules = vec![retry(&[error_class::ALL], 1.0, 1, 2.0)];
        let mut tracker = RetryTracker::new(&rules);
        assert!(tracker.next_delay(&rules, error_class::TASK_FAILED).is_none());
    }

    #[test]
    fn test_find_catch_in_order() {
        let rules = vec![
            CatchRule {
                error_equals: vec![error_class::TIMEOUT.to_string()],
                next: "HandleTimeout".into(),
                result_path: None,
            },
            CatchRule {
                error_equals: vec![error_class::ALL.to_string()],
                next: "Failed".into(),
                result_path: Some("$.error".into()),
            },
        ];
        assert_eq!(find_catch(&rules, error_class::TIMEOUT).unwrap().next, "HandleTimeout");
        assert_eq!(find_catch(&rules, error_class::TASK_FAILED).unwrap().next, "Failed");
        assert!(find_catch(&rules, error_class::RUNTIME).is_none());
    }
}
