//! Retry and catch policy matching
//!
//! On an error thrown by a Task, Debate, Map, or Parallel body, retry rules
//! are consulted in order: the first matching rule with attempts remaining
//! schedules a backoff delay and a re-invocation. A matching-but-exhausted
//! rule falls through to later rules, which is why `States.ALL` matches
//! last by convention. When no retry applies, catch rules route the error
//! to a fallback state; otherwise it propagates.
//!
//! Attempt bookkeeping lives in [`AttemptLog`], created fresh on every
//! state entry - the parsed `RetrySpec`s are never mutated, and entering a
//! state afresh (not via retry) clears all counters.

use std::time::Duration;

use rand::Rng;

use crate::definition::{CatchSpec, JitterStrategy, RetrySpec};
use crate::error::ExecutionError;

/// Per-rule attempt counters and decorrelated-jitter memory for one state
/// entry.
#[derive(Debug)]
pub struct AttemptLog {
    attempts: Vec<u32>,
    previous_delay: Vec<f64>,
}

impl AttemptLog {
    pub fn new(rule_count: usize) -> Self {
        Self {
            attempts: vec![0; rule_count],
            previous_delay: vec![0.0; rule_count],
        }
    }

    /// Attempts consumed so far against rule `index`.
    pub fn attempts(&self, index: usize) -> u32 {
        self.attempts.get(index).copied().unwrap_or(0)
    }
}

/// A scheduled retry: which rule matched and how long to sleep.
#[derive(Debug, PartialEq)]
pub struct PlannedRetry {
    pub rule_index: usize,
    /// 1-based attempt number about to be consumed
    pub attempt: u32,
    pub delay: Duration,
}

/// Match an error against the retry rules, consuming an attempt from the
/// first applicable rule. `None` means no rule has attempts left for this
/// error.
pub fn plan_retry(
    rules: &[RetrySpec],
    log: &mut AttemptLog,
    error: &ExecutionError,
) -> Option<PlannedRetry> {
    for (index, rule) in rules.iter().enumerate() {
        if !rule.matches(&error.code) {
            continue;
        }
        let attempt = log.attempts[index];
        if attempt >= rule.max_attempts {
            continue;
        }
        let delay = compute_delay(rule, attempt, &mut log.previous_delay[index]);
        log.attempts[index] = attempt + 1;
        return Some(PlannedRetry {
            rule_index: index,
            attempt: attempt + 1,
            delay: Duration::from_secs_f64(delay),
        });
    }
    None
}

/// `base * rate^attempt`, capped by `MaxDelaySeconds`, then jittered.
fn compute_delay(rule: &RetrySpec, attempt: u32, previous: &mut f64) -> f64 {
    let raw = rule.interval_seconds * rule.backoff_rate.powi(attempt as i32);
    let cap = rule.max_delay_seconds.unwrap_or(f64::INFINITY);
    let capped = raw.min(cap);

    let jittered = match rule.jitter_strategy {
        JitterStrategy::None => capped,
        JitterStrategy::Full => rand::thread_rng().gen_range(0.0..=capped.max(f64::MIN_POSITIVE)),
        JitterStrategy::Decorrelated => {
            let base = rule.interval_seconds;
            let high = (*previous * 3.0).max(base);
            let drawn = if high > base {
                rand::thread_rng().gen_range(base..=high)
            } else {
                base
            };
            drawn.min(cap)
        }
    };

    *previous = jittered;
    jittered.max(0.0)
}

/// First catch rule matching the error code, if any.
pub fn find_catch<'a>(rules: &'a [CatchSpec], code: &str) -> Option<&'a CatchSpec> {
    rules.iter().find(|rule| rule.matches(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use serde_json::json;

    fn rule(value: serde_json::Value) -> RetrySpec {
        serde_json::from_value(value).unwrap()
    }

    fn timeout_error() -> ExecutionError {
        ExecutionError::timeout("slow agent")
    }

    #[test]
    fn test_backoff_progression_without_jitter() {
        let rules = vec![rule(json!({
            "ErrorEquals": ["States.Timeout"],
            "IntervalSeconds": 1.0,
            "BackoffRate": 2.0,
            "MaxAttempts": 4
        }))];
        let mut log = AttemptLog::new(1);

        let delays: Vec<f64> = (0..4)
            .map(|_| {
                plan_retry(&rules, &mut log, &timeout_error())
                    .unwrap()
                    .delay
                    .as_secs_f64()
            })
            .collect();
        assert_eq!(delays, vec![1.0, 2.0, 4.0, 8.0]);

        // Attempts exhausted.
        assert_eq!(plan_retry(&rules, &mut log, &timeout_error()), None);
    }

    #[test]
    fn test_max_delay_caps_backoff() {
        let rules = vec![rule(json!({
            "ErrorEquals": ["States.Timeout"],
            "IntervalSeconds": 10.0,
            "BackoffRate": 2.0,
            "MaxAttempts": 5,
            "MaxDelaySeconds": 15.0
        }))];
        let mut log = AttemptLog::new(1);

        let mut last = 0.0;
        for _ in 0..5 {
            last = plan_retry(&rules, &mut log, &timeout_error())
                .unwrap()
                .delay
                .as_secs_f64();
        }
        assert_eq!(last, 15.0);
    }

    #[test]
    fn test_non_matching_code_is_not_retried() {
        let rules = vec![rule(json!({"ErrorEquals": ["States.Timeout"]}))];
        let mut log = AttemptLog::new(1);
        let err = ExecutionError::task_failed("other failure");
        assert_eq!(plan_retry(&rules, &mut log, &err), None);
    }

    #[test]
    fn test_exhausted_rule_falls_through_to_wildcard() {
        let rules = vec![
            rule(json!({"ErrorEquals": ["States.Timeout"], "MaxAttempts": 1})),
            rule(json!({"ErrorEquals": ["States.ALL"], "MaxAttempts": 2, "IntervalSeconds": 5.0})),
        ];
        let mut log = AttemptLog::new(2);

        let first = plan_retry(&rules, &mut log, &timeout_error()).unwrap();
        assert_eq!(first.rule_index, 0);

        // Specific rule exhausted; the wildcard picks up with its own
        // counter and interval.
        let second = plan_retry(&rules, &mut log, &timeout_error()).unwrap();
        assert_eq!(second.rule_index, 1);
        assert_eq!(second.attempt, 1);
        assert_eq!(second.delay.as_secs_f64(), 5.0);
        assert_eq!(log.attempts(0), 1);
        assert_eq!(log.attempts(1), 1);
    }

    #[test]
    fn test_full_jitter_stays_within_bounds() {
        let rules = vec![rule(json!({
            "ErrorEquals": ["States.ALL"],
            "IntervalSeconds": 4.0,
            "BackoffRate": 1.0,
            "MaxAttempts": 100,
            "JitterStrategy": "FULL"
        }))];
        let mut log = AttemptLog::new(1);
        for _ in 0..50 {
            let planned = plan_retry(&rules, &mut log, &timeout_error()).unwrap();
            let secs = planned.delay.as_secs_f64();
            assert!((0.0..=4.0).contains(&secs), "delay {secs} out of range");
        }
    }

    #[test]
    fn test_decorrelated_jitter_bounded_by_cap() {
        let rules = vec![rule(json!({
            "ErrorEquals": ["States.ALL"],
            "IntervalSeconds": 1.0,
            "MaxAttempts": 100,
            "MaxDelaySeconds": 6.0,
            "JitterStrategy": "DECORRELATED"
        }))];
        let mut log = AttemptLog::new(1);
        for _ in 0..50 {
            let planned = plan_retry(&rules, &mut log, &timeout_error()).unwrap();
            let secs = planned.delay.as_secs_f64();
            assert!((1.0..=6.0).contains(&secs), "delay {secs} out of range");
        }
    }

    #[test]
    fn test_find_catch_first_match_wins() {
        let catches: Vec<CatchSpec> = serde_json::from_value(json!([
            {"ErrorEquals": ["CustomError"], "Next": "Specific"},
            {"ErrorEquals": ["States.ALL"], "Next": "Fallback"}
        ]))
        .unwrap();

        assert_eq!(find_catch(&catches, "CustomError").unwrap().next, "Specific");
        assert_eq!(
            find_catch(&catches, codes::TIMEOUT).unwrap().next,
            "Fallback"
        );
        assert!(find_catch(&catches[..1], codes::TIMEOUT).is_none());
    }
}
