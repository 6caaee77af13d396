//! Step and wall-clock budget arithmetic.
//!
//! The two budgets are independent guards; exhausting either one ends the
//! task in `TIMEOUT`.

use std::time::Duration;

use crate::core::types::TaskMetrics;
use crate::error::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub max_steps: u32,
    pub max_minutes: u32,
}

impl Budget {
    pub fn wall_clock(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_minutes) * 60)
    }

    /// Wall-clock time left given the metrics accumulated so far.
    pub fn remaining(&self, metrics: &TaskMetrics) -> Duration {
        self.wall_clock()
            .saturating_sub(Duration::from_millis(metrics.elapsed_ms))
    }

    /// Check whether another step may start after `steps_taken` steps.
    pub fn check_next_step(&self, steps_taken: u32, metrics: &TaskMetrics) -> Result<(), RuntimeError> {
        if steps_taken >= self.max_steps {
            return Err(RuntimeError::BudgetExceeded(format!(
                "step budget of {} exhausted",
                self.max_steps
            )));
        }
        if self.remaining(metrics).is_zero() {
            return Err(RuntimeError::BudgetExceeded(format!(
                "wall-clock budget of {} minute(s) exhausted",
                self.max_minutes
            )));
        }
        Ok(())
    }
}

/// Bound an invocation timeout by the wall-clock budget left.
pub fn bounded_timeout(limit: Option<Duration>, remaining: Duration) -> Duration {
    match limit {
        Some(limit) => limit.min(remaining),
        None => remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_budget_blocks_the_next_step() {
        let budget = Budget {
            max_steps: 1,
            max_minutes: 20,
        };
        let metrics = TaskMetrics::default();
        assert!(budget.check_next_step(0, &metrics).is_ok());
        let err = budget.check_next_step(1, &metrics).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::BudgetExceeded("step budget of 1 exhausted".to_string())
        );
    }

    #[test]
    fn wall_clock_uses_accumulated_elapsed_time() {
        let budget = Budget {
            max_steps: 5,
            max_minutes: 1,
        };
        let metrics = TaskMetrics {
            elapsed_ms: 45_000,
            ..TaskMetrics::default()
        };
        assert_eq!(budget.remaining(&metrics), Duration::from_secs(15));
        let spent = TaskMetrics {
            elapsed_ms: 61_000,
            ..TaskMetrics::default()
        };
        assert!(matches!(
            budget.check_next_step(1, &spent),
            Err(RuntimeError::BudgetExceeded(_))
        ));
    }

    #[test]
    fn bounded_timeout_takes_the_smaller_limit() {
        let remaining = Duration::from_secs(30);
        assert_eq!(
            bounded_timeout(Some(Duration::from_secs(600)), remaining),
            remaining
        );
        assert_eq!(
            bounded_timeout(Some(Duration::from_secs(5)), remaining),
            Duration::from_secs(5)
        );
        assert_eq!(bounded_timeout(None, remaining), remaining);
    }
}
