//! Pure decision taken after each completed step.

use crate::core::budget::Budget;
use crate::core::types::{FinishRoute, StepSignal, TaskMetrics, TaskState};

/// Everything the decision needs from one step, already validated.
#[derive(Debug, Clone)]
pub struct StepObservation<'a> {
    /// Signal after block reconciliation.
    pub signal: &'a StepSignal,
    pub tests_passed: bool,
    /// Failure text from skill validation; `Some` makes the step ineligible to finish.
    pub validation_failure: Option<&'a str>,
    /// Summarised test output, carried forward as the next step's failure context.
    pub test_summary: &'a str,
    pub steps_taken: u32,
    pub metrics: TaskMetrics,
    pub budget: Budget,
    pub finish: FinishRoute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDecision {
    /// Run another step, optionally with failure context.
    Continue { prior_failure: Option<String> },
    /// Validation accepted the work; move to the given state.
    Finish { to: TaskState },
    Block { reason: String },
    Timeout { reason: String },
}

impl StepDecision {
    pub fn label(&self) -> &'static str {
        match self {
            StepDecision::Continue { .. } => "continue",
            StepDecision::Finish { .. } => "finish",
            StepDecision::Block { .. } => "block",
            StepDecision::Timeout { .. } => "timeout",
        }
    }
}

pub fn decide(obs: &StepObservation<'_>) -> StepDecision {
    if let StepSignal::Blocked(reason) = obs.signal {
        return StepDecision::Block {
            reason: reason.clone(),
        };
    }

    let accepted = obs.tests_passed && obs.validation_failure.is_none();
    if *obs.signal == StepSignal::Done && accepted {
        let to = match obs.finish {
            FinishRoute::Complete => TaskState::Completed,
            FinishRoute::MergeGate => TaskState::WaitingMerge,
        };
        return StepDecision::Finish { to };
    }

    if let Err(err) = obs.budget.check_next_step(obs.steps_taken, &obs.metrics) {
        return StepDecision::Timeout {
            reason: err.to_string(),
        };
    }

    let prior_failure = if !obs.tests_passed {
        Some(format!("Tests failed:\n{}", obs.test_summary))
    } else {
        obs.validation_failure
            .map(|failure| format!("Validation failed:\n{failure}"))
    };
    StepDecision::Continue { prior_failure }
}
