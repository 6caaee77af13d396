//! The task transition table and the decision actions each state exposes.

use crate::core::types::{DecisionAction, TaskState};
use crate::error::RuntimeError;

use TaskState as S;

/// Every state reachable from `from` in one transition.
pub fn allowed_targets(from: TaskState) -> &'static [TaskState] {
    match from {
        S::Draft => &[S::Pending, S::Rejected, S::Stopped],
        S::Pending => &[S::Running, S::Paused, S::Stopped],
        S::Running => &[
            S::Validating,
            S::Blocked,
            S::Paused,
            S::Stopped,
            S::Failed,
            S::Timeout,
            S::Pending,
        ],
        S::Validating => &[
            S::Running,
            S::WaitingMerge,
            S::Completed,
            S::Blocked,
            S::Paused,
            S::Stopped,
            S::Failed,
            S::Timeout,
            S::Pending,
        ],
        S::Paused => &[S::Pending, S::Stopped],
        S::Blocked => &[S::Pending, S::Rejected, S::Stopped],
        S::WaitingMerge => &[S::Merged, S::MergeFailed, S::Discarded, S::Blocked],
        S::MergeFailed => &[S::Discarded],
        S::Completed
        | S::Merged
        | S::Discarded
        | S::Failed
        | S::Timeout
        | S::Stopped
        | S::Rejected => &[],
    }
}

pub fn can_transition(from: TaskState, to: TaskState) -> bool {
    allowed_targets(from).contains(&to)
}

/// Reject a transition that is not in the table.
pub fn check_transition(from: TaskState, to: TaskState) -> Result<(), RuntimeError> {
    if can_transition(from, to) {
        return Ok(());
    }
    Err(RuntimeError::precondition(format!(
        "transition {from} -> {to} is not allowed"
    )))
}

/// Whether entering `to` stamps `ended_at`.
///
/// `WAITING_MERGE` is stamped too so the merge window can be measured; the
/// stamp is cleared again if the task re-enters an active state.
pub fn stamps_ended_at(to: TaskState) -> bool {
    to.is_terminal() || to == S::WaitingMerge
}

/// Decision actions a human may take while the task sits in `state`.
pub fn decision_actions(state: TaskState) -> &'static [DecisionAction] {
    match state {
        S::Draft | S::Blocked => &[
            DecisionAction::Approve,
            DecisionAction::Reject,
            DecisionAction::Suggest,
        ],
        S::WaitingMerge => &[
            DecisionAction::Merge,
            DecisionAction::Discard,
            DecisionAction::RequestChanges,
        ],
        _ => &[],
    }
}

/// Reject an action that the state does not expose.
pub fn check_action(state: TaskState, action: DecisionAction) -> Result<(), RuntimeError> {
    if decision_actions(state).contains(&action) {
        return Ok(());
    }
    Err(RuntimeError::precondition(format!(
        "action '{action}' is not available while task is {state}"
    )))
}
