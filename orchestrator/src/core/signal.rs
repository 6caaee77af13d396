//! Agent output protocol: `TASK_STATE:` / `BLOCK_REASON:` marker lines.
//!
//! Agent output is untrusted free text. A missing or malformed marker means
//! `CONTINUE`; the last marker wins when the agent prints several.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::StepSignal;

static STATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\s*TASK_STATE:\s*(DONE|BLOCKED|CONTINUE)\s*$").expect("state marker regex")
});

static REASON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\s*BLOCK_REASON:\s*(.+?)\s*$").expect("block reason regex")
});

/// Block reasons caused by the sandbox or host rather than the task.
const ENVIRONMENT_HINTS: &[&str] = &[
    "sandbox",
    "socket-bind",
    "127.0.0.1",
    "permissionerror",
    "operation not permitted",
    "environment-specific",
];

/// Block reasons that need a human no matter what the tests say.
const MISSING_INPUT_HINTS: &[&str] = &[
    "missing content",
    "missing context",
    "missing dependency",
    "missing file",
    "missing api key",
    "missing credential",
    "need user input",
];

pub fn parse_agent_signal(text: &str) -> StepSignal {
    let Some(state) = STATE_RE
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_uppercase())
    else {
        return StepSignal::Continue;
    };
    match state.as_str() {
        "DONE" => StepSignal::Done,
        "BLOCKED" => {
            let reason = REASON_RE
                .captures_iter(text)
                .last()
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "agent reported blocked".to_string());
            StepSignal::Blocked(reason)
        }
        _ => StepSignal::Continue,
    }
}

/// Outcome of reconciling the agent's signal with the runtime's own tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub signal: StepSignal,
    /// Set when a `BLOCKED` signal was discarded.
    pub overridden_from: Option<String>,
}

/// Passing runtime tests are authoritative over an environment-caused block.
///
/// The override yields `DONE` when the step changed files and `CONTINUE`
/// otherwise. Blocks that ask for missing context are never overridden.
pub fn reconcile_block(
    signal: StepSignal,
    agent_text: &str,
    tests_passed: bool,
    changed_files: usize,
) -> Reconciled {
    let StepSignal::Blocked(reason) = &signal else {
        return Reconciled {
            signal,
            overridden_from: None,
        };
    };
    if !tests_passed || !is_environment_block(agent_text, reason) {
        return Reconciled {
            signal,
            overridden_from: None,
        };
    }
    let reason = reason.clone();
    let signal = if changed_files > 0 {
        StepSignal::Done
    } else {
        StepSignal::Continue
    };
    Reconciled {
        signal,
        overridden_from: Some(reason),
    }
}

fn is_environment_block(agent_text: &str, reason: &str) -> bool {
    let hay = if reason.trim().is_empty() {
        agent_text.to_lowercase()
    } else {
        reason.to_lowercase()
    };
    if hay.trim().is_empty() {
        return false;
    }
    ENVIRONMENT_HINTS.iter().any(|hint| hay.contains(hint))
        && !MISSING_INPUT_HINTS.iter().any(|hint| hay.contains(hint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_marker_means_continue() {
        assert_eq!(parse_agent_signal("edited files, ran nothing"), StepSignal::Continue);
        assert_eq!(parse_agent_signal("TASK_STATE: MAYBE"), StepSignal::Continue);
    }

    #[test]
    fn parses_done_and_blocked_with_reason() {
        assert_eq!(
            parse_agent_signal("all good\n  task_state: done  \n"),
            StepSignal::Done
        );
        let text = "TASK_STATE: BLOCKED\nBLOCK_REASON: missing API key for provider\n";
        assert_eq!(
            parse_agent_signal(text),
            StepSignal::Blocked("missing API key for provider".to_string())
        );
        assert_eq!(
            parse_agent_signal("TASK_STATE: BLOCKED"),
            StepSignal::Blocked("agent reported blocked".to_string())
        );
    }

    #[test]
    fn last_marker_wins() {
        let text = "TASK_STATE: CONTINUE\nmore work\nTASK_STATE: DONE\n";
        assert_eq!(parse_agent_signal(text), StepSignal::Done);
    }

    #[test]
    fn sandbox_block_is_overridden_when_tests_pass() {
        let signal = StepSignal::Blocked("sandbox denies socket-bind on 127.0.0.1".to_string());
        let out = reconcile_block(signal.clone(), "", true, 2);
        assert_eq!(out.signal, StepSignal::Done);
        assert!(out.overridden_from.is_some());

        let out = reconcile_block(signal.clone(), "", true, 0);
        assert_eq!(out.signal, StepSignal::Continue);

        let out = reconcile_block(signal.clone(), "", false, 2);
        assert_eq!(out.signal, signal);
        assert_eq!(out.overridden_from, None);
    }

    #[test]
    fn missing_context_block_is_kept() {
        let signal = StepSignal::Blocked("sandbox: missing credential for deploy".to_string());
        let out = reconcile_block(signal.clone(), "", true, 1);
        assert_eq!(out.signal, signal);
    }
}
