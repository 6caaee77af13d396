//! Text summaries: test output digests, tails, and completion summaries.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{CompletionSummary, TaskMetrics};

static COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d+)\s+(passed|failed|errors?|skipped)\b").expect("count regex")
});

static EXCEPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*(Error|Exception|Failure):").expect("exception regex")
});

/// Last `max_chars` characters of `text`, trimmed.
pub fn tail(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

/// First `max_chars` characters of `text`.
pub fn head(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Goal collapsed to one line and capped at 72 characters, for commit subjects.
pub fn goal_short(goal: &str) -> String {
    let one_line = goal.split_whitespace().collect::<Vec<_>>().join(" ");
    if one_line.is_empty() {
        return "task".to_string();
    }
    head(&one_line, 72)
}

/// The last line that looks like a test-run summary (`3 passed, 1 failed in 0.4s`,
/// `test result: ok. 3 passed; 0 failed`).
pub fn summary_line(output: &str) -> Option<String> {
    output.lines().rev().find_map(|line| {
        let cleaned = line.trim().trim_matches('=').trim();
        let looks_like_summary = cleaned.contains(" in ") || cleaned.starts_with("test result:");
        (COUNT_RE.is_match(cleaned) && looks_like_summary).then(|| cleaned.to_string())
    })
}

/// Passed/failed counts from a test summary line, when one exists.
pub fn test_counts(output: &str) -> (Option<u32>, Option<u32>) {
    let Some(line) = summary_line(output) else {
        return (None, None);
    };
    let mut passed = None;
    let mut failed = None;
    for caps in COUNT_RE.captures_iter(&line) {
        let Ok(n) = caps[1].parse::<u32>() else {
            continue;
        };
        match &caps[2] {
            "passed" => passed = Some(passed.unwrap_or(0) + n),
            "failed" | "error" | "errors" => failed = Some(failed.unwrap_or(0) + n),
            _ => {}
        }
    }
    if passed.is_some() && failed.is_none() {
        failed = Some(0);
    }
    (passed, failed)
}

/// Compact digest of test output: summary line plus the first failure lines,
/// or the tail when nothing recognisable is found.
pub fn summarize_test_output(output: &str, tail_chars: usize) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let mut failures = Vec::new();
    let mut seen = HashSet::new();
    for line in trimmed.lines().map(str::trim) {
        let is_failure = line.starts_with("FAILED ")
            || line.starts_with("ERROR ")
            || (line.starts_with("test ") && line.ends_with("... FAILED"))
            || EXCEPTION_RE.is_match(line);
        if is_failure && seen.insert(line) {
            failures.push(line);
        }
    }

    let summary = summary_line(trimmed);
    let digest = match (&summary, failures.is_empty()) {
        (Some(line), true) => line.clone(),
        (None, true) => return tail(trimmed, tail_chars),
        (summary, false) => {
            let mut parts = Vec::new();
            if let Some(line) = summary {
                parts.push(format!("Summary: {line}"));
            }
            parts.extend(failures.iter().take(4).map(|line| (*line).to_string()));
            parts.join("\n")
        }
    };
    head(&digest, tail_chars)
}

pub fn build_completion_summary(
    goal: &str,
    steps: u32,
    changed_files: &[String],
    test_output: &str,
    metrics: &TaskMetrics,
) -> CompletionSummary {
    let (tests_passed, tests_failed) = test_counts(test_output);
    CompletionSummary {
        goal: goal.split_whitespace().collect::<Vec<_>>().join(" "),
        steps,
        changed_files: changed_files.to_vec(),
        tests_passed,
        tests_failed,
        agent_secs: metrics.agent_ms as f64 / 1000.0,
        test_secs: metrics.test_ms as f64 / 1000.0,
        elapsed_secs: metrics.elapsed_ms as f64 / 1000.0,
    }
}

/// One-line rendering used in task summaries and reports.
pub fn render_completion(summary: &CompletionSummary) -> String {
    let mut parts = vec![
        format!("Goal: {}", head(&summary.goal, 120)),
        format!("Completed in {} step(s)", summary.steps),
    ];
    if !summary.changed_files.is_empty() {
        let shown: Vec<_> = summary
            .changed_files
            .iter()
            .take(10)
            .map(|f| format!("`{f}`"))
            .collect();
        let mut files = format!(
            "Changed files ({}): {}",
            summary.changed_files.len(),
            shown.join(", ")
        );
        if summary.changed_files.len() > 10 {
            files.push_str(&format!(" and {} more", summary.changed_files.len() - 10));
        }
        parts.push(files);
    }
    if let (Some(passed), Some(failed)) = (summary.tests_passed, summary.tests_failed) {
        parts.push(format!("Tests: {passed} passed, {failed} failed"));
    }
    parts.push(format!(
        "Timing: agent {:.1}s | tests {:.1}s | total {:.1}s",
        summary.agent_secs, summary.test_secs, summary.elapsed_secs
    ));
    parts.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYTEST_FAIL: &str = "\
============================= test session starts ==============================
collected 3 items

tests/test_math.py .F.                                                   [100%]

FAILED tests/test_math.py::test_add - AssertionError: assert 3 == 4
AssertionError: assert 3 == 4
========================= 1 failed, 2 passed in 0.12s ==========================
";

    #[test]
    fn pytest_failures_are_summarised() {
        let digest = summarize_test_output(PYTEST_FAIL, 1200);
        assert_eq!(
            digest,
            "Summary: 1 failed, 2 passed in 0.12s\n\
             FAILED tests/test_math.py::test_add - AssertionError: assert 3 == 4\n\
             AssertionError: assert 3 == 4"
        );
        assert_eq!(test_counts(PYTEST_FAIL), (Some(2), Some(1)));
    }

    #[test]
    fn cargo_test_result_line_counts() {
        let out = "running 4 tests\n....\ntest result: ok. 4 passed; 0 failed; 0 ignored\n";
        assert_eq!(test_counts(out), (Some(4), Some(0)));
        assert_eq!(
            summarize_test_output(out, 1200),
            "test result: ok. 4 passed; 0 failed; 0 ignored"
        );
    }

    #[test]
    fn unrecognised_output_falls_back_to_tail() {
        assert_eq!(summarize_test_output("abcdef", 3), "def");
        assert_eq!(test_counts("exit=1"), (None, None));
    }

    #[test]
    fn goal_short_collapses_whitespace_and_caps_length() {
        assert_eq!(goal_short("  fix\n the   test "), "fix the test");
        assert_eq!(goal_short("   "), "task");
        assert_eq!(goal_short(&"x".repeat(100)).chars().count(), 72);
    }

    #[test]
    fn completion_summary_renders_counts_and_timing() {
        let metrics = TaskMetrics {
            agent_ms: 1500,
            test_ms: 500,
            elapsed_ms: 2500,
        };
        let summary = build_completion_summary(
            "fix failing test",
            2,
            &["src/lib.rs".to_string()],
            "3 passed in 0.01s",
            &metrics,
        );
        assert_eq!(summary.tests_passed, Some(3));
        assert_eq!(summary.tests_failed, Some(0));
        assert_eq!(
            render_completion(&summary),
            "Goal: fix failing test | Completed in 2 step(s) | Changed files (1): `src/lib.rs` \
             | Tests: 3 passed, 0 failed | Timing: agent 1.5s | tests 0.5s | total 2.5s"
        );
    }
}
