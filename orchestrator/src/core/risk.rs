//! Risk gating: decide whether a new task may run without approval.

use serde::{Deserialize, Serialize};

use crate::core::path_policy::PathPolicy;
use crate::core::types::{RiskLevel, TaskState, TaskType};

/// Step budget above which a task needs approval.
pub const STRICT_MAX_STEPS: u32 = 8;
/// Wall-clock budget (minutes) above which a task needs approval.
pub const STRICT_MAX_MINUTES: u32 = 20;

const HIGH_RISK_HINTS: &[&str] = &[
    "pip install",
    "npm install",
    "cargo install",
    "apt ",
    "brew ",
    "network",
    "internet",
    ".env",
    "config.yaml",
    "deploy",
    "migration",
    "database",
    "production",
    "secret",
    "credential",
];

const LARGE_CHANGE_HINTS: &[&str] = &["across the repo", "all files", "large refactor"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskProfile {
    /// Classify; low-risk tasks skip approval.
    #[default]
    Strict,
    /// Every task waits for approval.
    Manual,
}

#[derive(Debug, Clone, Copy)]
pub struct RiskInput<'a> {
    pub goal: &'a str,
    pub task_type: TaskType,
    pub max_steps: u32,
    pub max_minutes: u32,
    pub force_draft: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub reasons: Vec<String>,
    pub initial_state: TaskState,
}

pub fn assess(profile: RiskProfile, input: RiskInput<'_>, policy: &PathPolicy) -> RiskAssessment {
    let mut reasons = Vec::new();
    let goal = input.goal.to_lowercase();

    if input.max_steps > STRICT_MAX_STEPS {
        reasons.push(format!("max_steps {} > {STRICT_MAX_STEPS}", input.max_steps));
    }
    if input.max_minutes > STRICT_MAX_MINUTES {
        reasons.push(format!(
            "max_minutes {} > {STRICT_MAX_MINUTES}",
            input.max_minutes
        ));
    }
    for hint in HIGH_RISK_HINTS {
        if goal.contains(hint) {
            reasons.push(format!("goal mentions '{}'", hint.trim()));
        }
    }
    for hint in LARGE_CHANGE_HINTS {
        if goal.contains(hint) {
            reasons.push(format!("large change: '{hint}'"));
        }
    }
    for token in path_like_tokens(input.goal) {
        if policy.is_denied(&token) {
            reasons.push(format!("goal references protected path '{token}'"));
        }
    }
    reasons.dedup();

    let level = if reasons.is_empty() {
        RiskLevel::Low
    } else {
        RiskLevel::High
    };

    let mut draft_reasons = Vec::new();
    if input.force_draft {
        draft_reasons.push("draft requested by submitter".to_string());
    }
    if input.task_type.profile().always_draft {
        draft_reasons.push(format!("{} tasks always need approval", input.task_type));
    }
    if profile == RiskProfile::Manual {
        draft_reasons.push("manual risk profile".to_string());
    }

    let initial_state = if level == RiskLevel::Low && draft_reasons.is_empty() {
        TaskState::Pending
    } else {
        TaskState::Draft
    };
    reasons.extend(draft_reasons);

    RiskAssessment {
        level,
        reasons,
        initial_state,
    }
}

/// Words of the goal that look like repo paths (`a/b`, `name.ext`).
fn path_like_tokens(goal: &str) -> Vec<String> {
    goal.split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| {
                matches!(c, '`' | '\'' | '"' | ',' | ';' | ':' | '(' | ')' | '!' | '?')
            })
            .trim_end_matches('.')
            .to_string()
        })
        .filter(|word| !word.is_empty() && (word.contains('/') || word.contains('.')))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::path_policy::PolicyMode;

    fn policy() -> PathPolicy {
        PathPolicy::new(
            PolicyMode::AllowAllWithDenylist,
            &[],
            &[".env".to_string(), "secrets/**".to_string()],
        )
        .expect("policy")
    }

    fn input(goal: &str) -> RiskInput<'_> {
        RiskInput {
            goal,
            task_type: TaskType::RepoChange,
            max_steps: 8,
            max_minutes: 20,
            force_draft: false,
        }
    }

    #[test]
    fn small_task_starts_pending() {
        let out = assess(RiskProfile::Strict, input("fix failing test"), &policy());
        assert_eq!(out.level, RiskLevel::Low);
        assert_eq!(out.initial_state, TaskState::Pending);
        assert!(out.reasons.is_empty());
    }

    #[test]
    fn large_budget_needs_approval() {
        let mut req = input("fix failing test");
        req.max_steps = 9;
        let out = assess(RiskProfile::Strict, req, &policy());
        assert_eq!(out.level, RiskLevel::High);
        assert_eq!(out.initial_state, TaskState::Draft);
        assert_eq!(out.reasons, vec!["max_steps 9 > 8".to_string()]);
    }

    #[test]
    fn hints_and_protected_paths_raise_risk() {
        let out = assess(
            RiskProfile::Strict,
            input("rotate keys in `secrets/prod.key` for production"),
            &policy(),
        );
        assert_eq!(out.level, RiskLevel::High);
        assert!(out.reasons.iter().any(|r| r.contains("production")));
        assert!(out.reasons.iter().any(|r| r.contains("secrets/prod.key")));
    }

    #[test]
    fn force_draft_and_manual_profile_override_low_risk() {
        let mut req = input("fix failing test");
        req.force_draft = true;
        let forced = assess(RiskProfile::Strict, req, &policy());
        assert_eq!(forced.level, RiskLevel::Low);
        assert_eq!(forced.initial_state, TaskState::Draft);

        let manual = assess(RiskProfile::Manual, input("fix failing test"), &policy());
        assert_eq!(manual.initial_state, TaskState::Draft);
    }

    #[test]
    fn skill_tasks_always_draft() {
        let mut req = input("add a summarize skill");
        req.task_type = TaskType::SkillChange;
        let out = assess(RiskProfile::Strict, req, &policy());
        assert_eq!(out.initial_state, TaskState::Draft);
    }
}
