//! Step prompt rendering.
//!
//! Each task type has its own template. Rendered output is split on
//! `<!-- section:KEY required|droppable -->` markers so optional context can
//! be dropped when the prompt exceeds its byte budget.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::types::TaskType;

const CONTRACT_TEMPLATE: &str = include_str!("prompts/contract.md");
const ARTIFACT_TEMPLATE: &str = include_str!("prompts/artifact.md");
const REPO_CHANGE_TEMPLATE: &str = include_str!("prompts/repo_change.md");
const SKILL_CHANGE_TEMPLATE: &str = include_str!("prompts/skill_change.md");

/// Drop order when over budget.
const DROP_ORDER: [&str; 3] = ["block_hint", "failure", "resume"];
const TRUNCATION_MARKER: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
});

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("contract", CONTRACT_TEMPLATE)
        .expect("contract template should be valid");
    env.add_template("artifact", ARTIFACT_TEMPLATE)
        .expect("artifact template should be valid");
    env.add_template("repo_change", REPO_CHANGE_TEMPLATE)
        .expect("repo_change template should be valid");
    env.add_template("skill_change", SKILL_CHANGE_TEMPLATE)
        .expect("skill_change template should be valid");
    env
});

/// Everything a step prompt is built from.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub task_id: String,
    pub task_type: TaskType,
    pub goal: String,
    /// 1-based index of the step being prompted.
    pub step: u32,
    pub max_steps: u32,
    pub test_command: String,
    pub prior_failure: Option<String>,
    pub resume_instruction: Option<String>,
    /// Reason the task was blocked before it was resumed.
    pub block_hint: Option<String>,
    pub skill_name: Option<String>,
    pub skills_dir: String,
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

/// Render the step prompt for `input` within `budget_bytes`.
pub fn render_step_prompt(input: &PromptInputs, budget_bytes: usize) -> Result<String> {
    let template = ENGINE.get_template(input.task_type.as_str())?;
    let non_empty = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let rendered = template.render(context! {
        task_id => input.task_id,
        goal => input.goal.trim(),
        step => input.step,
        max_steps => input.max_steps,
        test_command => input.test_command,
        failure => non_empty(&input.prior_failure),
        resume => non_empty(&input.resume_instruction),
        block_hint => non_empty(&input.block_hint),
        skill_name => input.skill_name.as_deref().unwrap_or("skill"),
        skills_dir => input.skills_dir,
    })?;

    let mut sections = parse_sections(&rendered);
    apply_budget(&mut sections, budget_bytes);
    Ok(sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n"))
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    let total = |secs: &[Section]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section for budget"
            );
            sections.remove(idx);
        }
    }

    if total(sections) <= budget {
        return;
    }
    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(rest.iter().map(|s| s.content.len()).sum());
    let before_len = last.content.len();
    if allowed > TRUNCATION_MARKER.len() {
        let cut = floor_char_boundary(&last.content, allowed - TRUNCATION_MARKER.len());
        last.content.truncate(cut);
        last.content.push_str(TRUNCATION_MARKER);
    } else {
        let cut = floor_char_boundary(&last.content, allowed);
        last.content.truncate(cut);
    }
    debug!(
        section = %last.key,
        before_len,
        after_len = last.content.len(),
        "truncated prompt section for budget"
    );
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    (0..=index)
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(task_type: TaskType) -> PromptInputs {
        PromptInputs {
            task_id: "t-1".to_string(),
            task_type,
            goal: "fix the failing parser test".to_string(),
            step: 2,
            max_steps: 8,
            test_command: "cargo test".to_string(),
            prior_failure: Some("Tests failed:\n1 failed in 0.1s".to_string()),
            resume_instruction: Some("only touch src/parser.rs".to_string()),
            block_hint: None,
            skill_name: None,
            skills_dir: "skills".to_string(),
        }
    }

    /// Verifies sections render in template order with the marker protocol.
    #[test]
    fn repo_change_prompt_has_all_sections_in_order() {
        let prompt = render_step_prompt(&inputs(TaskType::RepoChange), 16_000).expect("render");
        let contract = prompt.find("### Contract").expect("contract");
        let goal = prompt.find("### Goal").expect("goal");
        let step = prompt.find("Current step: 2/8").expect("step");
        let resume = prompt.find("only touch src/parser.rs").expect("resume");
        let failure = prompt.find("1 failed in 0.1s").expect("failure");
        assert!(contract < goal && goal < step && step < resume && resume < failure);
        assert!(prompt.contains("TASK_STATE: CONTINUE|DONE|BLOCKED"));
        assert!(prompt.contains("`cargo test`"));
        assert!(!prompt.contains("section:"));
    }

    #[test]
    fn skill_prompt_names_skill_directory() {
        let mut input = inputs(TaskType::SkillChange);
        input.skill_name = Some("weather-report".to_string());
        let prompt = render_step_prompt(&input, 16_000).expect("render");
        assert!(prompt.contains("skills/weather-report/"));
    }

    /// Verifies optional context is dropped before required sections are cut.
    #[test]
    fn tight_budget_drops_optional_context_first() {
        let mut input = inputs(TaskType::RepoChange);
        input.block_hint = Some("missing fixture".repeat(40));
        input.prior_failure = Some("failure ".repeat(200));
        let full = render_step_prompt(&input, 100_000).expect("render");
        assert!(full.contains("### Earlier Block"));

        let prompt = render_step_prompt(&input, 1_400).expect("render");
        assert!(!prompt.contains("### Earlier Block"));
        assert!(!prompt.contains("### Previous Failure"));
        assert!(prompt.contains("### Contract"));
        assert!(prompt.contains("### Goal"));
    }

    #[test]
    fn last_section_is_truncated_when_required_text_overflows() {
        let mut input = inputs(TaskType::RepoChange);
        input.task_id = "ü".repeat(2_000);
        input.prior_failure = None;
        input.resume_instruction = None;
        let prompt = render_step_prompt(&input, 1_500).expect("render");
        assert!(prompt.contains("### Goal"));
        assert!(prompt.ends_with("[truncated]"));
        assert!(prompt.len() < 1_600);
    }
}
