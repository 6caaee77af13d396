//! Lifecycle Controller: task creation and the pause/stop/resume surface.
//!
//! Every state change goes through the store's validated transition; this
//! module decides which change a request maps to given who holds the task.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::core::path_policy::PathPolicy;
use crate::core::risk::{RiskInput, assess};
use crate::core::types::{ControlFlag, TaskSource, TaskState, TaskType};
use crate::decision::DecisionGate;
use crate::error::RuntimeError;
use crate::io::config::RuntimeConfig;
use crate::io::store::{
    self, DecisionRecord, StateChange, TaskInsert, TaskPatch, TaskRecord, TaskStore,
};

/// A task submission.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub goal: String,
    pub task_type: TaskType,
    pub source: TaskSource,
    pub force_draft: bool,
    pub max_steps: Option<u32>,
    pub max_minutes: Option<u32>,
    pub agent: Option<String>,
    pub test_command: Option<String>,
    pub skill_name: Option<String>,
    pub created_by: String,
}

impl NewTask {
    pub fn new(goal: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            goal: goal.into(),
            task_type,
            source: TaskSource::Manual,
            force_draft: false,
            max_steps: None,
            max_minutes: None,
            agent: None,
            test_command: None,
            skill_name: None,
            created_by: "cli".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatedTask {
    pub task: TaskRecord,
    /// Approval token when the task starts in `DRAFT`.
    pub decision: Option<DecisionRecord>,
}

#[derive(Clone)]
pub struct LifecycleController {
    store: TaskStore,
    config: Arc<RuntimeConfig>,
    policy: Arc<PathPolicy>,
    gate: DecisionGate,
}

impl LifecycleController {
    pub fn new(store: TaskStore, config: Arc<RuntimeConfig>) -> Result<Self> {
        let policy = Arc::new(config.path_policy()?);
        let gate = DecisionGate::new(store.clone(), Arc::clone(&config));
        Ok(Self {
            store,
            config,
            policy,
            gate,
        })
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    pub fn gate(&self) -> &DecisionGate {
        &self.gate
    }

    pub fn authorize(&self, actor: &str) -> Result<()> {
        if self.config.is_owner(actor) {
            Ok(())
        } else {
            Err(RuntimeError::Unauthorized(actor.to_string()).into())
        }
    }

    /// Classify, persist, and (for drafts) issue the approval token.
    #[instrument(skip_all, fields(task_type = %new.task_type, source = ?new.source))]
    pub fn create_task(&self, new: NewTask) -> Result<CreatedTask> {
        let goal = new.goal.trim();
        if goal.is_empty() {
            return Err(RuntimeError::precondition("goal must not be empty").into());
        }
        let profile = new.task_type.profile();
        let (default_steps, default_minutes) = match new.task_type {
            TaskType::SkillChange => (
                self.config.skills.default_max_steps,
                self.config.skills.default_max_minutes,
            ),
            TaskType::Artifact | TaskType::RepoChange => (
                self.config.default_max_steps,
                self.config.default_max_minutes,
            ),
        };
        let max_steps = new.max_steps.unwrap_or(default_steps);
        let max_minutes = new.max_minutes.unwrap_or(default_minutes);
        if max_steps == 0 || max_minutes == 0 {
            return Err(RuntimeError::precondition("budgets must be greater than zero").into());
        }
        let skill_name = match new.task_type {
            TaskType::SkillChange => Some(
                new.skill_name
                    .as_deref()
                    .map(skill_slug)
                    .unwrap_or_else(|| skill_slug(goal)),
            ),
            TaskType::Artifact | TaskType::RepoChange => None,
        };

        let assessment = assess(
            self.config.risk_profile,
            RiskInput {
                goal,
                task_type: new.task_type,
                max_steps,
                max_minutes,
                force_draft: new.force_draft,
            },
            &self.policy,
        );

        let agent = new
            .agent
            .or_else(|| self.config.default_agent_name().map(str::to_string));
        let task = self.store.insert_task(&TaskInsert {
            id: new_task_id(),
            goal: goal.to_string(),
            task_type: new.task_type,
            source: new.source,
            state: assessment.initial_state,
            risk_level: assessment.level,
            risk_reasons: assessment.reasons,
            finish: profile.finish,
            validate_skill: profile.validate_skill,
            skill_name,
            force_draft: new.force_draft,
            agent,
            test_command: new
                .test_command
                .unwrap_or_else(|| self.config.default_test_command.clone()),
            max_steps,
            max_minutes,
            created_by: new.created_by,
        })?;

        let decision = if task.state == TaskState::Draft {
            Some(self.gate.issue_system(&task.id, None)?)
        } else {
            None
        };
        info!(
            task_id = %task.id,
            state = %task.state,
            risk = ?task.risk_level,
            "task created"
        );
        Ok(CreatedTask { task, decision })
    }

    /// Pause now if no worker holds the task, else ask the worker to pause.
    #[instrument(skip_all, fields(task_id, actor))]
    pub fn request_pause(&self, task_id: &str, actor: &str) -> Result<TaskRecord> {
        self.authorize(actor)?;
        self.store.write(|tx| {
            let task = store::load_task(tx, task_id)?;
            match task.state {
                TaskState::Pending if task.lease_owner.is_none() => {
                    let change = StateChange::to(TaskState::Paused, actor)
                        .from(TaskState::Pending)
                        .reason("paused before start");
                    store::apply_transition(tx, task_id, &change)?;
                }
                TaskState::Running | TaskState::Validating => {
                    store::update_control(tx, task_id, ControlFlag::PauseRequested, actor)?;
                }
                other => {
                    return Err(RuntimeError::precondition(format!(
                        "cannot pause task {task_id} while it is {other}"
                    ))
                    .into());
                }
            }
            store::load_task(tx, task_id)
        })
    }

    /// Stop now if no worker holds the task, else ask the worker to stop.
    #[instrument(skip_all, fields(task_id, actor))]
    pub fn request_stop(&self, task_id: &str, actor: &str) -> Result<TaskRecord> {
        self.authorize(actor)?;
        self.store.write(|tx| {
            let task = store::load_task(tx, task_id)?;
            match task.state {
                TaskState::Running | TaskState::Validating => {
                    store::update_control(tx, task_id, ControlFlag::StopRequested, actor)?;
                }
                TaskState::Draft | TaskState::Pending | TaskState::Paused | TaskState::Blocked => {
                    let change = StateChange::to(TaskState::Stopped, actor)
                        .from(task.state)
                        .reason("stopped by request");
                    store::apply_transition(tx, task_id, &change)?;
                    store::supersede_decisions(tx, task_id)?;
                }
                other => {
                    return Err(RuntimeError::precondition(format!(
                        "cannot stop task {task_id} while it is {other}"
                    ))
                    .into());
                }
            }
            store::load_task(tx, task_id)
        })
    }

    /// Return a paused or blocked task to the queue, optionally with guidance.
    #[instrument(skip_all, fields(task_id, actor))]
    pub fn resume(&self, task_id: &str, instruction: Option<&str>, actor: &str) -> Result<TaskRecord> {
        self.authorize(actor)?;
        let instruction = instruction.map(str::trim).filter(|s| !s.is_empty());
        self.store.write(|tx| {
            let task = store::load_task(tx, task_id)?;
            if !matches!(task.state, TaskState::Paused | TaskState::Blocked) {
                return Err(RuntimeError::precondition(format!(
                    "cannot resume task {task_id} while it is {}",
                    task.state
                ))
                .into());
            }
            let mut patch = TaskPatch {
                control: Some(ControlFlag::Running),
                blocked_reason: Some(None),
                ..TaskPatch::default()
            };
            if let Some(text) = instruction {
                patch.resume_instruction = Some(Some(text.to_string()));
            }
            let change = StateChange::to(TaskState::Pending, actor)
                .from(task.state)
                .reason("resumed")
                .patch(patch);
            store::apply_transition(tx, task_id, &change)?;
            store::supersede_decisions(tx, task_id)?;
            store::load_task(tx, task_id)
        })
    }

    /// Close a task whose result will not be merged.
    pub fn discard(&self, task_id: &str, actor: &str) -> Result<TaskRecord> {
        self.authorize(actor)?;
        self.store.write(|tx| {
            let task = store::load_task(tx, task_id)?;
            if !matches!(task.state, TaskState::WaitingMerge | TaskState::MergeFailed) {
                return Err(RuntimeError::precondition(format!(
                    "cannot discard task {task_id} while it is {}",
                    task.state
                ))
                .into());
            }
            if task.merge_in_progress() {
                return Err(RuntimeError::precondition(format!(
                    "cannot discard task {task_id} while it is being merged"
                ))
                .into());
            }
            let change = StateChange::to(TaskState::Discarded, actor)
                .from(task.state)
                .reason("discarded");
            store::apply_transition(tx, task_id, &change)?;
            store::supersede_decisions(tx, task_id)?;
            store::load_task(tx, task_id)
        })
    }

    /// Move a held task to `FAILED` and record the error.
    pub fn fail(&self, task_id: &str, error: &str, actor: &str) -> Result<TaskRecord> {
        let change = StateChange::to(TaskState::Failed, actor)
            .reason("execution failed")
            .patch(TaskPatch {
                error: Some(Some(error.to_string())),
                release_lease: true,
                ..TaskPatch::default()
            });
        let task = self.store.transition(task_id, &change)?;
        self.store.append_event(
            task_id,
            "task.error",
            &serde_json::json!({ "status": task.state, "error": error }),
        )?;
        Ok(task)
    }

    /// Startup recovery: requeue in-flight tasks. A pause or stop requested
    /// before the restart stays on the task and is settled when it is next
    /// claimed.
    #[instrument(skip_all)]
    pub fn requeue_on_start(&self) -> Result<Vec<String>> {
        let ids = self.store.requeue_inflight()?;
        if !ids.is_empty() {
            info!(count = ids.len(), "requeued in-flight tasks");
        }
        Ok(ids)
    }
}

fn new_task_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Directory-safe skill name derived from free text.
pub fn skill_slug(text: &str) -> String {
    let mut slug = String::new();
    for c in text.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
        if slug.len() >= 48 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "skill".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::risk::RiskProfile;
    use crate::core::types::DecisionAction;

    fn controller(config: RuntimeConfig) -> LifecycleController {
        let store = TaskStore::open_in_memory().expect("store");
        LifecycleController::new(store, Arc::new(config)).expect("controller")
    }

    #[test]
    fn low_risk_repo_change_is_pending() {
        let ctl = controller(RuntimeConfig::default());
        let created = ctl
            .create_task(NewTask::new("fix the failing parser test", TaskType::RepoChange))
            .expect("create");
        assert_eq!(created.task.state, TaskState::Pending);
        assert!(created.decision.is_none());
        assert_eq!(created.task.agent.as_deref(), Some("codex"));
        assert_eq!(created.task.max_steps, 8);
    }

    #[test]
    fn risky_goal_starts_as_draft_with_token() {
        let ctl = controller(RuntimeConfig::default());
        let created = ctl
            .create_task(NewTask::new("deploy to production", TaskType::RepoChange))
            .expect("create");
        assert_eq!(created.task.state, TaskState::Draft);
        let token = created.decision.expect("token");
        assert_eq!(token.actions[0], DecisionAction::Approve);
    }

    #[test]
    fn skill_tasks_use_skill_defaults_and_slug() {
        let ctl = controller(RuntimeConfig::default());
        let created = ctl
            .create_task(NewTask::new("Weather Report for Tokyo!", TaskType::SkillChange))
            .expect("create");
        assert_eq!(created.task.state, TaskState::Draft);
        assert_eq!(created.task.skill_name.as_deref(), Some("weather-report-for-tokyo"));
        assert_eq!(created.task.max_steps, 6);
        assert!(created.task.validate_skill);
    }

    #[test]
    fn manual_profile_drafts_everything() {
        let ctl = controller(RuntimeConfig {
            risk_profile: RiskProfile::Manual,
            ..RuntimeConfig::default()
        });
        let created = ctl
            .create_task(NewTask::new("fix typo", TaskType::Artifact))
            .expect("create");
        assert_eq!(created.task.state, TaskState::Draft);
    }

    #[test]
    fn empty_goal_is_rejected() {
        let ctl = controller(RuntimeConfig::default());
        let err = ctl
            .create_task(NewTask::new("   ", TaskType::RepoChange))
            .unwrap_err();
        assert!(matches!(
            crate::error::runtime_error(&err),
            Some(RuntimeError::Precondition(_))
        ));
    }

    #[test]
    fn pause_of_queued_task_applies_immediately() {
        let ctl = controller(RuntimeConfig::default());
        let task = ctl
            .create_task(NewTask::new("fix typo", TaskType::RepoChange))
            .expect("create")
            .task;
        let paused = ctl.request_pause(&task.id, "alice").expect("pause");
        assert_eq!(paused.state, TaskState::Paused);
        let resumed = ctl
            .resume(&task.id, Some("keep it small"), "alice")
            .expect("resume");
        assert_eq!(resumed.state, TaskState::Pending);
        assert_eq!(resumed.resume_instruction.as_deref(), Some("keep it small"));
    }

    #[test]
    fn pause_of_running_task_only_sets_flag() {
        let ctl = controller(RuntimeConfig::default());
        let task = ctl
            .create_task(NewTask::new("fix typo", TaskType::RepoChange))
            .expect("create")
            .task;
        ctl.store().claim_next("w1").expect("claim");
        let flagged = ctl.request_pause(&task.id, "alice").expect("pause");
        assert_eq!(flagged.state, TaskState::Running);
        assert_eq!(flagged.control, ControlFlag::PauseRequested);
    }

    #[test]
    fn stop_of_draft_is_immediate_and_voids_token() {
        let ctl = controller(RuntimeConfig::default());
        let created = ctl
            .create_task(NewTask::new("deploy to production", TaskType::RepoChange))
            .expect("create");
        let stopped = ctl.request_stop(&created.task.id, "alice").expect("stop");
        assert_eq!(stopped.state, TaskState::Stopped);
        assert!(stopped.ended_at.is_some());
        assert!(ctl.gate().active_token(&created.task.id).expect("active").is_none());
    }

    #[test]
    fn resume_requires_paused_or_blocked() {
        let ctl = controller(RuntimeConfig::default());
        let task = ctl
            .create_task(NewTask::new("fix typo", TaskType::RepoChange))
            .expect("create")
            .task;
        let err = ctl.resume(&task.id, None, "alice").unwrap_err();
        assert!(matches!(
            crate::error::runtime_error(&err),
            Some(RuntimeError::Precondition(_))
        ));
    }

    #[test]
    fn unauthorized_actor_cannot_control() {
        let ctl = controller(RuntimeConfig {
            owners: vec!["alice".to_string()],
            ..RuntimeConfig::default()
        });
        let task = ctl
            .create_task(NewTask::new("fix typo", TaskType::RepoChange))
            .expect("create")
            .task;
        let err = ctl.request_stop(&task.id, "mallory").unwrap_err();
        assert_eq!(
            crate::error::runtime_error(&err),
            Some(&RuntimeError::Unauthorized("mallory".to_string()))
        );
        assert_eq!(
            ctl.store().require_task(&task.id).expect("task").state,
            TaskState::Pending
        );
    }

    #[test]
    fn restart_requeues_with_stop_request_kept() {
        let ctl = controller(RuntimeConfig::default());
        let task = ctl
            .create_task(NewTask::new("fix typo", TaskType::RepoChange))
            .expect("create")
            .task;
        ctl.store().claim_next("w1").expect("claim");
        ctl.request_stop(&task.id, "alice").expect("stop flag");
        let ids = ctl.requeue_on_start().expect("requeue");
        assert_eq!(ids, vec![task.id.clone()]);
        let after = ctl.store().require_task(&task.id).expect("task");
        assert_eq!(after.state, TaskState::Pending);
        assert_eq!(after.control, ControlFlag::StopRequested);

        // The next worker picks it up and settles the stop on its first step.
        let lease = ctl.store().claim_next("w2").expect("claim").expect("lease");
        assert_eq!(lease.task_id, task.id);
    }

    #[test]
    fn resume_of_blocked_task_clears_reason() {
        let ctl = controller(RuntimeConfig::default());
        let task = ctl
            .create_task(NewTask::new("fix typo", TaskType::RepoChange))
            .expect("create")
            .task;
        ctl.store().claim_next("w1").expect("claim");
        ctl.store()
            .transition(
                &task.id,
                &StateChange::to(TaskState::Blocked, "w1").patch(TaskPatch {
                    blocked_reason: Some(Some("needs an API key".to_string())),
                    release_lease: true,
                    ..TaskPatch::default()
                }),
            )
            .expect("block");
        assert_eq!(
            ctl.store().require_task(&task.id).expect("task").blocked_reason.as_deref(),
            Some("needs an API key")
        );

        let resumed = ctl.resume(&task.id, Some("key is in .env now"), "alice").expect("resume");
        assert_eq!(resumed.state, TaskState::Pending);
        assert_eq!(resumed.blocked_reason, None);
        assert_eq!(resumed.resume_instruction.as_deref(), Some("key is in .env now"));
    }

    #[test]
    fn slug_is_lowercase_and_dashed() {
        assert_eq!(skill_slug("  Summarize PRs, daily "), "summarize-prs-daily");
        assert_eq!(skill_slug("!!!"), "skill");
    }
}
