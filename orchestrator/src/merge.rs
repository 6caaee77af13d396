//! Merge Gate: land a finished task's changes in the main repository.
//!
//! The workspace is staged with `git add -A` and diffed against the task's
//! base revision. The binary patch is written next to the worktrees, checked
//! with `git apply --check`, applied to the index and committed. A commit
//! that fails takes the staged patch back out. Any failure leaves the task in
//! `MERGE_FAILED` with the workspace intact.
//!
//! A merge holds a claim on the task (see [`crate::io::store::TaskStore::claim_merge`])
//! from the moment the `merge` token is consumed until it settles, so no
//! second token can be issued and the task cannot be discarded meanwhile.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::summary::goal_short;
use crate::core::types::TaskState;
use crate::error::{RuntimeError, runtime_error};
use crate::io::config::RuntimePaths;
use crate::io::git::Git;
use crate::io::store::{StateChange, TaskPatch, TaskRecord};
use crate::io::workspace::WorkspaceManager;
use crate::lifecycle::LifecycleController;

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub task: TaskRecord,
    /// `None` when auto-commit is off and the patch was only staged.
    pub commit: Option<String>,
    pub patch_path: PathBuf,
}

#[derive(Clone)]
pub struct MergeGate {
    controller: LifecycleController,
    workspaces: WorkspaceManager,
    runtime_prefixes: Vec<String>,
}

impl MergeGate {
    pub fn new(
        controller: LifecycleController,
        workspaces: WorkspaceManager,
        paths: &RuntimePaths,
    ) -> Self {
        Self {
            controller,
            workspaces,
            runtime_prefixes: paths.runtime_prefixes(),
        }
    }

    /// Merge a `WAITING_MERGE` task. On failure the task moves to
    /// `MERGE_FAILED` and the returned error carries the category.
    #[instrument(skip_all, fields(task_id, actor))]
    pub fn merge(&self, task_id: &str, actor: &str) -> Result<MergeOutcome> {
        let store = self.controller.store();
        let task = store.require_task(task_id)?;
        if task.state != TaskState::WaitingMerge {
            return Err(RuntimeError::precondition(format!(
                "cannot merge task {task_id} while it is {}",
                task.state
            ))
            .into());
        }
        store.claim_merge(task_id, actor)?;
        self.merge_claimed(task_id, actor)
    }

    /// Land a task that is already claimed for merging. The claim is
    /// released by the `MERGED` or `MERGE_FAILED` transition.
    pub(crate) fn merge_claimed(&self, task_id: &str, actor: &str) -> Result<MergeOutcome> {
        let store = self.controller.store();
        let task = store.require_task(task_id)?;
        if !task.merge_in_progress() {
            return Err(RuntimeError::precondition(format!(
                "task {task_id} is not claimed for merging"
            ))
            .into());
        }

        match self.land(&task) {
            Ok((commit, patch_path)) => {
                let change = StateChange::to(TaskState::Merged, actor)
                    .from(TaskState::WaitingMerge)
                    .reason("merged")
                    .patch(TaskPatch {
                        merge_commit: commit.clone(),
                        release_lease: true,
                        ..TaskPatch::default()
                    });
                let mut merged = store.transition(task_id, &change)?;
                info!(commit = ?commit, "task merged");
                if self.controller.config().janitor.merged_immediate
                    && let Some(path) = merged.live_workspace().map(PathBuf::from)
                {
                    match self.workspaces.remove(task_id, &path) {
                        Ok(()) => {
                            store.mark_workspace_cleaned(task_id, "merged")?;
                            merged = store.require_task(task_id)?;
                        }
                        Err(err) => warn!(err = %err, "workspace cleanup after merge failed"),
                    }
                }
                Ok(MergeOutcome {
                    task: merged,
                    commit,
                    patch_path,
                })
            }
            Err(err) => {
                let failure = match runtime_error(&err) {
                    Some(e @ (RuntimeError::MergePreflight(_) | RuntimeError::MergeApply(_))) => {
                        e.clone()
                    }
                    _ => RuntimeError::MergeApply(format!("{err:#}")),
                };
                warn!(err = %failure, "merge failed");
                let change = StateChange::to(TaskState::MergeFailed, actor)
                    .from(TaskState::WaitingMerge)
                    .reason("merge failed")
                    .patch(TaskPatch {
                        error: Some(Some(failure.to_string())),
                        release_lease: true,
                        ..TaskPatch::default()
                    });
                store.transition(task_id, &change)?;
                store.append_event(
                    task_id,
                    "task.error",
                    &json!({ "status": TaskState::MergeFailed, "error": failure.to_string() }),
                )?;
                Err(failure.into())
            }
        }
    }

    /// Build, check, apply and commit the patch. Returns the commit hash.
    fn land(&self, task: &TaskRecord) -> Result<(Option<String>, PathBuf)> {
        let config = self.controller.config();
        let preflight = |msg: String| RuntimeError::MergePreflight(msg);
        let apply = |msg: String| RuntimeError::MergeApply(msg);

        let workspace = task
            .live_workspace()
            .filter(|path| path.exists())
            .ok_or_else(|| preflight("task workspace is missing".to_string()))?;
        let base = task
            .base_revision
            .as_deref()
            .ok_or_else(|| preflight("task has no base revision".to_string()))?;

        let repo = self.workspaces.repo();
        if config.merge.require_clean_repo {
            repo.ensure_clean_except_prefixes(&self.runtime_prefixes)
                .map_err(|err| preflight(format!("{err:#}")))?;
        }

        let ws = Git::new(workspace);
        ws.add_all().map_err(|err| preflight(format!("{err:#}")))?;
        let changed = ws
            .changed_paths_since(base)
            .map_err(|err| preflight(format!("{err:#}")))?;
        let violations = self.controller.policy().violations(&changed);
        if !violations.is_empty() {
            return Err(preflight(
                RuntimeError::PathPolicyViolation { paths: violations }.to_string(),
            )
            .into());
        }
        let patch = ws
            .staged_diff(base)
            .map_err(|err| preflight(format!("{err:#}")))?;
        if patch.is_empty() {
            return Err(preflight("task produced no changes".to_string()).into());
        }

        let patch_path = self.workspaces.patch_path(&task.id);
        fs::write(&patch_path, &patch)
            .with_context(|| format!("write patch {}", patch_path.display()))?;
        if config.merge.preflight_check {
            repo.apply_check(&patch_path)
                .map_err(|err| preflight(format!("{err:#}")))?;
        }
        repo.apply_to_index(&patch_path)
            .map_err(|err| apply(format!("{err:#}")))?;

        if !config.merge.auto_commit {
            return Ok((None, patch_path));
        }
        let committed = commit_message(&config.merge.commit_message_template, task)
            .and_then(|message| repo.commit_staged(&message));
        if let Err(err) = committed {
            // Leave the main repository as the preflight found it.
            if let Err(revert) = repo.revert_from_index(&patch_path) {
                warn!(err = %revert, "failed to unstage patch after commit failure");
            }
            return Err(apply(format!("{err:#}")).into());
        }
        let commit = repo.head_revision()?;
        Ok((Some(commit), patch_path))
    }
}

/// Render the merge commit message template.
pub fn commit_message(template: &str, task: &TaskRecord) -> Result<String> {
    let env = Environment::new();
    let message = env
        .render_str(
            template,
            context! {
                task_id => &task.id,
                goal_short => goal_short(&task.goal),
                task_type => task.task_type.as_str(),
            },
        )
        .context("render commit message template")?;
    Ok(message.trim().to_string())
}
