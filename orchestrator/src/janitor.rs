//! Retention sweep: reclaim workspaces of finished tasks.
//!
//! Task, event and checkpoint rows stay for audit; only the worktree, its
//! branch and the patch file go. `MERGE_FAILED` tasks keep their workspace
//! until they are discarded.

use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, TimeDelta, Utc};
use tracing::{error, info, instrument, warn};

use crate::core::types::TaskState;
use crate::error::RuntimeError;
use crate::io::store::{TaskRecord, format_ts};
use crate::io::workspace::WorkspaceManager;
use crate::lifecycle::LifecycleController;
use crate::scheduler::Shutdown;

/// Terminal states swept once the retention window has passed.
const RETAINED_STATES: [TaskState; 6] = [
    TaskState::Completed,
    TaskState::Discarded,
    TaskState::Rejected,
    TaskState::Failed,
    TaskState::Timeout,
    TaskState::Stopped,
];

/// Sorts before every stored timestamp.
const EARLIEST: &str = "0001-01-01T00:00:00.000Z";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub cleaned: Vec<String>,
    /// Task id and error for workspaces that could not be removed.
    pub failed: Vec<(String, String)>,
    pub events_pruned: usize,
}

#[derive(Clone)]
pub struct Janitor {
    controller: LifecycleController,
    workspaces: WorkspaceManager,
}

impl Janitor {
    pub fn new(controller: LifecycleController, workspaces: WorkspaceManager) -> Self {
        Self {
            controller,
            workspaces,
        }
    }

    pub fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now())
    }

    #[instrument(skip_all)]
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let store = self.controller.store();
        let config = &self.controller.config().janitor;
        let workspace_cutoff = cutoff(now, config.retention_hours);

        let mut candidates = Vec::new();
        if config.merged_immediate {
            candidates.extend(store.cleanup_candidates(&[TaskState::Merged], None)?);
            candidates.extend(store.cleanup_candidates(&RETAINED_STATES, Some(&workspace_cutoff))?);
        } else {
            let mut states = RETAINED_STATES.to_vec();
            states.push(TaskState::Merged);
            candidates.extend(store.cleanup_candidates(&states, Some(&workspace_cutoff))?);
        }

        let mut report = SweepReport::default();
        for task in candidates {
            match self.reclaim(&task, "retention") {
                Ok(()) => report.cleaned.push(task.id),
                Err(err) => {
                    warn!(task_id = %task.id, err = %format!("{err:#}"), "workspace cleanup failed");
                    report.failed.push((task.id, format!("{err:#}")));
                }
            }
        }
        if config.prune_worktrees && !report.cleaned.is_empty() {
            self.workspaces.prune()?;
        }
        if config.event_retention_days > 0 {
            let before = cutoff(now, config.event_retention_days.saturating_mul(24));
            report.events_pruned = store.prune_events(&before)?;
        }
        info!(
            cleaned = report.cleaned.len(),
            failed = report.failed.len(),
            events_pruned = report.events_pruned,
            "janitor sweep finished"
        );
        Ok(report)
    }

    /// Reclaim one terminal task's workspace now, regardless of retention.
    #[instrument(skip_all, fields(task_id, actor))]
    pub fn cleanup_task(&self, task_id: &str, actor: &str) -> Result<TaskRecord> {
        self.controller.authorize(actor)?;
        let store = self.controller.store();
        let task = store.require_task(task_id)?;
        if task.state == TaskState::MergeFailed {
            return Err(RuntimeError::precondition(format!(
                "task {task_id} is MERGE_FAILED; discard it before cleaning up"
            ))
            .into());
        }
        if !task.state.is_terminal() {
            return Err(RuntimeError::precondition(format!(
                "task {task_id} is {} and still owns its workspace",
                task.state
            ))
            .into());
        }
        if task.live_workspace().is_none() {
            return Err(
                RuntimeError::precondition(format!("task {task_id} has no workspace")).into(),
            );
        }
        self.reclaim(&task, "manual")?;
        self.workspaces.prune()?;
        store.require_task(task_id)
    }

    fn reclaim(&self, task: &TaskRecord, reason: &str) -> Result<()> {
        let Some(path) = task.live_workspace().map(PathBuf::from) else {
            return Ok(());
        };
        self.workspaces.remove(&task.id, &path)?;
        self.controller
            .store()
            .mark_workspace_cleaned(&task.id, reason)?;
        Ok(())
    }

    /// Sweep every `interval` on a background thread until `shutdown`.
    pub fn spawn(self, interval: Duration, shutdown: Shutdown) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("janitor".to_string())
            .spawn(move || {
                while !shutdown.wait(interval) {
                    if let Err(err) = self.sweep() {
                        error!(err = %format!("{err:#}"), "janitor sweep failed");
                    }
                }
            })
            .context("spawn janitor thread")
    }
}

/// `now - hours`, formatted for comparison with stored timestamps.
fn cutoff(now: DateTime<Utc>, hours: u64) -> String {
    i64::try_from(hours)
        .ok()
        .and_then(TimeDelta::try_hours)
        .and_then(|window| now.checked_sub_signed(window))
        .filter(|at| at.year() >= 1)
        .map_or_else(|| EARLIEST.to_string(), format_ts)
}
