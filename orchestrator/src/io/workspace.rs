//! Per-task git worktrees.
//!
//! Each task gets `<worktree_root>/<task_id>` on branch `task-<task_id>`,
//! created from the repository `HEAD`. A workspace that already exists is
//! reused, so resumed tasks keep their earlier changes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::io::git::Git;
use crate::io::store::WorkspaceInfo;

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    repo: Git,
    worktree_root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(repo_root: impl Into<PathBuf>, worktree_root: impl Into<PathBuf>) -> Self {
        Self {
            repo: Git::new(repo_root),
            worktree_root: worktree_root.into(),
        }
    }

    pub fn repo(&self) -> &Git {
        &self.repo
    }

    pub fn worktree_root(&self) -> &Path {
        &self.worktree_root
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.worktree_root.join(task_id)
    }

    pub fn patch_path(&self, task_id: &str) -> PathBuf {
        self.worktree_root.join(format!("{task_id}.patch"))
    }

    pub fn branch_for(task_id: &str) -> String {
        format!("task-{task_id}")
    }

    /// Return the task's workspace, creating it if needed.
    ///
    /// `known_base` is the base revision recorded when the workspace was first
    /// created; it is kept when the directory still exists.
    #[instrument(skip_all, fields(task_id))]
    pub fn ensure(&self, task_id: &str, known_base: Option<&str>) -> Result<WorkspaceInfo> {
        let path = self.path_for(task_id);
        let branch = Self::branch_for(task_id);
        if path.join(".git").exists() {
            let base_revision = match known_base {
                Some(base) => base.to_string(),
                None => self.repo.head_revision()?,
            };
            info!(path = %path.display(), "reusing workspace");
            return Ok(WorkspaceInfo {
                path,
                branch,
                base_revision,
            });
        }

        fs::create_dir_all(&self.worktree_root)
            .with_context(|| format!("create worktree root {}", self.worktree_root.display()))?;
        if path.exists() {
            warn!(path = %path.display(), "removing stale workspace directory");
            fs::remove_dir_all(&path)
                .with_context(|| format!("remove stale workspace {}", path.display()))?;
        }
        self.repo.worktree_prune()?;
        let base_revision = self.repo.head_revision()?;
        self.repo
            .worktree_add(&path, &branch)
            .with_context(|| format!("create workspace for task {task_id}"))?;
        info!(path = %path.display(), base = %base_revision, "workspace created");
        Ok(WorkspaceInfo {
            path,
            branch,
            base_revision,
        })
    }

    /// Paths changed in the workspace relative to `base`.
    pub fn changed_files(&self, workspace: &Path, base: &str) -> Result<Vec<String>> {
        Git::new(workspace).changed_paths_since(base)
    }

    /// Name-status lines of the workspace relative to `base`.
    pub fn change_listing(&self, workspace: &Path, base: &str) -> Result<Vec<String>> {
        Git::new(workspace).name_status_since(base)
    }

    /// Remove the worktree, its branch and any patch file.
    #[instrument(skip_all, fields(task_id))]
    pub fn remove(&self, task_id: &str, path: &Path) -> Result<()> {
        if path.exists()
            && let Err(err) = self.repo.worktree_remove(path)
        {
            warn!(err = %err, "git worktree remove failed, deleting directory");
            fs::remove_dir_all(path)
                .with_context(|| format!("remove workspace {}", path.display()))?;
        }
        self.repo.worktree_prune()?;
        self.repo.delete_branch(&Self::branch_for(task_id))?;
        let patch = self.patch_path(task_id);
        if patch.exists() {
            fs::remove_file(&patch).with_context(|| format!("remove {}", patch.display()))?;
        }
        info!(path = %path.display(), "workspace removed");
        Ok(())
    }

    pub fn prune(&self) -> Result<()> {
        self.repo.worktree_prune()
    }
}
