//! Service wiring: store, controller, step engine, workers and janitor.
//!
//! [`Runtime::start`] performs startup recovery (requeue in-flight tasks),
//! runs one janitor sweep, then spawns the worker pool and the janitor
//! thread. A runtime is started at most once; [`Runtime::stop`] (or drop)
//! signals shutdown and joins every thread.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{error, info, warn};

use crate::core::types::DecisionAction;
use crate::decision::DecisionOutcome;
use crate::io::agent::AgentRegistry;
use crate::io::config::{RuntimeConfig, RuntimePaths};
use crate::io::store::TaskStore;
use crate::io::test_runner::{ShellTestRunner, TestRunner};
use crate::io::workspace::WorkspaceManager;
use crate::janitor::Janitor;
use crate::lifecycle::{CreatedTask, LifecycleController, NewTask};
use crate::merge::MergeGate;
use crate::report;
use crate::scheduler::{Shutdown, WorkerPool};
use crate::step::StepEngine;

pub struct Runtime {
    paths: RuntimePaths,
    controller: LifecycleController,
    engine: StepEngine,
    workspaces: WorkspaceManager,
    merge: MergeGate,
    janitor: Janitor,
    shutdown: Shutdown,
    workers: Option<WorkerPool>,
    janitor_thread: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Open the runtime with the configured command agents and `sh -c` tests.
    pub fn open(config: RuntimeConfig, base: &Path) -> Result<Self> {
        let agents = AgentRegistry::from_config(&config.agents)?;
        Self::with_services(config, base, agents, Arc::new(ShellTestRunner))
    }

    pub fn with_services(
        config: RuntimeConfig,
        base: &Path,
        agents: AgentRegistry,
        tests: Arc<dyn TestRunner>,
    ) -> Result<Self> {
        config.validate()?;
        let paths = config.paths(base);
        fs::create_dir_all(&paths.state_dir)
            .with_context(|| format!("create state directory {}", paths.state_dir.display()))?;
        let store = TaskStore::open(&paths.db_path)?;
        let controller = LifecycleController::new(store, Arc::new(config))?;
        let workspaces = WorkspaceManager::new(&paths.repo_root, &paths.worktree_root);
        let engine = StepEngine::new(controller.clone(), agents, tests, workspaces.clone());
        let merge = MergeGate::new(controller.clone(), workspaces.clone(), &paths);
        let janitor = Janitor::new(controller.clone(), workspaces.clone());
        Ok(Self {
            paths,
            controller,
            engine,
            workspaces,
            merge,
            janitor,
            shutdown: Shutdown::new(),
            workers: None,
            janitor_thread: None,
        })
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.controller.config()
    }

    pub fn store(&self) -> &TaskStore {
        self.controller.store()
    }

    pub fn controller(&self) -> &LifecycleController {
        &self.controller
    }

    pub fn engine(&self) -> &StepEngine {
        &self.engine
    }

    pub fn merge_gate(&self) -> &MergeGate {
        &self.merge
    }

    pub fn janitor(&self) -> &Janitor {
        &self.janitor
    }

    pub fn is_running(&self) -> bool {
        self.workers.is_some()
    }

    /// Requeue crashed work, sweep once, then spawn workers and the janitor.
    pub fn start(&mut self) -> Result<()> {
        if self.workers.is_some() || self.shutdown.is_triggered() {
            bail!("runtime can only be started once");
        }
        let requeued = self.controller.requeue_on_start()?;
        if !requeued.is_empty() {
            warn!(count = requeued.len(), tasks = ?requeued, "requeued in-flight tasks");
        }

        let config = self.controller.config();
        if config.janitor.enabled
            && let Err(err) = self.janitor.sweep()
        {
            error!(err = %format!("{err:#}"), "startup janitor sweep failed");
        }
        self.workers = Some(WorkerPool::start(
            &self.engine,
            config.worker_concurrency,
            config.poll_interval(),
            &self.shutdown,
        )?);
        if config.janitor.enabled {
            let interval = Duration::from_secs(config.janitor.interval_minutes.max(1) * 60);
            self.janitor_thread = Some(self.janitor.clone().spawn(interval, self.shutdown.clone())?);
        }
        info!(
            repo = %self.paths.repo_root.display(),
            workers = config.worker_concurrency,
            "runtime started"
        );
        Ok(())
    }

    /// Signal shutdown and wait for workers to finish their current task.
    pub fn stop(&mut self) {
        self.shutdown.trigger();
        if let Some(workers) = self.workers.take() {
            workers.join();
            info!("runtime stopped");
        }
        if let Some(handle) = self.janitor_thread.take()
            && handle.join().is_err()
        {
            warn!("janitor thread panicked");
        }
    }

    /// Block until shutdown is triggered elsewhere.
    pub fn wait(&self) {
        while !self.shutdown.wait(Duration::from_secs(3600)) {}
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn submit(&self, new: NewTask) -> Result<CreatedTask> {
        self.controller.create_task(new)
    }

    /// Consume a decision token. A `merge` runs the merge gate before
    /// returning; its failure is returned as the error.
    pub fn decide(
        &self,
        token: &str,
        action: DecisionAction,
        suggestion: Option<&str>,
        actor: &str,
    ) -> Result<DecisionOutcome> {
        let mut outcome = self
            .controller
            .gate()
            .consume(token, action, suggestion, actor)?;
        if outcome.merge_requested {
            let merged = self.merge.merge_claimed(&outcome.task.id, actor)?;
            outcome.task = merged.task;
        }
        Ok(outcome)
    }

    pub fn task_logs(&self, task_id: &str) -> Result<String> {
        report::task_logs(self.store(), &self.config().logs, task_id)
    }

    pub fn task_changes(&self, task_id: &str, limit: usize) -> Result<Vec<String>> {
        report::task_changes(self.store(), &self.workspaces, task_id, limit)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}
