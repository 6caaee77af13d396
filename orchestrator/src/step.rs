//! Execution Step Engine: drives one leased task through its steps.
//!
//! Each step renders a prompt, runs an agent in the task workspace, checks the
//! changed paths, runs the tests, and records a checkpoint. The task leaves
//! the loop when it finishes, blocks, times out, fails, or a pause/stop is
//! honored.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::bounded_timeout;
use crate::core::decide::{StepDecision, StepObservation, decide};
use crate::core::signal::{parse_agent_signal, reconcile_block};
use crate::core::summary::{
    build_completion_summary, render_completion, summarize_test_output, tail,
};
use crate::core::types::{ControlFlag, StepSignal, TaskMetrics, TaskState};
use crate::error::RuntimeError;
use crate::heartbeat::{HeartbeatSettings, Phase, Subject, Supervised, supervise};
use crate::io::agent::{AgentRegistry, AgentRequest};
use crate::io::process::InvocationOutput;
use crate::io::prompt::{PromptInputs, render_step_prompt};
use crate::io::skill::validate_skill;
use crate::io::store::{
    Lease, NewCheckpoint, StateChange, TaskPatch, TaskRecord, WorkspaceInfo,
};
use crate::io::test_runner::{TestRequest, TestRunner};
use crate::io::workspace::WorkspaceManager;
use crate::lifecycle::LifecycleController;

/// Mutable state of one worker's pass over a task.
struct TaskRun {
    task_id: String,
    worker: String,
    workspace: WorkspaceInfo,
    metrics: TaskMetrics,
    prior_failure: Option<String>,
    /// Consumed by the first step after a resume.
    block_hint: Option<String>,
    /// Consecutive invocation errors.
    exec_failures: u32,
    step_started: Option<Instant>,
}

impl TaskRun {
    /// Add the running step's wall time to `elapsed_ms`, once.
    fn charge(&mut self) {
        if let Some(started) = self.step_started.take() {
            self.metrics.elapsed_ms += millis(started.elapsed());
        }
    }

    /// Wall-clock budget left, counting the step in progress.
    fn remaining(&self, task: &TaskRecord) -> Duration {
        let running = self.step_started.map_or(Duration::ZERO, |s| s.elapsed());
        task.budget().remaining(&self.metrics).saturating_sub(running)
    }
}

enum AgentRun {
    Finished {
        agent: String,
        output: InvocationOutput,
    },
    Cancelled(ControlFlag),
    TimedOut,
    Failed(String),
}

enum TestRun {
    Finished(InvocationOutput),
    Cancelled(ControlFlag),
    TimedOut {
        limit: Duration,
        partial: Option<InvocationOutput>,
    },
    Failed(String),
}

#[derive(Clone)]
pub struct StepEngine {
    controller: LifecycleController,
    agents: AgentRegistry,
    tests: Arc<dyn TestRunner>,
    workspaces: WorkspaceManager,
}

impl StepEngine {
    pub fn new(
        controller: LifecycleController,
        agents: AgentRegistry,
        tests: Arc<dyn TestRunner>,
        workspaces: WorkspaceManager,
    ) -> Self {
        Self {
            controller,
            agents,
            tests,
            workspaces,
        }
    }

    pub fn controller(&self) -> &LifecycleController {
        &self.controller
    }

    /// Run the leased task until it leaves `RUNNING`/`VALIDATING`.
    /// Returns the state it settled in.
    #[instrument(skip_all, fields(task_id = %lease.task_id, worker = %lease.worker_id))]
    pub fn run_task(&self, lease: &Lease) -> Result<TaskState> {
        let store = self.controller.store();
        let config = self.controller.config();
        let task = store.require_task(&lease.task_id)?;

        let known_base = task.live_workspace().and(task.base_revision.as_deref());
        let workspace = self.workspaces.ensure(&task.id, known_base)?;
        store.set_workspace(&task.id, &workspace)?;
        self.phase(&task.id, task.step_index, "workspace")?;

        let prior_failure = store
            .last_checkpoint(&task.id)?
            .filter(|c| !c.checkpoint.test_passed && !c.checkpoint.test_output.is_empty())
            .map(|c| {
                format!(
                    "Tests failed:\n{}",
                    summarize_test_output(&c.checkpoint.test_output, config.logs.tail_chars)
                )
            });
        let mut run = TaskRun {
            task_id: task.id.clone(),
            worker: lease.worker_id.clone(),
            workspace,
            metrics: task.metrics,
            prior_failure,
            block_hint: task.blocked_reason.clone(),
            exec_failures: 0,
            step_started: None,
        };
        info!(step_index = task.step_index, "task run started");
        loop {
            if let Some(state) = self.step(&mut run)? {
                info!(status = %state, "task run ended");
                return Ok(state);
            }
        }
    }

    /// One step. `Some` means the task left the loop.
    fn step(&self, run: &mut TaskRun) -> Result<Option<TaskState>> {
        let store = self.controller.store();
        let config = self.controller.config();
        let task = store.require_task(&run.task_id)?;

        if let Some(target) = task.control.target_state() {
            return self.settle_control(run, target).map(Some);
        }
        if let Err(err) = task.budget().check_next_step(task.step_index, &run.metrics) {
            return self.settle_timeout(run, &err.to_string()).map(Some);
        }
        if task.state == TaskState::Validating {
            let change = StateChange::to(TaskState::Running, &run.worker)
                .from(TaskState::Validating)
                .reason("next step");
            store.transition(&task.id, &change)?;
        }

        let step = task.step_index + 1;
        store.set_step_index(&task.id, step)?;
        run.step_started = Some(Instant::now());

        self.phase(&task.id, step, "prompt")?;
        let prompt = render_step_prompt(
            &PromptInputs {
                task_id: task.id.clone(),
                task_type: task.task_type,
                goal: task.goal.clone(),
                step,
                max_steps: task.max_steps,
                test_command: task.test_command.clone(),
                prior_failure: run.prior_failure.clone(),
                resume_instruction: task.resume_instruction.clone(),
                block_hint: run.block_hint.take(),
                skill_name: task.skill_name.clone(),
                skills_dir: config.skills.dir.to_string_lossy().into_owned(),
            },
            config.prompt_budget_bytes,
        )
        .context("render step prompt")?;

        self.phase(&task.id, step, "agent")?;
        let agent_started = Instant::now();
        let agent_run = self.run_agent(&task, step, &run.workspace.path, &prompt, run.remaining(&task))?;
        run.metrics.agent_ms += millis(agent_started.elapsed());
        let (agent_name, agent_output) = match agent_run {
            AgentRun::Finished { agent, output } => (agent, output),
            AgentRun::Cancelled(flag) => {
                let target = flag.target_state().unwrap_or(TaskState::Paused);
                return self.settle_control(run, target).map(Some);
            }
            AgentRun::TimedOut => {
                return self
                    .settle_timeout(run, "wall-clock budget exhausted while the agent was running")
                    .map(Some);
            }
            AgentRun::Failed(err) => return self.execution_failure(run, step, Phase::Agent, &err),
        };
        run.exec_failures = 0;
        let agent_text = agent_output.combined();
        let signal = parse_agent_signal(&agent_text);

        let changed = self
            .workspaces
            .changed_files(&run.workspace.path, &run.workspace.base_revision)?;
        let violations = self.controller.policy().violations(&changed);
        if !violations.is_empty() {
            let reason = RuntimeError::PathPolicyViolation { paths: violations }.to_string();
            warn!(task_id = %task.id, reason = %reason, "path policy violation");
            run.charge();
            self.record_step(
                run,
                &task,
                StepRecord {
                    step,
                    prompt: &prompt,
                    agent: &agent_name,
                    agent_output: &agent_text,
                    changed: &changed,
                    tests: None,
                    signal: &signal,
                    decision: "block",
                },
            )?;
            let patch = TaskPatch {
                blocked_reason: Some(Some(reason.clone())),
                ..TaskPatch::default()
            };
            return self
                .settle(run, TaskState::Blocked, &reason, patch)
                .map(Some);
        }

        let change = StateChange::to(TaskState::Validating, &run.worker)
            .from(TaskState::Running)
            .reason("agent step finished");
        store.transition(&task.id, &change)?;

        self.phase(&task.id, step, "tests")?;
        let test_started = Instant::now();
        let test_run = self.run_tests(&task, step, &run.workspace.path, run.remaining(&task))?;
        run.metrics.test_ms += millis(test_started.elapsed());
        let test_output = match test_run {
            TestRun::Finished(output) => output,
            TestRun::Cancelled(flag) => {
                let target = flag.target_state().unwrap_or(TaskState::Paused);
                return self.settle_control(run, target).map(Some);
            }
            TestRun::TimedOut { limit, partial } => {
                let mut reason = format!("tests timed out after {}s", limit.as_secs());
                if let Some(partial) = partial {
                    let text = tail(&partial.combined(), config.logs.tail_chars);
                    if !text.is_empty() {
                        reason.push_str(&format!("\n{text}"));
                    }
                }
                store.append_event(
                    &task.id,
                    "task.error",
                    &json!({
                        "step": step,
                        "phase": Phase::Tests.as_str(),
                        "timeout_seconds": limit.as_secs(),
                        "command": task.test_command,
                        "status": TaskState::Validating,
                    }),
                )?;
                return self.settle_timeout(run, &reason).map(Some);
            }
            TestRun::Failed(err) => return self.execution_failure(run, step, Phase::Tests, &err),
        };
        let tests_passed = test_output.success;
        let test_text = test_output.combined();
        let test_summary = summarize_test_output(&test_text, config.logs.tail_chars);

        let reconciled = reconcile_block(signal, &agent_text, tests_passed, changed.len());
        if let Some(reason) = &reconciled.overridden_from {
            info!(task_id = %task.id, reason = %reason, "agent block overridden by passing tests");
            store.append_event(
                &task.id,
                "task.block_override",
                &json!({
                    "step": step,
                    "reason": reason,
                    "signal": reconciled.signal.label(),
                    "changed_files": changed.len(),
                }),
            )?;
        }

        let validation_failure = match (&task.skill_name, &reconciled.signal) {
            (Some(skill), StepSignal::Done) if task.validate_skill && tests_passed => {
                self.phase(&task.id, step, "validate")?;
                let skills_dir = config.skills.dir.to_string_lossy();
                let report = validate_skill(&run.workspace.path, &skills_dir, skill)?;
                for warning in &report.warnings {
                    debug!(task_id = %task.id, warning = %warning, "skill validation warning");
                }
                report.failure_text()
            }
            _ => None,
        };

        run.charge();
        let decision = decide(&StepObservation {
            signal: &reconciled.signal,
            tests_passed,
            validation_failure: validation_failure.as_deref(),
            test_summary: &test_summary,
            steps_taken: step,
            metrics: run.metrics,
            budget: task.budget(),
            finish: task.finish,
        });
        self.record_step(
            run,
            &task,
            StepRecord {
                step,
                prompt: &prompt,
                agent: &agent_name,
                agent_output: &agent_text,
                changed: &changed,
                tests: Some(&test_output),
                signal: &reconciled.signal,
                decision: decision.label(),
            },
        )?;

        match decision {
            StepDecision::Continue { prior_failure } => {
                run.prior_failure = prior_failure;
                Ok(None)
            }
            StepDecision::Finish { to } => {
                let completion =
                    build_completion_summary(&task.goal, step, &changed, &test_text, &run.metrics);
                let summary = render_completion(&completion);
                let patch = TaskPatch {
                    summary: Some(Some(summary)),
                    completion: Some(completion),
                    blocked_reason: Some(None),
                    error: Some(None),
                    ..TaskPatch::default()
                };
                self.settle(run, to, "validation passed", patch).map(Some)
            }
            StepDecision::Block { reason } => {
                let patch = TaskPatch {
                    blocked_reason: Some(Some(reason.clone())),
                    ..TaskPatch::default()
                };
                self.settle(run, TaskState::Blocked, &reason, patch)
                    .map(Some)
            }
            StepDecision::Timeout { reason } => self.settle_timeout(run, &reason).map(Some),
        }
    }

    fn run_agent(
        &self,
        task: &TaskRecord,
        step: u32,
        workdir: &Path,
        prompt: &str,
        budget: Duration,
    ) -> Result<AgentRun> {
        let store = self.controller.store();
        let config = self.controller.config();
        let deadline = Instant::now() + budget;
        let mut errors = Vec::new();
        for agent in self.agents.candidates(task.agent.as_deref()) {
            let request = AgentRequest {
                task_id: task.id.clone(),
                step,
                workdir: workdir.to_path_buf(),
                prompt: prompt.to_string(),
                output_limit_bytes: config.output_limit_bytes,
            };
            let mut invocation = match agent.start(&request) {
                Ok(invocation) => invocation,
                Err(err) => {
                    warn!(agent = agent.name(), err = %err, "agent failed to start");
                    errors.push(format!("{}: {err:#}", agent.name()));
                    continue;
                }
            };
            let settings = HeartbeatSettings {
                interval: Duration::from_millis(config.heartbeat.agent_interval_ms),
                persist_every: Duration::from_millis(config.heartbeat.progress_persist_ms),
                timeout: deadline.saturating_duration_since(Instant::now()),
            };
            let subject = Subject {
                task_id: &task.id,
                step,
                phase: Phase::Agent,
                label: agent.name(),
            };
            match supervise(store, subject, &settings, invocation.as_mut())? {
                Supervised::Finished(output) if output.success => {
                    return Ok(AgentRun::Finished {
                        agent: agent.name().to_string(),
                        output,
                    });
                }
                Supervised::Finished(output) => {
                    let code = output
                        .exit_code
                        .map_or_else(|| "signal".to_string(), |c| c.to_string());
                    warn!(agent = agent.name(), exit_code = %code, "agent exited with failure");
                    errors.push(format!(
                        "{} exited with {code}: {}",
                        agent.name(),
                        tail(&output.combined(), 400)
                    ));
                }
                Supervised::Cancelled(flag) => return Ok(AgentRun::Cancelled(flag)),
                Supervised::TimedOut(_) => return Ok(AgentRun::TimedOut),
            }
        }
        if errors.is_empty() {
            errors.push("no agent is configured".to_string());
        }
        Ok(AgentRun::Failed(errors.join("\n")))
    }

    fn run_tests(
        &self,
        task: &TaskRecord,
        step: u32,
        workdir: &Path,
        budget: Duration,
    ) -> Result<TestRun> {
        let config = self.controller.config();
        let limit = bounded_timeout(
            Some(Duration::from_secs(config.heartbeat.test_timeout_secs)),
            budget,
        );
        let request = TestRequest {
            task_id: task.id.clone(),
            workdir: workdir.to_path_buf(),
            command: task.test_command.clone(),
            output_limit_bytes: config.output_limit_bytes,
        };
        let mut invocation = match self.tests.start(&request) {
            Ok(invocation) => invocation,
            Err(err) => return Ok(TestRun::Failed(format!("{err:#}"))),
        };
        let settings = HeartbeatSettings {
            interval: Duration::from_millis(config.heartbeat.test_interval_ms),
            persist_every: Duration::from_millis(config.heartbeat.progress_persist_ms),
            timeout: limit,
        };
        let subject = Subject {
            task_id: &task.id,
            step,
            phase: Phase::Tests,
            label: &task.test_command,
        };
        Ok(
            match supervise(self.controller.store(), subject, &settings, invocation.as_mut())? {
                Supervised::Finished(output) => TestRun::Finished(output),
                Supervised::Cancelled(flag) => TestRun::Cancelled(flag),
                Supervised::TimedOut(partial) => TestRun::TimedOut { limit, partial },
            },
        )
    }

    /// Count an invocation error; the task fails once the limit is reached.
    fn execution_failure(
        &self,
        run: &mut TaskRun,
        step: u32,
        phase: Phase,
        err: &str,
    ) -> Result<Option<TaskState>> {
        let store = self.controller.store();
        let config = self.controller.config();
        run.charge();
        run.exec_failures += 1;
        let failure = RuntimeError::ExecutionFailure(err.to_string()).to_string();
        warn!(
            task_id = %run.task_id,
            phase = phase.as_str(),
            attempt = run.exec_failures,
            err = %err,
            "invocation failed"
        );
        store.append_event(
            &run.task_id,
            "task.error",
            &json!({
                "step": step,
                "phase": phase.as_str(),
                "error": tail(&failure, 600),
            }),
        )?;
        if run.exec_failures >= config.max_execution_failures {
            let patch = TaskPatch {
                error: Some(Some(failure)),
                ..TaskPatch::default()
            };
            return self
                .settle(run, TaskState::Failed, "execution failed", patch)
                .map(Some);
        }
        store.update_metrics(&run.task_id, &run.metrics)?;
        run.prior_failure = Some(format!(
            "The previous step could not run:\n{}",
            tail(err, config.logs.tail_chars)
        ));
        Ok(None)
    }

    fn settle_control(&self, run: &mut TaskRun, target: TaskState) -> Result<TaskState> {
        let patch = TaskPatch {
            control: Some(ControlFlag::Running),
            ..TaskPatch::default()
        };
        let reason = match target {
            TaskState::Stopped => "stop requested",
            _ => "pause requested",
        };
        self.settle(run, target, reason, patch)
    }

    fn settle_timeout(&self, run: &mut TaskRun, reason: &str) -> Result<TaskState> {
        let patch = TaskPatch {
            error: Some(Some(reason.to_string())),
            ..TaskPatch::default()
        };
        self.settle(run, TaskState::Timeout, "budget exhausted", patch)
    }

    /// Final transition of this run: persists metrics, releases the lease,
    /// and issues a decision token when the new state awaits one.
    fn settle(
        &self,
        run: &mut TaskRun,
        to: TaskState,
        reason: &str,
        mut patch: TaskPatch,
    ) -> Result<TaskState> {
        run.charge();
        patch.metrics = Some(run.metrics);
        patch.release_lease = true;
        let change = StateChange::to(to, &run.worker).reason(reason).patch(patch);
        let task = self.controller.store().transition(&run.task_id, &change)?;
        if task.state.awaits_decision() {
            self.controller.gate().issue_system(&task.id, None)?;
        }
        Ok(task.state)
    }

    fn record_step(&self, run: &TaskRun, task: &TaskRecord, record: StepRecord<'_>) -> Result<()> {
        let store = self.controller.store();
        let (test_passed, test_exit_code, test_output) = match record.tests {
            Some(out) => (out.success, out.exit_code, out.combined()),
            None => (false, None, String::new()),
        };
        store.add_checkpoint(&NewCheckpoint {
            task_id: task.id.clone(),
            step: record.step,
            prompt_digest: prompt_digest(record.prompt),
            agent: Some(record.agent.to_string()),
            agent_output: record.agent_output.to_string(),
            changed_files: record.changed.to_vec(),
            test_passed,
            test_exit_code,
            test_output,
            signal: record.signal.label().to_string(),
            decision: record.decision.to_string(),
        })?;
        store.append_event(
            &task.id,
            "task.step",
            &json!({
                "step": record.step,
                "agent": record.agent,
                "signal": record.signal.label(),
                "test_exit_code": test_exit_code,
                "tests_passed": test_passed,
                "changed_files": record.changed.len(),
                "decision": record.decision,
            }),
        )?;
        store.update_metrics(&task.id, &run.metrics)
    }

    fn phase(&self, task_id: &str, step: u32, phase: &str) -> Result<()> {
        debug!(task_id, step, phase, "phase");
        self.controller
            .store()
            .append_event(task_id, "task.phase", &json!({ "phase": phase, "step": step }))?;
        Ok(())
    }
}

struct StepRecord<'a> {
    step: u32,
    prompt: &'a str,
    agent: &'a str,
    agent_output: &'a str,
    changed: &'a [String],
    tests: Option<&'a InvocationOutput>,
    signal: &'a StepSignal,
    decision: &'a str,
}

fn prompt_digest(prompt: &str) -> String {
    let mut hasher = DefaultHasher::new();
    prompt.hash(&mut hasher);
    format!("{:016x}:{}", hasher.finish(), prompt.len())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
