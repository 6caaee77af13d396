//! End-to-end task scenarios driven through the runtime with scripted
//! agents and test runners.
//!
//! Workers are not started; each test calls [`tick`] to claim and run one
//! task at a time so the sequence of states is deterministic.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use orchestrator::core::types::{ControlFlag, DecisionAction, TaskState, TaskType};
use orchestrator::error::{RuntimeError, runtime_error};
use orchestrator::io::agent::{AgentRegistry, AgentService};
use orchestrator::io::config::RuntimeConfig;
use orchestrator::lifecycle::NewTask;
use orchestrator::runtime::Runtime;
use orchestrator::scheduler::tick;
use orchestrator::test_support::{
    AgentScript, ScriptedAgent, ScriptedTestRunner, TestRepo, TestScript, test_config,
};

struct Harness {
    repo: TestRepo,
    runtime: Runtime,
    agent: Arc<ScriptedAgent>,
    tests: Arc<ScriptedTestRunner>,
}

fn harness(agent: Vec<AgentScript>, tests: Vec<TestScript>) -> Harness {
    harness_with(agent, tests, |_| {})
}

fn harness_with(
    agent: Vec<AgentScript>,
    tests: Vec<TestScript>,
    tweak: impl FnOnce(&mut RuntimeConfig),
) -> Harness {
    let repo = TestRepo::new();
    let mut config = test_config(repo.path());
    tweak(&mut config);
    let agent = ScriptedAgent::new("scripted", agent);
    let registered: Arc<dyn AgentService> = agent.clone();
    let tests = Arc::new(ScriptedTestRunner::new(tests));
    let runtime = Runtime::with_services(
        config,
        repo.path(),
        AgentRegistry::with_agents(vec![registered]),
        tests.clone(),
    )
    .expect("runtime");
    Harness {
        repo,
        runtime,
        agent,
        tests,
    }
}

impl Harness {
    fn submit(&self, goal: &str, task_type: TaskType) -> String {
        self.runtime
            .submit(NewTask::new(goal, task_type))
            .expect("submit")
            .task
            .id
    }

    fn run_next(&self) -> TaskState {
        tick(self.runtime.engine(), "w1")
            .expect("tick")
            .expect("a pending task")
            .1
    }

    fn token(&self, task_id: &str) -> String {
        self.runtime
            .controller()
            .gate()
            .active_token(task_id)
            .expect("lookup")
            .expect("live token")
            .token
    }

    fn states(&self, task_id: &str) -> Vec<String> {
        self.runtime
            .store()
            .list_events(task_id, 500)
            .expect("events")
            .into_iter()
            .filter(|e| e.kind == "task.transition")
            .filter_map(|e| e.payload["to"].as_str().map(str::to_string))
            .collect()
    }
}

#[test]
fn happy_path_runs_two_steps_then_merges() {
    let h = harness(
        vec![
            AgentScript::reply(
                &[("src/lib.rs", "pub fn answer() -> u32 { 41 }\n")],
                "Patched the function.\nTASK_STATE: CONTINUE",
            ),
            AgentScript::done(&[("src/lib.rs", "pub fn answer() -> u32 { 42 }\n")]),
        ],
        vec![
            TestScript::Fail("FAILED tests/test_answer.py::test_answer\n1 failed in 0.02s".to_string()),
            TestScript::Pass,
        ],
    );
    let id = h.submit("fix failing test", TaskType::RepoChange);
    assert_eq!(
        h.runtime.store().require_task(&id).expect("task").state,
        TaskState::Pending
    );

    assert_eq!(h.run_next(), TaskState::WaitingMerge);
    let task = h.runtime.store().require_task(&id).expect("task");
    assert_eq!(task.step_index, 2);
    assert_eq!(h.runtime.store().list_checkpoints(&id).expect("checkpoints").len(), 2);
    let completion = task.completion.expect("completion summary");
    assert_eq!(completion.changed_files, vec!["src/lib.rs".to_string()]);
    assert_eq!(h.tests.commands().len(), 2);
    assert!(h.agent.prompts()[1].contains("test_answer"));

    // VALIDATING always precedes WAITING_MERGE.
    let states = h.states(&id);
    let waiting = states.iter().position(|s| s == "WAITING_MERGE").expect("waiting");
    assert_eq!(states[waiting - 1], "VALIDATING");

    let outcome = h
        .runtime
        .decide(&h.token(&id), DecisionAction::Merge, None, "alice")
        .expect("merge");
    assert_eq!(outcome.task.state, TaskState::Merged);
    assert!(outcome.task.workspace_cleaned_at.is_some());
    assert!(!task.workspace_path.expect("workspace").exists());
    assert_eq!(
        fs::read_to_string(h.repo.path().join("src/lib.rs")).expect("merged file"),
        "pub fn answer() -> u32 { 42 }\n"
    );
    assert_eq!(
        h.repo.git(&["log", "-1", "--format=%s"]),
        format!("runtime(task:{id}): fix failing test")
    );
}

#[test]
fn path_violation_blocks_then_suggest_requeues() {
    let h = harness(
        vec![
            AgentScript::done(&[(".env", "SECRET=1\n")]),
            AgentScript::done(&[("config/settings.toml", "debug = true\n")]),
        ],
        vec![],
    );
    let id = h.submit("tune the settings", TaskType::RepoChange);

    assert_eq!(h.run_next(), TaskState::Blocked);
    let task = h.runtime.store().require_task(&id).expect("task");
    assert!(task.blocked_reason.as_deref().unwrap_or_default().contains(".env"));
    assert!(h.tests.commands().is_empty(), "tests must not run after a violation");

    let outcome = h
        .runtime
        .decide(
            &h.token(&id),
            DecisionAction::Suggest,
            Some("keep secrets out; edit config/settings.toml instead"),
            "alice",
        )
        .expect("suggest");
    assert_eq!(outcome.task.state, TaskState::Pending);
    assert_eq!(
        outcome.task.resume_instruction.as_deref(),
        Some("keep secrets out; edit config/settings.toml instead")
    );

    // The agent backs out the denied file on its retry.
    fs::remove_file(task.workspace_path.expect("workspace").join(".env")).expect("remove");
    assert_eq!(h.run_next(), TaskState::WaitingMerge);
    let prompts = h.agent.prompts();
    assert!(prompts[1].contains("keep secrets out"));
}

#[test]
fn dirty_target_fails_merge_and_keeps_workspace_until_discard() {
    let h = harness(vec![AgentScript::done(&[("notes.md", "notes\n")])], vec![]);
    let id = h.submit("write notes", TaskType::RepoChange);
    assert_eq!(h.run_next(), TaskState::WaitingMerge);

    h.repo.write("README.md", "local edit\n");
    let err = h
        .runtime
        .decide(&h.token(&id), DecisionAction::Merge, None, "alice")
        .unwrap_err();
    assert!(matches!(
        runtime_error(&err),
        Some(RuntimeError::MergePreflight(_))
    ));
    let task = h.runtime.store().require_task(&id).expect("task");
    assert_eq!(task.state, TaskState::MergeFailed);
    assert!(task.error.as_deref().unwrap_or_default().contains("README.md"));
    let workspace = task.live_workspace().expect("workspace").to_path_buf();

    let far_future = Utc::now() + TimeDelta::days(365);
    let sweep = h.runtime.janitor().sweep_at(far_future).expect("sweep");
    assert!(sweep.cleaned.is_empty());
    assert!(workspace.join("notes.md").exists());

    h.runtime.controller().discard(&id, "alice").expect("discard");
    let sweep = h.runtime.janitor().sweep_at(far_future).expect("sweep");
    assert_eq!(sweep.cleaned, vec![id.clone()]);
    assert!(!workspace.exists());
    let task = h.runtime.store().require_task(&id).expect("task");
    assert_eq!(task.state, TaskState::Discarded);
    assert_eq!(h.runtime.store().list_checkpoints(&id).expect("checkpoints").len(), 1);
}

#[test]
fn single_step_budget_times_out_without_second_step() {
    let h = harness(
        vec![
            AgentScript::reply(&[("a.txt", "1")], "Still going.\nTASK_STATE: CONTINUE"),
            AgentScript::done(&[]),
        ],
        vec![],
    );
    let id = h
        .runtime
        .submit(NewTask {
            max_steps: Some(1),
            ..NewTask::new("refactor the module", TaskType::RepoChange)
        })
        .expect("submit")
        .task
        .id;
    assert_eq!(h.run_next(), TaskState::Timeout);
    assert_eq!(h.agent.prompts().len(), 1);
    let task = h.runtime.store().require_task(&id).expect("task");
    assert_eq!(task.step_index, 1);
    assert!(task.error.is_some());
}

#[test]
fn pause_mid_step_preserves_workspace_and_resume_starts_next_step() {
    let h = harness(
        vec![AgentScript::Hang, AgentScript::done(&[("done.txt", "ok\n")])],
        vec![],
    );
    let id = h.submit("draft the changelog", TaskType::RepoChange);

    let engine = h.runtime.engine().clone();
    let worker = std::thread::spawn(move || tick(&engine, "w1").expect("tick"));

    let store = h.runtime.store();
    let workspace = loop {
        let task = store.require_task(&id).expect("task");
        if task.step_index == 1
            && let Some(path) = task.live_workspace()
        {
            break path.to_path_buf();
        }
        std::thread::sleep(Duration::from_millis(10));
    };
    // Work the agent produced before the pause.
    fs::write(workspace.join("partial.txt"), "half done\n").expect("write");
    let paused = h.runtime.controller().request_pause(&id, "alice").expect("pause");
    assert_eq!(paused.control, ControlFlag::PauseRequested);

    let (_, state) = worker.join().expect("join").expect("claimed");
    assert_eq!(state, TaskState::Paused);
    assert_eq!(
        fs::read_to_string(workspace.join("partial.txt")).expect("preserved"),
        "half done\n"
    );

    let resumed = h
        .runtime
        .controller()
        .resume(&id, Some("finish the changelog"), "alice")
        .expect("resume");
    assert_eq!(resumed.state, TaskState::Pending);
    assert_eq!(h.run_next(), TaskState::WaitingMerge);

    let task = store.require_task(&id).expect("task");
    assert_eq!(task.step_index, 2);
    assert_eq!(task.live_workspace(), Some(workspace.as_path()));
    assert!(workspace.join("partial.txt").exists());
    assert!(h.agent.prompts()[1].contains("finish the changelog"));
}

#[test]
fn request_changes_sends_task_back_through_blocked() {
    let h = harness(
        vec![
            AgentScript::done(&[("a.txt", "first\n")]),
            AgentScript::done(&[("a.txt", "second\n")]),
        ],
        vec![],
    );
    let id = h.submit("update a.txt", TaskType::RepoChange);
    assert_eq!(h.run_next(), TaskState::WaitingMerge);

    let outcome = h
        .runtime
        .decide(
            &h.token(&id),
            DecisionAction::RequestChanges,
            Some("use the word second"),
            "alice",
        )
        .expect("request changes");
    assert_eq!(outcome.task.state, TaskState::Blocked);
    let next = outcome.reissued.expect("reissued token");
    assert!(next.actions.contains(&DecisionAction::Approve));

    h.runtime
        .decide(&next.token, DecisionAction::Approve, None, "alice")
        .expect("approve");
    assert_eq!(h.run_next(), TaskState::WaitingMerge);
    assert!(h.agent.prompts()[1].contains("use the word second"));
}

#[test]
fn artifact_tasks_complete_and_report_logs() {
    let h = harness(
        vec![AgentScript::done(&[("report.md", "# Report\n")])],
        vec![TestScript::Pass],
    );
    let id = h.submit("write a weekly report", TaskType::Artifact);
    assert_eq!(h.run_next(), TaskState::Completed);

    let logs = h.runtime.task_logs(&id).expect("logs");
    assert!(logs.contains("status: COMPLETED"));
    assert!(logs.contains("task.transition"));
    assert!(logs.contains("Made the change."));
    let changes = h.runtime.task_changes(&id, 10).expect("changes");
    assert_eq!(changes, vec!["A\treport.md".to_string()]);
}
