//! Shared deterministic types for the task runtime.
//!
//! These types define the stable contracts between the store, the lifecycle
//! controller and the step engine. Their string forms are persisted, so the
//! `as_str`/`parse` pairs must stay in sync with the database contents.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Persisted lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Draft,
    Pending,
    Running,
    Validating,
    Paused,
    WaitingMerge,
    Completed,
    Merged,
    MergeFailed,
    Discarded,
    Blocked,
    Failed,
    Timeout,
    Stopped,
    Rejected,
}

impl TaskState {
    pub const ALL: [TaskState; 15] = [
        TaskState::Draft,
        TaskState::Pending,
        TaskState::Running,
        TaskState::Validating,
        TaskState::Paused,
        TaskState::WaitingMerge,
        TaskState::Completed,
        TaskState::Merged,
        TaskState::MergeFailed,
        TaskState::Discarded,
        TaskState::Blocked,
        TaskState::Failed,
        TaskState::Timeout,
        TaskState::Stopped,
        TaskState::Rejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Draft => "DRAFT",
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Validating => "VALIDATING",
            TaskState::Paused => "PAUSED",
            TaskState::WaitingMerge => "WAITING_MERGE",
            TaskState::Completed => "COMPLETED",
            TaskState::Merged => "MERGED",
            TaskState::MergeFailed => "MERGE_FAILED",
            TaskState::Discarded => "DISCARDED",
            TaskState::Blocked => "BLOCKED",
            TaskState::Failed => "FAILED",
            TaskState::Timeout => "TIMEOUT",
            TaskState::Stopped => "STOPPED",
            TaskState::Rejected => "REJECTED",
        }
    }

    /// Terminal states never run again. `MERGE_FAILED` still accepts `discard`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed
                | TaskState::Merged
                | TaskState::MergeFailed
                | TaskState::Discarded
                | TaskState::Rejected
                | TaskState::Failed
                | TaskState::Timeout
                | TaskState::Stopped
        )
    }

    /// States in which a worker holds (or held, before a crash) the lease.
    pub fn is_inflight(self) -> bool {
        matches!(self, TaskState::Running | TaskState::Validating)
    }

    /// States rendered by decision surfaces.
    pub fn awaits_decision(self) -> bool {
        matches!(
            self,
            TaskState::Draft | TaskState::Blocked | TaskState::WaitingMerge
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow!("unknown task state '{s}'"))
    }
}

/// Where a finished task goes once its final step passes validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishRoute {
    /// `VALIDATING → COMPLETED`.
    Complete,
    /// `VALIDATING → WAITING_MERGE`, then the merge gate.
    MergeGate,
}

impl FinishRoute {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishRoute::Complete => "complete",
            FinishRoute::MergeGate => "merge_gate",
        }
    }
}

impl FromStr for FinishRoute {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "complete" => Ok(FinishRoute::Complete),
            "merge_gate" => Ok(FinishRoute::MergeGate),
            other => Err(anyhow!("unknown finish route '{other}'")),
        }
    }
}

/// Kind of work a task performs. Per-variant behavior is resolved once, at
/// creation, into a [`TaskProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Artifact,
    RepoChange,
    SkillChange,
}

/// Behavior switches derived from a [`TaskType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskProfile {
    pub finish: FinishRoute,
    pub validate_skill: bool,
    pub always_draft: bool,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Artifact => "artifact",
            TaskType::RepoChange => "repo_change",
            TaskType::SkillChange => "skill_change",
        }
    }

    pub fn profile(self) -> TaskProfile {
        match self {
            TaskType::Artifact => TaskProfile {
                finish: FinishRoute::Complete,
                validate_skill: false,
                always_draft: false,
            },
            TaskType::RepoChange => TaskProfile {
                finish: FinishRoute::MergeGate,
                validate_skill: false,
                always_draft: false,
            },
            TaskType::SkillChange => TaskProfile {
                finish: FinishRoute::MergeGate,
                validate_skill: true,
                always_draft: true,
            },
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "artifact" => Ok(TaskType::Artifact),
            "repo_change" => Ok(TaskType::RepoChange),
            "skill_change" => Ok(TaskType::SkillChange),
            other => Err(anyhow!("unknown task type '{other}'")),
        }
    }
}

/// Who submitted a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Message,
    Scheduler,
    Router,
    Manual,
}

impl TaskSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskSource::Message => "message",
            TaskSource::Scheduler => "scheduler",
            TaskSource::Router => "router",
            TaskSource::Manual => "manual",
        }
    }
}

impl FromStr for TaskSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "message" => Ok(TaskSource::Message),
            "scheduler" => Ok(TaskSource::Scheduler),
            "router" => Ok(TaskSource::Router),
            "manual" => Ok(TaskSource::Manual),
            other => Err(anyhow!("unknown task source '{other}'")),
        }
    }
}

/// Out-of-band control request, separate from the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlFlag {
    Running,
    PauseRequested,
    StopRequested,
}

impl ControlFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlFlag::Running => "RUNNING",
            ControlFlag::PauseRequested => "PAUSE_REQUESTED",
            ControlFlag::StopRequested => "STOP_REQUESTED",
        }
    }

    /// Lifecycle state a worker drives to after honoring this flag.
    pub fn target_state(self) -> Option<TaskState> {
        match self {
            ControlFlag::Running => None,
            ControlFlag::PauseRequested => Some(TaskState::Paused),
            ControlFlag::StopRequested => Some(TaskState::Stopped),
        }
    }
}

impl FromStr for ControlFlag {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "RUNNING" => Ok(ControlFlag::Running),
            "PAUSE_REQUESTED" => Ok(ControlFlag::PauseRequested),
            "STOP_REQUESTED" => Ok(ControlFlag::StopRequested),
            other => Err(anyhow!("unknown control flag '{other}'")),
        }
    }
}

/// Risk classification computed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::High => "high",
        }
    }
}

impl FromStr for RiskLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "low" => Ok(RiskLevel::Low),
            "high" => Ok(RiskLevel::High),
            other => Err(anyhow!("unknown risk level '{other}'")),
        }
    }
}

/// Human action carried by a decision token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Approve,
    Reject,
    Suggest,
    Merge,
    Discard,
    RequestChanges,
}

impl DecisionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionAction::Approve => "approve",
            DecisionAction::Reject => "reject",
            DecisionAction::Suggest => "suggest",
            DecisionAction::Merge => "merge",
            DecisionAction::Discard => "discard",
            DecisionAction::RequestChanges => "request_changes",
        }
    }
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "approve" => Ok(DecisionAction::Approve),
            "reject" => Ok(DecisionAction::Reject),
            "suggest" => Ok(DecisionAction::Suggest),
            "merge" => Ok(DecisionAction::Merge),
            "discard" => Ok(DecisionAction::Discard),
            "request_changes" | "request-changes" => Ok(DecisionAction::RequestChanges),
            other => Err(anyhow!("unknown decision action '{other}'")),
        }
    }
}

/// Agent-declared outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", content = "reason", rename_all = "lowercase")]
pub enum StepSignal {
    Done,
    Continue,
    Blocked(String),
}

impl StepSignal {
    pub fn label(&self) -> &'static str {
        match self {
            StepSignal::Done => "DONE",
            StepSignal::Continue => "CONTINUE",
            StepSignal::Blocked(_) => "BLOCKED",
        }
    }
}

/// Result of the test runner for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub passed: bool,
    pub exit_code: Option<i32>,
    /// Combined stdout + stderr, bounded by the output limit.
    pub output: String,
    pub timed_out: bool,
}

/// Structured completion summary filled on terminal success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSummary {
    pub goal: String,
    pub steps: u32,
    pub changed_files: Vec<String>,
    pub tests_passed: Option<u32>,
    pub tests_failed: Option<u32>,
    pub agent_secs: f64,
    pub test_secs: f64,
    pub elapsed_secs: f64,
}

/// Cumulative timing metrics (milliseconds), kept across resumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub agent_ms: u64,
    pub test_ms: u64,
    pub elapsed_ms: u64,
}
