//! Supervision of long-running agent and test invocations.
//!
//! The worker polls an [`Invocation`] in slices. Every slice it logs a
//! heartbeat, re-reads the task's control flag and checks the timeout.
//! Progress is persisted as an event at most once per `persist_every`.

use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use crate::core::types::ControlFlag;
use crate::io::process::{Invocation, InvocationOutput};
use crate::io::store::TaskStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Agent,
    Tests,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Agent => "agent",
            Phase::Tests => "tests",
        }
    }

    fn progress_kind(self) -> &'static str {
        match self {
            Phase::Agent => "task.agent_progress",
            Phase::Tests => "task.test_progress",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    pub persist_every: Duration,
    pub timeout: Duration,
}

/// How a supervised invocation ended.
#[derive(Debug)]
pub enum Supervised {
    Finished(InvocationOutput),
    /// A pause or stop was requested; the invocation was cancelled.
    Cancelled(ControlFlag),
    /// Carries the output captured before the kill, when available.
    TimedOut(Option<InvocationOutput>),
}

/// Context attached to heartbeat logs and progress events.
#[derive(Debug, Clone, Copy)]
pub struct Subject<'a> {
    pub task_id: &'a str,
    pub step: u32,
    pub phase: Phase,
    /// Agent name or test command.
    pub label: &'a str,
}

/// Poll `invocation` until it finishes, is cancelled by a control request,
/// or exceeds `settings.timeout`.
pub fn supervise(
    store: &TaskStore,
    subject: Subject<'_>,
    settings: &HeartbeatSettings,
    invocation: &mut dyn Invocation,
) -> Result<Supervised> {
    let started = Instant::now();
    let mut last_persist = started;
    loop {
        let elapsed = started.elapsed();
        let remaining = settings.timeout.saturating_sub(elapsed);
        if remaining.is_zero() {
            warn!(
                task_id = subject.task_id,
                phase = subject.phase.as_str(),
                timeout_secs = settings.timeout.as_secs(),
                "invocation timed out"
            );
            let partial = invocation.cancel()?;
            return Ok(Supervised::TimedOut(partial));
        }

        let slice = settings.interval.min(remaining);
        if let Some(output) = invocation.wait_timeout(slice)? {
            return Ok(Supervised::Finished(output));
        }

        let elapsed = started.elapsed();
        info!(
            task_id = subject.task_id,
            step = subject.step,
            phase = subject.phase.as_str(),
            elapsed_seconds = elapsed.as_secs(),
            "still running"
        );
        if last_persist.elapsed() >= settings.persist_every {
            last_persist = Instant::now();
            let mut payload = json!({
                "phase": subject.phase.as_str(),
                "step": subject.step,
                "elapsed_seconds": elapsed.as_secs(),
            });
            match subject.phase {
                Phase::Agent => payload["agent"] = json!(subject.label),
                Phase::Tests => payload["command"] = json!(subject.label),
            }
            store.append_event(subject.task_id, subject.phase.progress_kind(), &payload)?;
        }

        let control = store.require_task(subject.task_id)?.control;
        if control != ControlFlag::Running {
            info!(
                task_id = subject.task_id,
                control = control.as_str(),
                "control request observed, cancelling"
            );
            invocation.cancel()?;
            return Ok(Supervised::Cancelled(control));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FinishRoute, RiskLevel, TaskSource, TaskState, TaskType};
    use crate::io::store::TaskInsert;

    /// Finishes after `polls` waits.
    struct Countdown {
        polls: u32,
        cancelled: bool,
    }

    impl Invocation for Countdown {
        fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<InvocationOutput>> {
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
            if self.polls == 0 {
                return Ok(Some(InvocationOutput {
                    exit_code: Some(0),
                    success: true,
                    ..InvocationOutput::default()
                }));
            }
            self.polls -= 1;
            Ok(None)
        }

        fn cancel(&mut self) -> Result<Option<InvocationOutput>> {
            self.cancelled = true;
            Ok(None)
        }
    }

    fn store_with_task() -> TaskStore {
        let store = TaskStore::open_in_memory().expect("store");
        store
            .insert_task(&TaskInsert {
                id: "t1".to_string(),
                goal: "goal".to_string(),
                task_type: TaskType::RepoChange,
                source: TaskSource::Manual,
                state: TaskState::Pending,
                risk_level: RiskLevel::Low,
                risk_reasons: Vec::new(),
                finish: FinishRoute::MergeGate,
                validate_skill: false,
                skill_name: None,
                force_draft: false,
                agent: None,
                test_command: "true".to_string(),
                max_steps: 3,
                max_minutes: 5,
                created_by: "tester".to_string(),
            })
            .expect("insert");
        store.claim_next("w1").expect("claim");
        store
    }

    fn subject() -> Subject<'static> {
        Subject {
            task_id: "t1",
            step: 1,
            phase: Phase::Agent,
            label: "scripted",
        }
    }

    fn settings(timeout: Duration) -> HeartbeatSettings {
        HeartbeatSettings {
            interval: Duration::from_millis(1),
            persist_every: Duration::ZERO,
            timeout,
        }
    }

    #[test]
    fn finished_invocation_persists_progress() {
        let store = store_with_task();
        let mut inv = Countdown {
            polls: 2,
            cancelled: false,
        };
        let out = supervise(&store, subject(), &settings(Duration::from_secs(5)), &mut inv)
            .expect("supervise");
        assert!(matches!(out, Supervised::Finished(o) if o.success));
        let progress = store
            .list_events("t1", 20)
            .expect("events")
            .into_iter()
            .filter(|e| e.kind == "task.agent_progress")
            .count();
        assert_eq!(progress, 2);
    }

    #[test]
    fn pause_request_cancels() {
        let store = store_with_task();
        store
            .set_control("t1", ControlFlag::PauseRequested, "alice")
            .expect("flag");
        let mut inv = Countdown {
            polls: 100,
            cancelled: false,
        };
        let out = supervise(&store, subject(), &settings(Duration::from_secs(5)), &mut inv)
            .expect("supervise");
        assert!(matches!(out, Supervised::Cancelled(ControlFlag::PauseRequested)));
        assert!(inv.cancelled);
    }

    #[test]
    fn timeout_cancels() {
        let store = store_with_task();
        let mut inv = Countdown {
            polls: u32::MAX,
            cancelled: false,
        };
        let out = supervise(
            &store,
            subject(),
            &settings(Duration::from_millis(20)),
            &mut inv,
        )
        .expect("supervise");
        assert!(matches!(out, Supervised::TimedOut(None)));
        assert!(inv.cancelled);
    }
}
