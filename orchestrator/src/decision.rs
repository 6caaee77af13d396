//! Decision Gate: single-use, expiring tokens for human decisions.
//!
//! A token is bound to the task state it was issued for and to the actions
//! valid in that state. Consuming a token and applying its effect happen in
//! one transaction, so a replayed or raced token never changes the task twice.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::Connection;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::lifecycle::{check_action, decision_actions};
use crate::core::types::{ControlFlag, DecisionAction, TaskState};
use crate::error::RuntimeError;
use crate::io::config::RuntimeConfig;
use crate::io::store::{
    self, Consumption, DecisionRecord, StateChange, TaskPatch, TaskRecord, TaskStore, format_ts,
};

const REQUEST_CHANGES_REASON: &str = "Requested changes before merge.";

/// What consuming a token did.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub task: TaskRecord,
    pub action: DecisionAction,
    /// Follow-up token issued by `suggest` on a draft or by `request_changes`.
    pub reissued: Option<DecisionRecord>,
    /// The task is claimed for merging; the caller must run the merge gate next.
    pub merge_requested: bool,
}

#[derive(Clone)]
pub struct DecisionGate {
    store: TaskStore,
    config: Arc<RuntimeConfig>,
}

impl DecisionGate {
    pub fn new(store: TaskStore, config: Arc<RuntimeConfig>) -> Self {
        Self { store, config }
    }

    fn ttl(&self) -> TimeDelta {
        i64::try_from(self.config.decision_ttl_minutes)
            .ok()
            .and_then(TimeDelta::try_minutes)
            .unwrap_or(TimeDelta::days(365))
    }

    fn authorize(&self, actor: &str) -> Result<()> {
        if self.config.is_owner(actor) {
            Ok(())
        } else {
            Err(RuntimeError::Unauthorized(actor.to_string()).into())
        }
    }

    /// Issue a fresh token for the task's current state on behalf of `actor`.
    pub fn issue(&self, task_id: &str, suggestion: Option<&str>, actor: &str) -> Result<DecisionRecord> {
        self.issue_at(task_id, suggestion, actor, Utc::now())
    }

    pub fn issue_at(
        &self,
        task_id: &str,
        suggestion: Option<&str>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<DecisionRecord> {
        self.authorize(actor)?;
        let ttl = self.ttl();
        self.store
            .write(|tx| issue_in(tx, task_id, suggestion, actor, now, ttl))
    }

    /// Issue a token from inside the runtime (no owner check).
    pub(crate) fn issue_system(&self, task_id: &str, suggestion: Option<&str>) -> Result<DecisionRecord> {
        let ttl = self.ttl();
        self.store
            .write(|tx| issue_in(tx, task_id, suggestion, "runtime", Utc::now(), ttl))
    }

    /// The live token of a task, if any.
    pub fn active_token(&self, task_id: &str) -> Result<Option<DecisionRecord>> {
        self.store.require_task(task_id)?;
        self.store.active_decision(task_id, &format_ts(Utc::now()))
    }

    pub fn consume(
        &self,
        token: &str,
        action: DecisionAction,
        suggestion: Option<&str>,
        actor: &str,
    ) -> Result<DecisionOutcome> {
        self.consume_at(token, action, suggestion, actor, Utc::now())
    }

    /// Validate and consume `token`, applying `action` atomically.
    #[instrument(skip_all, fields(action = %action, actor))]
    pub fn consume_at(
        &self,
        token: &str,
        action: DecisionAction,
        suggestion: Option<&str>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<DecisionOutcome> {
        self.authorize(actor)?;
        let ttl = self.ttl();
        let suggestion = suggestion.map(str::trim).filter(|s| !s.is_empty());
        let result = self.store.write(|tx| {
            let now_text = format_ts(now);
            let record = store::load_decision(tx, token)?
                .ok_or_else(|| RuntimeError::token("unknown decision token"))?;
            if record.consumed_at.is_some() {
                return Err(RuntimeError::token("decision token already used").into());
            }
            if record.superseded {
                return Err(RuntimeError::token("decision token was superseded").into());
            }
            if record.expires_at <= now_text {
                return Err(RuntimeError::token("decision token expired").into());
            }
            if !record.actions.contains(&action) {
                return Err(RuntimeError::token(format!(
                    "action '{action}' is not allowed by this token"
                ))
                .into());
            }
            let task = store::load_task(tx, &record.task_id)?;
            if task.state != record.bound_state {
                return Err(RuntimeError::token(format!(
                    "task state changed since the token was issued ({} -> {})",
                    record.bound_state, task.state
                ))
                .into());
            }
            check_action(task.state, action)?;

            let guidance = suggestion.or(record.suggestion.as_deref());
            let mut reissue_with: Option<Option<String>> = None;
            let mut merge_requested = false;
            let result = match action {
                DecisionAction::Approve => {
                    let mut patch = TaskPatch {
                        control: Some(ControlFlag::Running),
                        blocked_reason: Some(None),
                        ..TaskPatch::default()
                    };
                    if let Some(text) = guidance {
                        patch.resume_instruction = Some(Some(text.to_string()));
                    }
                    let change = StateChange::to(TaskState::Pending, actor)
                        .from(task.state)
                        .reason("approved")
                        .patch(patch);
                    store::apply_transition(tx, &task.id, &change)?;
                    "approved"
                }
                DecisionAction::Reject => {
                    let change = StateChange::to(TaskState::Rejected, actor)
                        .from(task.state)
                        .reason("rejected");
                    store::apply_transition(tx, &task.id, &change)?;
                    "rejected"
                }
                DecisionAction::Suggest => {
                    let text = suggestion.ok_or_else(|| {
                        RuntimeError::precondition("suggest needs guidance text")
                    })?;
                    if task.state == TaskState::Draft {
                        store::set_resume_instruction(tx, &task.id, Some(text))?;
                        reissue_with = Some(Some(text.to_string()));
                        "guidance recorded"
                    } else {
                        let change = StateChange::to(TaskState::Pending, actor)
                            .from(task.state)
                            .reason("resumed with guidance")
                            .patch(TaskPatch {
                                control: Some(ControlFlag::Running),
                                resume_instruction: Some(Some(text.to_string())),
                                blocked_reason: Some(None),
                                ..TaskPatch::default()
                            });
                        store::apply_transition(tx, &task.id, &change)?;
                        "resumed with guidance"
                    }
                }
                DecisionAction::Merge => {
                    store::claim_merge(tx, &task.id, actor)?;
                    merge_requested = true;
                    "merge requested"
                }
                DecisionAction::Discard => {
                    let change = StateChange::to(TaskState::Discarded, actor)
                        .from(task.state)
                        .reason("discarded");
                    store::apply_transition(tx, &task.id, &change)?;
                    "discarded"
                }
                DecisionAction::RequestChanges => {
                    let mut patch = TaskPatch {
                        blocked_reason: Some(Some(REQUEST_CHANGES_REASON.to_string())),
                        ..TaskPatch::default()
                    };
                    if let Some(text) = suggestion {
                        patch.resume_instruction = Some(Some(text.to_string()));
                    }
                    let change = StateChange::to(TaskState::Blocked, actor)
                        .from(task.state)
                        .reason(REQUEST_CHANGES_REASON)
                        .patch(patch);
                    store::apply_transition(tx, &task.id, &change)?;
                    reissue_with = Some(suggestion.map(str::to_string));
                    "changes requested"
                }
            };

            let consumed = store::consume_decision(
                tx,
                &Consumption {
                    token,
                    action,
                    actor,
                    suggestion,
                    result,
                    now: &now_text,
                },
            )?;
            if !consumed {
                return Err(RuntimeError::token("decision token is no longer valid").into());
            }
            store::supersede_decisions(tx, &task.id)?;
            store::insert_event(
                tx,
                &task.id,
                "task.decision",
                &json!({
                    "action": action.as_str(),
                    "actor": actor,
                    "suggestion": suggestion,
                    "result": result,
                    "status": store::load_task(tx, &task.id)?.state,
                }),
            )?;

            let reissued = match reissue_with {
                Some(bound) => Some(issue_in(tx, &task.id, bound.as_deref(), actor, now, ttl)?),
                None => None,
            };
            Ok(DecisionOutcome {
                task: store::load_task(tx, &task.id)?,
                action,
                reissued,
                merge_requested,
            })
        });
        match &result {
            Ok(outcome) => info!(
                task_id = %outcome.task.id,
                status = %outcome.task.state,
                "decision applied"
            ),
            Err(err) => warn!(err = %err, "decision refused"),
        }
        result
    }
}

fn issue_in(
    conn: &Connection,
    task_id: &str,
    suggestion: Option<&str>,
    actor: &str,
    now: DateTime<Utc>,
    ttl: TimeDelta,
) -> Result<DecisionRecord> {
    let task = store::load_task(conn, task_id)?;
    if task.merge_in_progress() {
        return Err(RuntimeError::precondition(format!(
            "task {task_id} is being merged; no decision is pending"
        ))
        .into());
    }
    let actions = decision_actions(task.state);
    if actions.is_empty() {
        return Err(RuntimeError::precondition(format!(
            "task {task_id} is {}; no decision is pending",
            task.state
        ))
        .into());
    }
    store::supersede_decisions(conn, task_id)?;
    let record = DecisionRecord {
        token: Uuid::new_v4().simple().to_string(),
        task_id: task_id.to_string(),
        bound_state: task.state,
        actions: actions.to_vec(),
        suggestion: suggestion.map(str::to_string),
        issued_by: actor.to_string(),
        created_at: format_ts(now),
        expires_at: format_ts(now + ttl),
        consumed_at: None,
        consumed_by: None,
        consumed_action: None,
        consumed_suggestion: None,
        result: None,
        superseded: false,
    };
    store::insert_decision(conn, &record)?;
    store::insert_event(
        conn,
        task_id,
        "task.decision_issued",
        &json!({
            "status": task.state,
            "actions": actions.iter().map(|a| a.as_str()).collect::<Vec<_>>(),
            "expires_at": record.expires_at,
            "actor": actor,
        }),
    )?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FinishRoute, RiskLevel, TaskSource, TaskType};
    use crate::io::store::TaskInsert;

    fn gate_with(owners: Vec<String>) -> (TaskStore, DecisionGate) {
        let store = TaskStore::open_in_memory().expect("store");
        let config = RuntimeConfig {
            owners,
            decision_ttl_minutes: 60,
            ..RuntimeConfig::default()
        };
        let gate = DecisionGate::new(store.clone(), Arc::new(config));
        (store, gate)
    }

    fn insert(store: &TaskStore, id: &str, state: TaskState) {
        store
            .insert_task(&TaskInsert {
                id: id.to_string(),
                goal: "update docs".to_string(),
                task_type: TaskType::RepoChange,
                source: TaskSource::Manual,
                state,
                risk_level: RiskLevel::High,
                risk_reasons: vec!["manual".to_string()],
                finish: FinishRoute::MergeGate,
                validate_skill: false,
                skill_name: None,
                force_draft: true,
                agent: None,
                test_command: "true".to_string(),
                max_steps: 3,
                max_minutes: 5,
                created_by: "alice".to_string(),
            })
            .expect("insert");
    }

    fn rejection(err: &anyhow::Error) -> Option<&RuntimeError> {
        crate::error::runtime_error(err)
    }

    #[test]
    fn approve_moves_draft_to_pending_once() {
        let (store, gate) = gate_with(Vec::new());
        insert(&store, "t1", TaskState::Draft);
        let token = gate.issue("t1", None, "alice").expect("issue");
        assert_eq!(token.actions.len(), 3);

        let outcome = gate
            .consume(&token.token, DecisionAction::Approve, None, "alice")
            .expect("approve");
        assert_eq!(outcome.task.state, TaskState::Pending);

        let err = gate
            .consume(&token.token, DecisionAction::Approve, None, "alice")
            .unwrap_err();
        assert!(matches!(
            rejection(&err),
            Some(RuntimeError::DecisionTokenInvalid(_))
        ));
        assert_eq!(
            store.require_task("t1").expect("task").state,
            TaskState::Pending
        );
        let audit = store.get_decision(&token.token).expect("get").expect("row");
        assert_eq!(audit.consumed_action, Some(DecisionAction::Approve));
        assert_eq!(audit.consumed_by.as_deref(), Some("alice"));
    }

    #[test]
    fn expired_token_is_rejected_without_change() {
        let (store, gate) = gate_with(Vec::new());
        insert(&store, "t1", TaskState::Draft);
        let issued_at = Utc::now();
        let token = gate.issue_at("t1", None, "alice", issued_at).expect("issue");
        let err = gate
            .consume_at(
                &token.token,
                DecisionAction::Approve,
                None,
                "alice",
                issued_at + TimeDelta::minutes(61),
            )
            .unwrap_err();
        assert_eq!(
            rejection(&err),
            Some(&RuntimeError::token("decision token expired"))
        );
        assert_eq!(store.require_task("t1").expect("task").state, TaskState::Draft);
    }

    #[test]
    fn issuing_supersedes_previous_token() {
        let (store, gate) = gate_with(Vec::new());
        insert(&store, "t1", TaskState::Draft);
        let first = gate.issue("t1", None, "alice").expect("issue");
        let second = gate.issue("t1", None, "alice").expect("issue");
        let err = gate
            .consume(&first.token, DecisionAction::Reject, None, "alice")
            .unwrap_err();
        assert_eq!(
            rejection(&err),
            Some(&RuntimeError::token("decision token was superseded"))
        );
        assert_eq!(
            gate.active_token("t1").expect("active").map(|d| d.token),
            Some(second.token)
        );
    }

    #[test]
    fn action_outside_token_is_rejected() {
        let (store, gate) = gate_with(Vec::new());
        insert(&store, "t1", TaskState::Draft);
        let token = gate.issue("t1", None, "alice").expect("issue");
        let err = gate
            .consume(&token.token, DecisionAction::Merge, None, "alice")
            .unwrap_err();
        assert!(matches!(
            rejection(&err),
            Some(RuntimeError::DecisionTokenInvalid(_))
        ));
    }

    #[test]
    fn token_is_void_after_state_moves_on() {
        let (store, gate) = gate_with(Vec::new());
        insert(&store, "t1", TaskState::Draft);
        let token = gate.issue("t1", None, "alice").expect("issue");
        store
            .transition("t1", &StateChange::to(TaskState::Stopped, "alice"))
            .expect("stop");
        let err = gate
            .consume(&token.token, DecisionAction::Approve, None, "alice")
            .unwrap_err();
        assert!(err.to_string().contains("task state changed"));
        assert!(gate.active_token("t1").expect("active").is_none());
    }

    #[test]
    fn suggest_on_draft_keeps_draft_and_reissues() {
        let (store, gate) = gate_with(Vec::new());
        insert(&store, "t1", TaskState::Draft);
        let token = gate.issue("t1", None, "alice").expect("issue");
        let outcome = gate
            .consume(
                &token.token,
                DecisionAction::Suggest,
                Some("keep the public API"),
                "alice",
            )
            .expect("suggest");
        assert_eq!(outcome.task.state, TaskState::Draft);
        assert_eq!(
            outcome.task.resume_instruction.as_deref(),
            Some("keep the public API")
        );
        let reissued = outcome.reissued.expect("reissued");
        assert_eq!(reissued.suggestion.as_deref(), Some("keep the public API"));

        let approved = gate
            .consume(&reissued.token, DecisionAction::Approve, None, "alice")
            .expect("approve");
        assert_eq!(approved.task.state, TaskState::Pending);
        assert_eq!(
            approved.task.resume_instruction.as_deref(),
            Some("keep the public API")
        );
    }

    #[test]
    fn suggest_without_text_is_a_precondition_failure() {
        let (store, gate) = gate_with(Vec::new());
        insert(&store, "t1", TaskState::Blocked);
        let token = gate.issue("t1", None, "alice").expect("issue");
        let err = gate
            .consume(&token.token, DecisionAction::Suggest, Some("  "), "alice")
            .unwrap_err();
        assert!(matches!(rejection(&err), Some(RuntimeError::Precondition(_))));
        assert!(store
            .get_decision(&token.token)
            .expect("get")
            .expect("row")
            .consumed_at
            .is_none());
    }

    #[test]
    fn request_changes_blocks_and_reissues_approval_token() {
        let (store, gate) = gate_with(Vec::new());
        insert(&store, "t1", TaskState::Pending);
        store.claim_next("w1").expect("claim");
        store
            .transition("t1", &StateChange::to(TaskState::Validating, "w1"))
            .expect("validating");
        store
            .transition(
                "t1",
                &StateChange::to(TaskState::WaitingMerge, "w1").patch(TaskPatch {
                    release_lease: true,
                    ..TaskPatch::default()
                }),
            )
            .expect("waiting");
        let token = gate.issue("t1", None, "alice").expect("issue");
        let outcome = gate
            .consume(
                &token.token,
                DecisionAction::RequestChanges,
                Some("add a changelog entry"),
                "alice",
            )
            .expect("request changes");
        assert_eq!(outcome.task.state, TaskState::Blocked);
        assert_eq!(
            outcome.task.blocked_reason.as_deref(),
            Some(REQUEST_CHANGES_REASON)
        );
        let reissued = outcome.reissued.expect("reissued");
        assert_eq!(
            reissued.actions,
            vec![
                DecisionAction::Approve,
                DecisionAction::Reject,
                DecisionAction::Suggest
            ]
        );

        let approved = gate
            .consume(&reissued.token, DecisionAction::Approve, None, "alice")
            .expect("approve");
        assert_eq!(approved.task.state, TaskState::Pending);
        assert_eq!(approved.task.blocked_reason, None);
        assert_eq!(
            approved.task.resume_instruction.as_deref(),
            Some("add a changelog entry")
        );
    }

    #[test]
    fn merge_claims_the_task_without_a_state_change() {
        let (store, gate) = gate_with(Vec::new());
        insert(&store, "t1", TaskState::Pending);
        store.claim_next("w1").expect("claim");
        store
            .transition("t1", &StateChange::to(TaskState::Validating, "w1"))
            .expect("validating");
        store
            .transition(
                "t1",
                &StateChange::to(TaskState::WaitingMerge, "w1").patch(TaskPatch {
                    release_lease: true,
                    ..TaskPatch::default()
                }),
            )
            .expect("waiting");
        let token = gate.issue("t1", None, "alice").expect("issue");
        let outcome = gate
            .consume(&token.token, DecisionAction::Merge, None, "alice")
            .expect("merge");
        assert!(outcome.merge_requested);
        assert_eq!(outcome.task.state, TaskState::WaitingMerge);
        assert!(outcome.task.merge_in_progress());

        let err = gate.issue("t1", None, "alice").unwrap_err();
        assert!(matches!(rejection(&err), Some(RuntimeError::Precondition(_))));
    }

    #[test]
    fn non_owner_is_unauthorized() {
        let (store, gate) = gate_with(vec!["alice".to_string()]);
        insert(&store, "t1", TaskState::Draft);
        let err = gate.issue("t1", None, "mallory").unwrap_err();
        assert_eq!(
            rejection(&err),
            Some(&RuntimeError::Unauthorized("mallory".to_string()))
        );
    }

    #[test]
    fn no_token_for_states_without_decisions() {
        let (store, gate) = gate_with(Vec::new());
        insert(&store, "t1", TaskState::Pending);
        let err = gate.issue("t1", None, "alice").unwrap_err();
        assert!(matches!(rejection(&err), Some(RuntimeError::Precondition(_))));
    }
}
