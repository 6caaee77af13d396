//! Log query surface: a readable digest of one task's recent history.

use std::fmt::Write as _;

use anyhow::Result;
use serde_json::Value;
use tracing::warn;

use crate::core::summary::{head, summarize_test_output, tail};
use crate::io::config::LogsConfig;
use crate::io::store::{EventRecord, TaskStore};
use crate::io::workspace::WorkspaceManager;

/// Payload keys shown in event digests, in display order.
const DIGEST_KEYS: [&str; 9] = [
    "phase",
    "step",
    "agent",
    "elapsed_seconds",
    "test_exit_code",
    "timeout_seconds",
    "command",
    "status",
    "error",
];
const DIGEST_CHARS: usize = 220;
const FIELD_CHARS: usize = 240;
const LOGS_CHARS: usize = 3800;
pub const CHANGES_LIMIT: usize = 80;

/// Status, recent events and the last checkpoint's output tails.
pub fn task_logs(store: &TaskStore, logs: &LogsConfig, task_id: &str) -> Result<String> {
    let task = store.require_task(task_id)?;
    let mut out = String::new();
    let _ = writeln!(out, "task {}", task.id);
    let _ = writeln!(out, "status: {}", task.state);
    let _ = writeln!(out, "step: {}/{}", task.step_index, task.max_steps);
    if let Some(summary) = &task.summary {
        let _ = writeln!(out, "summary: {}", head(summary, FIELD_CHARS));
    }
    if let Some(reason) = &task.blocked_reason {
        let _ = writeln!(out, "blocked: {}", head(reason, FIELD_CHARS));
    }
    if let Some(error) = &task.error {
        let _ = writeln!(out, "error: {}", head(error, FIELD_CHARS));
    }

    let events = store.list_events(&task.id, logs.event_limit)?;
    if !events.is_empty() {
        out.push_str("\nrecent events:\n");
        for event in &events {
            out.push_str(&event_line(event));
            out.push('\n');
        }
    }

    if let Some(last) = store.last_checkpoint(&task.id)? {
        let agent_tail = tail(&last.checkpoint.agent_output, logs.tail_chars);
        if !agent_tail.is_empty() {
            let _ = write!(out, "\nlast agent output (step {}):\n{agent_tail}\n", last.checkpoint.step);
        }
        let tests = summarize_test_output(&last.checkpoint.test_output, logs.tail_chars);
        if !tests.is_empty() {
            let _ = write!(out, "\nlast test result:\n{tests}\n");
        }
    }
    Ok(head(out.trim_end(), LOGS_CHARS))
}

fn event_line(event: &EventRecord) -> String {
    let digest = summarize_event_payload(&event.payload);
    if digest.is_empty() {
        format!("  #{} {} {}", event.seq, event.created_at, event.kind)
    } else {
        format!("  #{} {} {}: {digest}", event.seq, event.created_at, event.kind)
    }
}

/// `key=value` pairs of the interesting payload fields, on one line.
pub fn summarize_event_payload(payload: &Value) -> String {
    let Some(fields) = payload.as_object() else {
        return String::new();
    };
    let parts: Vec<String> = DIGEST_KEYS
        .iter()
        .filter_map(|key| {
            let value = match fields.get(*key)? {
                Value::Null => return None,
                Value::String(s) if s.is_empty() => return None,
                Value::String(s) => s.split_whitespace().collect::<Vec<_>>().join(" "),
                other => other.to_string(),
            };
            Some(format!("{key}={value}"))
        })
        .collect();
    head(&parts.join(", "), DIGEST_CHARS)
}

/// Name-status lines of a task's changes. Falls back to the last
/// checkpoint's file list once the workspace is gone.
pub fn task_changes(
    store: &TaskStore,
    workspaces: &WorkspaceManager,
    task_id: &str,
    limit: usize,
) -> Result<Vec<String>> {
    let task = store.require_task(task_id)?;
    if let (Some(path), Some(base)) = (task.live_workspace(), task.base_revision.as_deref())
        && path.exists()
    {
        match workspaces.change_listing(path, base) {
            Ok(lines) if !lines.is_empty() => return Ok(lines.into_iter().take(limit).collect()),
            Ok(_) => {}
            Err(err) => warn!(task_id, err = %format!("{err:#}"), "listing workspace changes failed"),
        }
    }
    Ok(store
        .last_checkpoint(&task.id)?
        .map(|last| {
            last.checkpoint
                .changed_files
                .iter()
                .take(limit)
                .map(|path| format!("M\t{path}"))
                .collect()
        })
        .unwrap_or_default())
}
