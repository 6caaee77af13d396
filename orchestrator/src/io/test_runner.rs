//! Test runner service: runs the task's test command in its workspace.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Result, anyhow};
use tracing::debug;

use crate::io::process::{Invocation, spawn_supervised};

#[derive(Debug, Clone)]
pub struct TestRequest {
    pub task_id: String,
    pub workdir: PathBuf,
    pub command: String,
    pub output_limit_bytes: usize,
}

pub trait TestRunner: Send + Sync {
    fn start(&self, request: &TestRequest) -> Result<Box<dyn Invocation>>;
}

/// Runs the command through `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct ShellTestRunner;

impl TestRunner for ShellTestRunner {
    fn start(&self, request: &TestRequest) -> Result<Box<dyn Invocation>> {
        if request.command.trim().is_empty() {
            return Err(anyhow!("task {} has an empty test command", request.task_id));
        }
        let mut cmd = Command::new("sh");
        cmd.args(["-c", &request.command])
            .current_dir(&request.workdir)
            .env("RUNTIME_TASK_ID", &request.task_id);
        debug!(command = %request.command, "starting tests");
        Ok(Box::new(spawn_supervised(
            cmd,
            None,
            request.output_limit_bytes,
        )?))
    }
}
