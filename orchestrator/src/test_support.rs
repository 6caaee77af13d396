//! Test-only helpers: a throwaway git repository and scripted services.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::io::agent::{AgentRequest, AgentService};
use crate::io::config::{AgentConfig, RuntimeConfig};
use crate::io::process::{Invocation, InvocationOutput};
use crate::io::test_runner::{TestRequest, TestRunner};

/// A git repository in a temp dir with one commit containing `README.md`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Self { dir };
        repo.git(&["init", "--quiet", "--initial-branch=main"]);
        repo.git(&["config", "user.name", "Test User"]);
        repo.git(&["config", "user.email", "test@example.com"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        repo.write("README.md", "# test repo\n");
        repo.commit_all("initial commit");
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run git in the repository and return trimmed stdout. Panics on failure.
    pub fn git(&self, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .expect("run git");
        assert!(
            out.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write file");
    }

    pub fn commit_all(&self, message: &str) {
        self.git(&["add", "-A", "--", ".", ":(exclude).runtime"]);
        self.git(&["commit", "--quiet", "-m", message]);
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// Config tuned for tests: fast polling, one scripted agent, `true` as tests.
pub fn test_config(repo: &Path) -> RuntimeConfig {
    let mut config = RuntimeConfig {
        repo_root: repo.to_path_buf(),
        worker_concurrency: 2,
        poll_interval_ms: 20,
        default_test_command: "true".to_string(),
        agents: vec![AgentConfig {
            name: "scripted".to_string(),
            command: vec!["scripted".to_string()],
        }],
        ..RuntimeConfig::default()
    };
    config.heartbeat.agent_interval_ms = 10;
    config.heartbeat.test_interval_ms = 10;
    config.heartbeat.progress_persist_ms = 50;
    config.janitor.enabled = false;
    config
}

/// One scripted agent call.
#[derive(Debug, Clone)]
pub enum AgentScript {
    /// Write `files` into the workspace, then print `output`.
    Reply {
        files: Vec<(String, String)>,
        output: String,
    },
    /// `start` fails with this message.
    StartError(String),
    /// Never finishes on its own.
    Hang,
}

impl AgentScript {
    pub fn reply(files: &[(&str, &str)], output: &str) -> Self {
        AgentScript::Reply {
            files: files
                .iter()
                .map(|(path, body)| ((*path).to_string(), (*body).to_string()))
                .collect(),
            output: output.to_string(),
        }
    }

    pub fn done(files: &[(&str, &str)]) -> Self {
        Self::reply(files, "Made the change.\nTASK_STATE: DONE")
    }
}

/// Agent that plays back [`AgentScript`]s in order and records prompts.
pub struct ScriptedAgent {
    name: String,
    scripts: Mutex<VecDeque<AgentScript>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(name: &str, scripts: Vec<AgentScript>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            scripts: Mutex::new(scripts.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

impl AgentService for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, request: &AgentRequest) -> Result<Box<dyn Invocation>> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(request.prompt.clone());
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .ok_or_else(|| anyhow!("agent script exhausted"))?;
        match script {
            AgentScript::Reply { files, output } => {
                for (rel, body) in files {
                    let path = request.workdir.join(rel);
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(path, body)?;
                }
                Ok(Box::new(Ready::new(true, output)))
            }
            AgentScript::StartError(message) => Err(anyhow!(message)),
            AgentScript::Hang => Ok(Box::new(Hanging::new(String::new()))),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TestScript {
    Pass,
    Fail(String),
    /// Prints the text, then never finishes.
    Hang(String),
}

/// Test runner that plays back [`TestScript`]s; passes once they run out.
#[derive(Default)]
pub struct ScriptedTestRunner {
    scripts: Mutex<VecDeque<TestScript>>,
    commands: Mutex<Vec<String>>,
}

impl ScriptedTestRunner {
    pub fn new(scripts: Vec<TestScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock").clone()
    }
}

impl TestRunner for ScriptedTestRunner {
    fn start(&self, request: &TestRequest) -> Result<Box<dyn Invocation>> {
        self.commands
            .lock()
            .expect("commands lock")
            .push(request.command.clone());
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .unwrap_or(TestScript::Pass);
        Ok(match script {
            TestScript::Pass => Box::new(Ready::new(true, "1 passed in 0.01s".to_string())),
            TestScript::Fail(output) => Box::new(Ready::new(false, output)),
            TestScript::Hang(output) => Box::new(Hanging::new(output)),
        })
    }
}

/// Invocation that finishes on the first poll.
struct Ready {
    output: Option<InvocationOutput>,
}

impl Ready {
    fn new(success: bool, stdout: String) -> Self {
        Self {
            output: Some(InvocationOutput {
                exit_code: Some(if success { 0 } else { 1 }),
                success,
                stdout,
                ..InvocationOutput::default()
            }),
        }
    }
}

impl Invocation for Ready {
    fn wait_timeout(&mut self, _timeout: Duration) -> Result<Option<InvocationOutput>> {
        self.output
            .take()
            .map(Some)
            .ok_or_else(|| anyhow!("invocation already finished"))
    }

    fn cancel(&mut self) -> Result<Option<InvocationOutput>> {
        Ok(None)
    }
}

/// Invocation that runs until cancelled.
struct Hanging {
    partial: String,
    cancelled: bool,
}

impl Hanging {
    fn new(partial: String) -> Self {
        Self {
            partial,
            cancelled: false,
        }
    }
}

impl Invocation for Hanging {
    fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<InvocationOutput>> {
        if self.cancelled {
            return Err(anyhow!("invocation was cancelled"));
        }
        thread::sleep(timeout.min(Duration::from_millis(10)));
        Ok(None)
    }

    fn cancel(&mut self) -> Result<Option<InvocationOutput>> {
        if self.cancelled {
            return Ok(None);
        }
        self.cancelled = true;
        Ok(Some(InvocationOutput {
            exit_code: None,
            success: false,
            stdout: std::mem::take(&mut self.partial),
            ..InvocationOutput::default()
        }))
    }
}
