//! Agent execution service.
//!
//! An agent is an external command that receives the step prompt on stdin,
//! edits files in its working directory, and prints its report on stdout.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::debug;

use crate::io::config::AgentConfig;
use crate::io::process::{Invocation, spawn_supervised};

/// One agent call for one step.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task_id: String,
    pub step: u32,
    pub workdir: PathBuf,
    pub prompt: String,
    pub output_limit_bytes: usize,
}

pub trait AgentService: Send + Sync {
    fn name(&self) -> &str;

    /// Start the agent; the returned invocation is polled by the step engine.
    fn start(&self, request: &AgentRequest) -> Result<Box<dyn Invocation>>;
}

/// Agent backed by a command line; the prompt goes to stdin.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    name: String,
    argv: Vec<String>,
}

impl CommandAgent {
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Result<Self> {
        let name = name.into();
        if argv.is_empty() {
            return Err(anyhow!("agent '{name}' has an empty command"));
        }
        Ok(Self { name, argv })
    }
}

impl AgentService for CommandAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, request: &AgentRequest) -> Result<Box<dyn Invocation>> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("agent '{}' has an empty command", self.name))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workdir)
            .env("RUNTIME_TASK_ID", &request.task_id)
            .env("RUNTIME_STEP", request.step.to_string());
        debug!(agent = %self.name, program = %program, "starting agent");
        let invocation = spawn_supervised(
            cmd,
            Some(request.prompt.clone().into_bytes()),
            request.output_limit_bytes,
        )?;
        Ok(Box::new(invocation))
    }
}

/// Agents in configured order.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Vec<Arc<dyn AgentService>>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.agents.iter().map(|a| a.name()))
            .finish()
    }
}

impl AgentRegistry {
    pub fn from_config(agents: &[AgentConfig]) -> Result<Self> {
        let agents = agents
            .iter()
            .map(|cfg| {
                CommandAgent::new(&cfg.name, cfg.command.clone())
                    .map(|agent| Arc::new(agent) as Arc<dyn AgentService>)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { agents })
    }

    pub fn with_agents(agents: Vec<Arc<dyn AgentService>>) -> Self {
        Self { agents }
    }

    pub fn names(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.name()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentService>> {
        self.agents.iter().find(|a| a.name() == name).cloned()
    }

    /// Agents to try for a step: the hinted agent first when it is known,
    /// then every other configured agent in order.
    pub fn candidates(&self, hint: Option<&str>) -> Vec<Arc<dyn AgentService>> {
        let mut out: Vec<Arc<dyn AgentService>> = Vec::with_capacity(self.agents.len());
        if let Some(agent) = hint.and_then(|name| self.get(name)) {
            out.push(agent);
        }
        for agent in &self.agents {
            if !out.iter().any(|a| a.name() == agent.name()) {
                out.push(Arc::clone(agent));
            }
        }
        out
    }
}
