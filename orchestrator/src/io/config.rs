//! Runtime configuration stored in `.runtime/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::path_policy::{PathPolicy, PolicyMode};
use crate::core::risk::RiskProfile;

pub const DEFAULT_CONFIG_PATH: &str = ".runtime/config.toml";
pub const DATABASE_FILE: &str = "runtime.db";

/// Runtime configuration (TOML).
///
/// Meant to be edited by humans. Missing fields fall back to defaults, and
/// relative paths are resolved against `repo_root`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Repository that tasks change and merges land in.
    pub repo_root: PathBuf,
    /// Holds `runtime.db`.
    pub state_dir: PathBuf,
    /// Parent of per-task worktrees and patch files.
    pub worktree_root: PathBuf,

    pub worker_concurrency: usize,
    pub poll_interval_ms: u64,

    /// Agent used when a task has no hint; empty means the first `[[agents]]` entry.
    pub default_agent: String,
    pub default_test_command: String,
    pub default_max_steps: u32,
    pub default_max_minutes: u32,
    /// Consecutive invocation errors tolerated before a task fails.
    pub max_execution_failures: u32,
    /// Bound on captured stdout/stderr per invocation.
    pub output_limit_bytes: usize,
    /// Byte budget for rendered step prompts.
    pub prompt_budget_bytes: usize,

    pub risk_profile: RiskProfile,
    /// Actors allowed to control and decide; empty allows everyone.
    pub owners: Vec<String>,
    pub decision_ttl_minutes: u64,

    pub path_policy: PathPolicyConfig,
    pub heartbeat: HeartbeatConfig,
    pub janitor: JanitorConfig,
    pub merge: MergeConfig,
    pub logs: LogsConfig,
    pub skills: SkillsConfig,
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathPolicyConfig {
    pub mode: PolicyMode,
    pub allowed: Vec<String>,
    pub denied: Vec<String>,
}

impl Default for PathPolicyConfig {
    fn default() -> Self {
        Self {
            mode: PolicyMode::AllowAllWithDenylist,
            allowed: Vec::new(),
            denied: [
                ".env",
                ".env.*",
                "config.yaml",
                ".runtime/**",
                ".git/**",
                "**/*.pem",
                "**/id_rsa*",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub agent_interval_ms: u64,
    pub test_interval_ms: u64,
    pub test_timeout_secs: u64,
    /// Minimum spacing of persisted progress events.
    pub progress_persist_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            agent_interval_ms: 20_000,
            test_interval_ms: 15_000,
            test_timeout_secs: 600,
            progress_persist_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JanitorConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub retention_hours: u64,
    /// Reclaim a merged task's workspace right after the merge.
    pub merged_immediate: bool,
    pub prune_worktrees: bool,
    /// Delete events of terminal tasks older than this; 0 keeps them forever.
    pub event_retention_days: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 60,
            retention_hours: 72,
            merged_immediate: true,
            prune_worktrees: true,
            event_retention_days: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MergeConfig {
    pub require_clean_repo: bool,
    /// Run `git apply --check` before applying.
    pub preflight_check: bool,
    pub auto_commit: bool,
    /// minijinja template with `task_id`, `goal_short`, `task_type`.
    pub commit_message_template: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            require_clean_repo: true,
            preflight_check: true,
            auto_commit: true,
            commit_message_template: "runtime(task:{{ task_id }}): {{ goal_short }}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogsConfig {
    pub event_limit: usize,
    pub tail_chars: usize,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            event_limit: 12,
            tail_chars: 1200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SkillsConfig {
    /// Skills directory, relative to the workspace root.
    pub dir: PathBuf,
    pub default_max_steps: u32,
    pub default_max_minutes: u32,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("skills"),
            default_max_steps: 6,
            default_max_minutes: 15,
        }
    }
}

/// An agent command; the step prompt is written to its stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfig {
    pub name: String,
    pub command: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            state_dir: PathBuf::from(".runtime"),
            worktree_root: PathBuf::from(".runtime/worktrees"),
            worker_concurrency: 3,
            poll_interval_ms: 800,
            default_agent: String::new(),
            default_test_command: "cargo test --quiet".to_string(),
            default_max_steps: 8,
            default_max_minutes: 20,
            max_execution_failures: 2,
            output_limit_bytes: 200_000,
            prompt_budget_bytes: 16_000,
            risk_profile: RiskProfile::Strict,
            owners: Vec::new(),
            decision_ttl_minutes: 24 * 60,
            path_policy: PathPolicyConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            janitor: JanitorConfig::default(),
            merge: MergeConfig::default(),
            logs: LogsConfig::default(),
            skills: SkillsConfig::default(),
            agents: vec![AgentConfig {
                name: "codex".to_string(),
                command: ["codex", "exec", "--skip-git-repo-check", "-"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            }],
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_concurrency == 0 {
            return Err(anyhow!("worker_concurrency must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.default_max_steps == 0 || self.skills.default_max_steps == 0 {
            return Err(anyhow!("default max steps must be > 0"));
        }
        if self.default_max_minutes == 0 || self.skills.default_max_minutes == 0 {
            return Err(anyhow!("default max minutes must be > 0"));
        }
        if self.max_execution_failures == 0 {
            return Err(anyhow!("max_execution_failures must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.decision_ttl_minutes == 0 {
            return Err(anyhow!("decision_ttl_minutes must be > 0"));
        }
        if self.heartbeat.agent_interval_ms == 0 || self.heartbeat.test_interval_ms == 0 {
            return Err(anyhow!("heartbeat intervals must be > 0"));
        }
        if self.heartbeat.test_timeout_secs == 0 {
            return Err(anyhow!("heartbeat.test_timeout_secs must be > 0"));
        }
        if self.janitor.interval_minutes == 0 {
            return Err(anyhow!("janitor.interval_minutes must be > 0"));
        }
        if self.merge.commit_message_template.trim().is_empty() {
            return Err(anyhow!("merge.commit_message_template must not be empty"));
        }
        if self.agents.is_empty() {
            return Err(anyhow!("at least one [[agents]] entry is required"));
        }
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(anyhow!("agent name must not be empty"));
            }
            if agent.command.is_empty() || agent.command[0].trim().is_empty() {
                return Err(anyhow!("agent '{}' needs a non-empty command", agent.name));
            }
        }
        if !self.default_agent.is_empty()
            && !self.agents.iter().any(|a| a.name == self.default_agent)
        {
            return Err(anyhow!(
                "default_agent '{}' is not a configured agent",
                self.default_agent
            ));
        }
        self.path_policy().context("path_policy")?;
        Ok(())
    }

    pub fn path_policy(&self) -> Result<PathPolicy> {
        PathPolicy::new(
            self.path_policy.mode,
            &self.path_policy.allowed,
            &self.path_policy.denied,
        )
    }

    /// Agent name used when a task carries no hint.
    pub fn default_agent_name(&self) -> Option<&str> {
        if !self.default_agent.is_empty() {
            return Some(&self.default_agent);
        }
        self.agents.first().map(|a| a.name.as_str())
    }

    pub fn is_owner(&self, actor: &str) -> bool {
        self.owners.is_empty() || self.owners.iter().any(|owner| owner == actor)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Absolute locations derived from the configured paths.
    pub fn paths(&self, base: &Path) -> RuntimePaths {
        let repo_root = join_if_relative(base, &self.repo_root);
        let state_dir = join_if_relative(&repo_root, &self.state_dir);
        let worktree_root = join_if_relative(&repo_root, &self.worktree_root);
        RuntimePaths {
            db_path: state_dir.join(DATABASE_FILE),
            repo_root,
            state_dir,
            worktree_root,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub repo_root: PathBuf,
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    pub worktree_root: PathBuf,
}

impl RuntimePaths {
    /// Repo-relative prefixes owned by the runtime, ignored by clean-tree checks.
    pub fn runtime_prefixes(&self) -> Vec<String> {
        [&self.state_dir, &self.worktree_root]
            .into_iter()
            .filter_map(|dir| dir.strip_prefix(&self.repo_root).ok())
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            .filter(|rel| !rel.is_empty())
            .map(|rel| format!("{}/", rel.trim_end_matches('/')))
            .collect()
    }
}

fn join_if_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RuntimeConfig::default()`.
pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    if !path.exists() {
        let cfg = RuntimeConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RuntimeConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RuntimeConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = RuntimeConfig::default();
        cfg.owners = vec!["alice".to_string()];
        cfg.risk_profile = RiskProfile::Manual;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "worker_concurrency = 1\n[heartbeat]\ntest_timeout_secs = 5\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.worker_concurrency, 1);
        assert_eq!(cfg.heartbeat.test_timeout_secs, 5);
        assert_eq!(cfg.heartbeat.agent_interval_ms, 20_000);
        assert_eq!(cfg.logs.event_limit, 12);
    }

    #[test]
    fn unknown_default_agent_is_rejected() {
        let cfg = RuntimeConfig {
            default_agent: "ghost".to_string(),
            ..RuntimeConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn paths_resolve_relative_to_repo_root() {
        let cfg = RuntimeConfig {
            repo_root: PathBuf::from("repo"),
            ..RuntimeConfig::default()
        };
        let paths = cfg.paths(Path::new("/work"));
        assert_eq!(paths.repo_root, PathBuf::from("/work/repo"));
        assert_eq!(paths.db_path, PathBuf::from("/work/repo/.runtime/runtime.db"));
        assert_eq!(paths.worktree_root, PathBuf::from("/work/repo/.runtime/worktrees"));
        assert_eq!(
            paths.runtime_prefixes(),
            vec![".runtime/".to_string(), ".runtime/worktrees/".to_string()]
        );
    }

    #[test]
    fn owners_gate_actors() {
        let mut cfg = RuntimeConfig::default();
        assert!(cfg.is_owner("anyone"));
        cfg.owners = vec!["alice".to_string()];
        assert!(cfg.is_owner("alice"));
        assert!(!cfg.is_owner("bob"));
    }
}
