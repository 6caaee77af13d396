//! `orchestrator` CLI: manual submission, control and decision surface.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use orchestrator::core::summary::render_completion;
use orchestrator::core::types::{DecisionAction, TaskSource, TaskState, TaskType};
use orchestrator::error::{RuntimeError, runtime_error};
use orchestrator::exit_codes;
use orchestrator::io::config::{DEFAULT_CONFIG_PATH, RuntimeConfig, load_config, write_config};
use orchestrator::io::store::{TaskRecord, TaskStore};
use orchestrator::lifecycle::NewTask;
use orchestrator::logging;
use orchestrator::report::CHANGES_LIMIT;
use orchestrator::runtime::Runtime;

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Durable task runtime for autonomous code-change agents"
)]
struct Cli {
    /// Config file, relative to the current directory.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Actor id recorded on control requests and decisions.
    #[arg(long, global = true, default_value = "cli")]
    actor: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config and create the task database.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Run workers and the janitor until killed.
    Serve,
    /// Create a task.
    Submit {
        /// Goal text.
        #[arg(required = true, num_args = 1..)]
        goal: Vec<String>,
        /// artifact, repo_change or skill_change.
        #[arg(long = "type", default_value = "repo_change")]
        task_type: TaskType,
        /// manual, message, scheduler or router.
        #[arg(long, default_value = "manual")]
        source: TaskSource,
        /// Always start in DRAFT, whatever the risk.
        #[arg(long)]
        draft: bool,
        #[arg(long)]
        max_steps: Option<u32>,
        #[arg(long)]
        max_minutes: Option<u32>,
        /// Preferred agent name.
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        test_command: Option<String>,
        /// Skill name for skill_change tasks.
        #[arg(long)]
        skill: Option<String>,
    },
    /// List tasks, newest first.
    List {
        #[arg(long)]
        state: Option<TaskState>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one task and its live decision token.
    Show { task_id: String },
    /// Recent events and output tails of a task.
    Logs { task_id: String },
    /// Files changed by a task.
    Changes {
        task_id: String,
        #[arg(long, default_value_t = CHANGES_LIMIT)]
        limit: usize,
    },
    /// Ask a task to pause at the next heartbeat.
    Pause { task_id: String },
    /// Return a paused or blocked task to the queue.
    Resume {
        task_id: String,
        /// Extra guidance for the next step.
        #[arg(long)]
        instruction: Option<String>,
    },
    /// Ask a task to stop at the next heartbeat.
    Stop { task_id: String },
    /// Issue a fresh decision token for a task awaiting a decision.
    Issue {
        task_id: String,
        #[arg(long)]
        suggestion: Option<String>,
    },
    /// Consume a decision token.
    Decide {
        token: String,
        /// approve, reject, suggest, merge, discard or request_changes.
        action: DecisionAction,
        #[arg(long)]
        suggestion: Option<String>,
    },
    /// Run a janitor sweep, or reclaim one terminal task's workspace.
    Cleanup { task_id: Option<String> },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        let code = if runtime_error(&err).is_some_and(RuntimeError::is_rejection) {
            exit_codes::REJECTED
        } else {
            exit_codes::ERROR
        };
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(if matches!(cli.command, Command::Serve) {
        "info"
    } else {
        "warn"
    });
    let base = std::env::current_dir().context("resolve current directory")?;
    let actor = cli.actor.as_str();
    match cli.command {
        Command::Init { force } => cmd_init(&base, &cli.config, force),
        Command::Serve => cmd_serve(open(&base, &cli.config)?),
        Command::Submit {
            goal,
            task_type,
            source,
            draft,
            max_steps,
            max_minutes,
            agent,
            test_command,
            skill,
        } => {
            let rt = open(&base, &cli.config)?;
            let created = rt.submit(NewTask {
                goal: goal.join(" "),
                task_type,
                source,
                force_draft: draft,
                max_steps,
                max_minutes,
                agent,
                test_command,
                skill_name: skill,
                created_by: actor.to_string(),
            })?;
            println!("{} {}", created.task.id, created.task.state);
            if !created.task.risk_reasons.is_empty() {
                println!("risk: {}", created.task.risk_reasons.join("; "));
            }
            if let Some(decision) = created.decision {
                println!("token: {}", decision.token);
            }
            Ok(())
        }
        Command::List { state, limit } => {
            let rt = open(&base, &cli.config)?;
            for task in rt.store().list_tasks(state, limit)? {
                println!(
                    "{}  {:<13}  {:<12}  {}",
                    task.id,
                    task.state.as_str(),
                    task.task_type.as_str(),
                    one_line(&task.goal, 60)
                );
            }
            Ok(())
        }
        Command::Show { task_id } => {
            let rt = open(&base, &cli.config)?;
            let task = rt.store().require_task(&task_id)?;
            print_task(&task);
            if let Some(decision) = rt.controller().gate().active_token(&task_id)? {
                let actions: Vec<&str> = decision.actions.iter().map(|a| a.as_str()).collect();
                println!(
                    "token: {} ({}), expires {}",
                    decision.token,
                    actions.join("/"),
                    decision.expires_at
                );
            }
            Ok(())
        }
        Command::Logs { task_id } => {
            let rt = open(&base, &cli.config)?;
            println!("{}", rt.task_logs(&task_id)?);
            Ok(())
        }
        Command::Changes { task_id, limit } => {
            let rt = open(&base, &cli.config)?;
            let changes = rt.task_changes(&task_id, limit)?;
            if changes.is_empty() {
                println!("no detectable changes");
            }
            for line in changes {
                println!("{line}");
            }
            Ok(())
        }
        Command::Pause { task_id } => {
            let rt = open(&base, &cli.config)?;
            print_control(&rt.controller().request_pause(&task_id, actor)?);
            Ok(())
        }
        Command::Resume {
            task_id,
            instruction,
        } => {
            let rt = open(&base, &cli.config)?;
            let task = rt
                .controller()
                .resume(&task_id, instruction.as_deref(), actor)?;
            print_control(&task);
            Ok(())
        }
        Command::Stop { task_id } => {
            let rt = open(&base, &cli.config)?;
            print_control(&rt.controller().request_stop(&task_id, actor)?);
            Ok(())
        }
        Command::Issue {
            task_id,
            suggestion,
        } => {
            let rt = open(&base, &cli.config)?;
            let decision = rt
                .controller()
                .gate()
                .issue(&task_id, suggestion.as_deref(), actor)?;
            println!("{}", decision.token);
            Ok(())
        }
        Command::Decide {
            token,
            action,
            suggestion,
        } => {
            let rt = open(&base, &cli.config)?;
            let outcome = rt.decide(&token, action, suggestion.as_deref(), actor)?;
            println!("{} {}", outcome.task.id, outcome.task.state);
            if let Some(commit) = &outcome.task.merge_commit {
                println!("commit: {commit}");
            }
            if let Some(next) = outcome.reissued {
                println!("token: {}", next.token);
            }
            Ok(())
        }
        Command::Cleanup { task_id } => {
            let rt = open(&base, &cli.config)?;
            match task_id {
                Some(task_id) => {
                    rt.janitor().cleanup_task(&task_id, actor)?;
                    println!("{task_id} workspace cleaned");
                }
                None => {
                    rt.controller().authorize(actor)?;
                    let report = rt.janitor().sweep()?;
                    println!("cleaned {} workspace(s)", report.cleaned.len());
                    for (task_id, err) in report.failed {
                        println!("failed {task_id}: {err}");
                    }
                    if report.events_pruned > 0 {
                        println!("pruned {} event(s)", report.events_pruned);
                    }
                }
            }
            Ok(())
        }
    }
}

fn open(base: &Path, config_path: &Path) -> Result<Runtime> {
    let config = load_config(&base.join(config_path))?;
    Runtime::open(config, base)
}

fn cmd_init(base: &Path, config_path: &Path, force: bool) -> Result<()> {
    let path = base.join(config_path);
    if force || !path.exists() {
        write_config(&path, &RuntimeConfig::default())?;
        println!("wrote {}", path.display());
    }
    let config = load_config(&path)?;
    let paths = config.paths(base);
    fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("create state directory {}", paths.state_dir.display()))?;
    TaskStore::open(&paths.db_path)?;
    println!("database {}", paths.db_path.display());
    Ok(())
}

fn cmd_serve(mut rt: Runtime) -> Result<()> {
    rt.start()?;
    rt.wait();
    rt.stop();
    Ok(())
}

fn print_task(task: &TaskRecord) {
    println!("task {}", task.id);
    println!("goal: {}", task.goal);
    println!("type: {}  source: {}", task.task_type, task.source.as_str());
    println!("state: {}  control: {}", task.state, task.control.as_str());
    println!(
        "risk: {}{}",
        task.risk_level.as_str(),
        if task.risk_reasons.is_empty() {
            String::new()
        } else {
            format!(" ({})", task.risk_reasons.join("; "))
        }
    );
    println!(
        "step: {}/{}  budget: {} min",
        task.step_index, task.max_steps, task.max_minutes
    );
    if let Some(agent) = &task.agent {
        println!("agent: {agent}");
    }
    println!("tests: {}", task.test_command);
    if let Some(path) = task.live_workspace() {
        println!("workspace: {}", path.display());
    }
    if let Some(instruction) = &task.resume_instruction {
        println!("resume instruction: {instruction}");
    }
    if let Some(reason) = &task.blocked_reason {
        println!("blocked: {reason}");
    }
    if let Some(error) = &task.error {
        println!("error: {error}");
    }
    if let Some(commit) = &task.merge_commit {
        println!("commit: {commit}");
    }
    if let Some(completion) = &task.completion {
        println!("{}", render_completion(completion));
    } else if let Some(summary) = &task.summary {
        println!("summary: {summary}");
    }
}

fn print_control(task: &TaskRecord) {
    println!(
        "{} {} (control {})",
        task.id,
        task.state,
        task.control.as_str()
    );
}

fn one_line(text: &str, max_chars: usize) -> String {
    let joined = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.chars().count() <= max_chars {
        return joined;
    }
    let mut cut: String = joined.chars().take(max_chars.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_submit_defaults() {
        let cli = Cli::parse_from(["orchestrator", "submit", "fix", "the", "parser"]);
        assert_eq!(cli.actor, "cli");
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        let Command::Submit {
            goal,
            task_type,
            source,
            draft,
            ..
        } = cli.command
        else {
            panic!("expected submit");
        };
        assert_eq!(goal.join(" "), "fix the parser");
        assert_eq!(task_type, TaskType::RepoChange);
        assert_eq!(source, TaskSource::Manual);
        assert!(!draft);
    }

    #[test]
    fn parse_submit_options() {
        let cli = Cli::parse_from([
            "orchestrator",
            "--actor",
            "alice",
            "submit",
            "--type",
            "artifact",
            "--draft",
            "--max-steps",
            "3",
            "write a report",
        ]);
        assert_eq!(cli.actor, "alice");
        assert!(matches!(
            cli.command,
            Command::Submit {
                task_type: TaskType::Artifact,
                draft: true,
                max_steps: Some(3),
                ..
            }
        ));
    }

    #[test]
    fn parse_decide_action() {
        let cli = Cli::parse_from([
            "orchestrator",
            "decide",
            "tok123",
            "request_changes",
            "--suggestion",
            "add tests",
        ]);
        assert!(matches!(
            cli.command,
            Command::Decide {
                action: DecisionAction::RequestChanges,
                ..
            }
        ));
    }

    #[test]
    fn parse_rejects_unknown_action() {
        assert!(Cli::try_parse_from(["orchestrator", "decide", "tok", "ship"]).is_err());
    }

    #[test]
    fn parse_list_state_is_case_insensitive() {
        let cli = Cli::parse_from(["orchestrator", "list", "--state", "waiting_merge"]);
        assert!(matches!(
            cli.command,
            Command::List {
                state: Some(TaskState::WaitingMerge),
                limit: 20
            }
        ));
    }

    #[test]
    fn parse_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["orchestrator", "cleanup", "--config", "alt.toml"]);
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
        assert!(matches!(cli.command, Command::Cleanup { task_id: None }));
    }

    #[test]
    fn one_line_truncates() {
        assert_eq!(one_line("a  b\nc", 10), "a b c");
        assert_eq!(one_line(&"x".repeat(20), 10), "xxxxxxx...");
    }
}
