//! Durable task runtime for autonomous code-change agents.
//!
//! A task carries a goal through a loop of agent step, path check, test run
//! and checkpoint inside its own git worktree. Every state change is a single
//! SQLite transaction, and human decisions flow through single-use tokens.
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (transition table, risk gating,
//!   path policy, agent signals, step decisions, budgets, summaries).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (config, SQLite store, git,
//!   supervised processes, agents, tests, workspaces, skill validation).
//!   Isolated behind traits to enable scripted fakes in tests.
//!
//! Orchestration modules ([`lifecycle`], [`step`], [`scheduler`], [`decision`],
//! [`merge`], [`janitor`], [`runtime`]) coordinate core logic with I/O to
//! implement the service and the CLI.

pub mod core;
pub mod decision;
pub mod error;
pub mod exit_codes;
pub mod heartbeat;
pub mod io;
pub mod janitor;
pub mod lifecycle;
pub mod logging;
pub mod merge;
pub mod report;
pub mod runtime;
pub mod scheduler;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
