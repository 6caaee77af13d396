//! Side-effecting adapters: configuration, persistence, git, processes.

pub mod agent;
pub mod config;
pub mod git;
pub mod process;
pub mod prompt;
pub mod skill;
pub mod store;
pub mod test_runner;
pub mod workspace;
