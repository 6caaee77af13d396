//! CLI tests: spawn the binary inside a scratch repository and check exit
//! codes for success, rejected requests and the happy-path output.

use std::path::Path;
use std::process::{Command, Output};

use orchestrator::exit_codes;
use orchestrator::test_support::TestRepo;

fn cli(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_orchestrator"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("run orchestrator")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[test]
fn init_writes_config_and_database() {
    let repo = TestRepo::new();
    let out = cli(repo.path(), &["init"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(repo.path().join(".runtime/config.toml").exists());
    assert!(repo.path().join(".runtime/runtime.db").exists());

    // A second init keeps the existing config.
    let again = cli(repo.path(), &["init"]);
    assert_eq!(again.status.code(), Some(exit_codes::OK));
    assert!(!stdout(&again).contains("wrote"));
}

#[test]
fn submit_list_and_show_round_trip() {
    let repo = TestRepo::new();
    assert_eq!(cli(repo.path(), &["init"]).status.code(), Some(exit_codes::OK));

    let out = cli(repo.path(), &["submit", "--type", "artifact", "write", "release", "notes"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let text = stdout(&out);
    let mut first = text.lines().next().expect("id line").split_whitespace();
    let id = first.next().expect("task id").to_string();
    assert_eq!(first.next(), Some("PENDING"));

    let list = cli(repo.path(), &["list", "--state", "pending"]);
    assert_eq!(list.status.code(), Some(exit_codes::OK));
    assert!(stdout(&list).contains(&id));

    let show = cli(repo.path(), &["show", &id]);
    assert_eq!(show.status.code(), Some(exit_codes::OK));
    assert!(stdout(&show).contains("goal: write release notes"));
}

#[test]
fn draft_submission_prints_a_token() {
    let repo = TestRepo::new();
    cli(repo.path(), &["init"]);

    let out = cli(repo.path(), &["submit", "--draft", "tidy", "the", "docs"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let text = stdout(&out);
    assert!(text.contains("DRAFT"));
    let token = text
        .lines()
        .find_map(|line| line.strip_prefix("token: "))
        .expect("token line")
        .to_string();

    let reject = cli(repo.path(), &["decide", &token, "reject"]);
    assert_eq!(reject.status.code(), Some(exit_codes::OK));
    assert!(stdout(&reject).contains("REJECTED"));

    // The token is single-use.
    let replay = cli(repo.path(), &["decide", &token, "approve"]);
    assert_eq!(replay.status.code(), Some(exit_codes::REJECTED));
}

#[test]
fn unknown_task_is_a_rejection() {
    let repo = TestRepo::new();
    cli(repo.path(), &["init"]);
    for args in [
        &["show", "nope"][..],
        &["logs", "nope"][..],
        &["pause", "nope"][..],
        &["cleanup", "nope"][..],
    ] {
        let out = cli(repo.path(), args);
        assert_eq!(out.status.code(), Some(exit_codes::REJECTED), "{args:?}");
    }
}

#[test]
fn bad_token_is_a_rejection() {
    let repo = TestRepo::new();
    cli(repo.path(), &["init"]);
    let out = cli(repo.path(), &["decide", "not-a-token", "approve"]);
    assert_eq!(out.status.code(), Some(exit_codes::REJECTED));
    assert!(String::from_utf8_lossy(&out.stderr).contains("unknown decision token"));
}

#[test]
fn unreadable_config_is_an_error() {
    let repo = TestRepo::new();
    repo.write(".runtime/config.toml", "worker_concurrency = \"many\"\n");
    let out = cli(repo.path(), &["list"]);
    assert_eq!(out.status.code(), Some(exit_codes::ERROR));
}
