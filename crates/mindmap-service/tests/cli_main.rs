//! Basic CLI tests for the mindmapd binary.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_every_subcommand() {
    let mut cmd = Command::cargo_bin("mindmapd").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("chat"))
        .stdout(predicate::str::contains("health"))
        .stdout(predicate::str::contains("diagram"));
}

#[test]
fn version_flag_succeeds() {
    let mut cmd = Command::cargo_bin("mindmapd").unwrap();
    cmd.arg("--version");

    cmd.assert().success();
}

#[test]
fn no_subcommand_shows_usage_error() {
    let mut cmd = Command::cargo_bin("mindmapd").unwrap();

    cmd.assert().failure().code(2);
}

#[test]
fn diagram_subcommand_requires_its_own_subcommand() {
    let mut cmd = Command::cargo_bin("mindmapd").unwrap();
    cmd.arg("diagram");

    cmd.assert().failure().code(2);
}

#[test]
fn diagram_save_without_database_url_fails_cleanly() {
    let mut cmd = Command::cargo_bin("mindmapd").unwrap();
    cmd.env_remove("DATABASE_URL");
    cmd.args(["diagram", "get", "alice", "00000000-0000-0000-0000-000000000000"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("DATABASE_URL"));
}
