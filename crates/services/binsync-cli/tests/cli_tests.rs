use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

#[test]
#[allow(clippy::unwrap_used, clippy::expect_used)]
fn test_init_then_status() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let repo_root = temp_dir.path().join("repo");

    let mut init = Command::cargo_bin("binsync").expect("binary not found");
    init.arg("init")
        .arg("--repo-root")
        .arg(&repo_root)
        .arg("--user")
        .arg("alice")
        .arg("--binary-hash")
        .arg("deadbeef")
        .assert()
        .success()
        .stdout(contains("master user: alice"));

    let mut status = Command::cargo_bin("binsync").expect("binary not found");
    status
        .arg("status")
        .arg("--repo-root")
        .arg(&repo_root)
        .arg("--user")
        .arg("alice")
        .arg("--binary-hash")
        .arg("deadbeef")
        .assert()
        .success()
        .stdout(contains("connection warnings: []"));
}

#[test]
#[allow(clippy::unwrap_used, clippy::expect_used)]
fn test_init_twice_fails() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let repo_root = temp_dir.path().join("repo");

    let mut first = Command::cargo_bin("binsync").expect("binary not found");
    first
        .arg("init")
        .arg("--repo-root")
        .arg(&repo_root)
        .arg("--user")
        .arg("alice")
        .arg("--binary-hash")
        .arg("deadbeef")
        .assert()
        .success();

    let mut second = Command::cargo_bin("binsync").expect("binary not found");
    second
        .arg("init")
        .arg("--repo-root")
        .arg(&repo_root)
        .arg("--user")
        .arg("alice")
        .arg("--binary-hash")
        .arg("deadbeef")
        .assert()
        .failure();
}

#[test]
#[allow(clippy::unwrap_used, clippy::expect_used)]
fn test_commit_then_users_shows_committer() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let repo_root = temp_dir.path().join("repo");
    let payload_path = temp_dir.path().join("payload.toml");
    std::fs::write(&payload_path, "note = \"hello from the cli test\"\n").expect("write payload");

    let mut init = Command::cargo_bin("binsync").expect("binary not found");
    init.arg("init")
        .arg("--repo-root")
        .arg(&repo_root)
        .arg("--user")
        .arg("alice")
        .arg("--binary-hash")
        .arg("deadbeef")
        .assert()
        .success();

    let mut commit = Command::cargo_bin("binsync").expect("binary not found");
    commit
        .arg("commit")
        .arg("--repo-root")
        .arg(&repo_root)
        .arg("--user")
        .arg("alice")
        .arg("--binary-hash")
        .arg("deadbeef")
        .arg("--payload-file")
        .arg(&payload_path)
        .assert()
        .success();

    let mut users = Command::cargo_bin("binsync").expect("binary not found");
    users
        .arg("users")
        .arg("--repo-root")
        .arg(&repo_root)
        .arg("--user")
        .arg("alice")
        .arg("--binary-hash")
        .arg("deadbeef")
        .assert()
        .success()
        .stdout(contains("alice"));
}
