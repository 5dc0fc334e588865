use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn holo(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("holo").expect("holo binary");
    cmd.env_remove("HOLO_LOG")
        .env("HOLO_STORAGE__PATH", home.join("state.db"))
        .env("HOLO_BACKEND__FETCH_REMOTE_CONFIG", "false")
        .arg("--config")
        .arg(home.join("config.yaml"));
    cmd
}

#[test]
fn prints_version() {
    Command::cargo_bin("holo")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn prints_help() {
    Command::cargo_bin("holo")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("holo"))
        .stdout(predicate::str::contains("tokens"))
        .stdout(predicate::str::contains("--base-url"));
}

#[test]
fn tokens_persist_between_runs() {
    let home = tempdir().unwrap();

    holo(home.path())
        .args(["tokens", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("access=no refresh=no"));

    holo(home.path())
        .args(["tokens", "set", "A1", "R1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Tokens saved."))
        .stdout(predicate::str::contains("loggedIn=true access=yes refresh=yes"));

    holo(home.path())
        .args(["tokens", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("access=yes refresh=yes"))
        .stdout(predicate::str::contains("A1").not());

    holo(home.path())
        .args(["tokens", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Tokens cleared."));

    holo(home.path())
        .args(["tokens", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("loggedIn=false access=no refresh=no"));
}

#[test]
fn config_init_writes_file() {
    let home = tempdir().unwrap();

    holo(home.path())
        .args(["config", "init", "http://holo.test:8110/"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"));

    let written = std::fs::read_to_string(home.path().join("config.yaml")).unwrap();
    assert!(written.contains("http://holo.test:8110/"));

    holo(home.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("http://holo.test:8110/"));
}

#[test]
fn config_init_rejects_bad_url() {
    let home = tempdir().unwrap();

    holo(home.path())
        .args(["config", "init", "not a url"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid backend.base_url"));
}

#[test]
fn videos_without_login_fails() {
    let home = tempdir().unwrap();

    holo(home.path())
        .args(["--base-url", "http://127.0.0.1:9/", "videos"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not logged in"));
}
