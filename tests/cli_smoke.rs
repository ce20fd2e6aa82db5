//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use tether::keys;

/// Builds a command isolated from the developer's configuration.
fn isolated(tmp: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("tether");
    cmd.current_dir(tmp.path())
        .env("HOME", tmp.path())
        .env("XDG_CONFIG_HOME", tmp.path().join("xdg"))
        .env("TETHER_STATE_DIR", tmp.path().join("state"))
        .env_remove("TETHER_CONFIG_PATH")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("tether");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn keygen_prints_a_matching_pair() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let output = isolated(&tmp)
        .arg("keygen")
        .output()
        .unwrap_or_else(|err| panic!("run tether keygen: {err}"));
    assert!(output.status.success(), "keygen should succeed");

    let stdout = String::from_utf8(output.stdout).unwrap_or_else(|err| panic!("utf8: {err}"));
    let mut lines = stdout.lines();
    let private = lines
        .next()
        .and_then(|line| line.strip_prefix("private_key: "))
        .unwrap_or_else(|| panic!("missing private key line: {stdout}"));
    let public = lines
        .next()
        .and_then(|line| line.strip_prefix("public_key: "))
        .unwrap_or_else(|| panic!("missing public key line: {stdout}"));

    assert_eq!(private.len(), 44);
    assert_eq!(public.len(), 44);
    let derived = keys::derive_public(private).unwrap_or_else(|err| panic!("derive: {err}"));
    assert_eq!(derived, public);
}

#[test]
fn session_show_reports_absent_session() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    isolated(&tmp)
        .args(["session", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no active session"));
}

#[test]
fn session_clear_is_idempotent() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    for _ in 0..2 {
        isolated(&tmp)
            .args(["session", "clear"])
            .assert()
            .success()
            .stdout(predicate::str::contains("session cleared"));
    }
}

#[test]
fn invalid_configuration_names_the_variable() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    isolated(&tmp)
        .env("TETHER_PROBE_PORTS", "ssh")
        .args(["session", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("TETHER_PROBE_PORTS"));
}
