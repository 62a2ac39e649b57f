//! Smoke tests for the scuttle binary
//!
//! Each case runs with HOME pointed at an empty directory so no user
//! `~/.scuttle.toml` leaks in.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

fn scuttle(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("scuttle").unwrap();
    cmd.env("HOME", home.path())
        .env_remove("RUST_LOG")
        .env_remove("SCUTTLE_LOG")
        .env_remove("SCUTTLE_LOG_FORMAT")
        .env_remove("SCUTTLE_RYUK_DISABLED")
        .env_remove("SCUTTLE_DOCKER_PATH");
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    let home = TempDir::new().unwrap();
    scuttle(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("session"))
        .stdout(predicate::str::contains("ps"))
        .stdout(predicate::str::contains("reap"))
        .stdout(predicate::str::contains("logs"));
}

#[test]
fn test_version() {
    let home = TempDir::new().unwrap();
    scuttle(&home)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_session_prints_hex_id() {
    let home = TempDir::new().unwrap();
    let output = scuttle(&home).arg("session").output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let id = stdout.trim();
    assert_eq!(id.len(), 64);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn test_config_prints_defaults() {
    let home = TempDir::new().unwrap();
    scuttle(&home)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"ryuk_disabled\": false"))
        .stdout(predicate::str::contains("\"docker_path\": \"docker\""));
}

#[test]
fn test_config_environment_override() {
    let home = TempDir::new().unwrap();
    scuttle(&home)
        .arg("config")
        .env("SCUTTLE_RYUK_DISABLED", "true")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"ryuk_disabled\": true"));
}

#[test]
fn test_config_file_in_home() {
    let home = TempDir::new().unwrap();
    std::fs::write(
        home.path().join(".scuttle.toml"),
        "reaper_image = \"mirror.local/ryuk:1\"\n",
    )
    .unwrap();
    scuttle(&home)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("mirror.local/ryuk:1"));
}

#[test]
fn test_invalid_boolean_fails() {
    let home = TempDir::new().unwrap();
    scuttle(&home)
        .arg("config")
        .env("SCUTTLE_RYUK_DISABLED", "maybe")
        .assert()
        .failure()
        .stderr(predicate::str::contains("SCUTTLE_RYUK_DISABLED"));
}

#[test]
fn test_ps_without_runtime_fails() {
    let home = TempDir::new().unwrap();
    scuttle(&home)
        .arg("ps")
        .env("SCUTTLE_DOCKER_PATH", "/nonexistent/docker")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not installed"));
}

#[test]
fn test_ps_session_conflicts_with_all_sessions() {
    let home = TempDir::new().unwrap();
    scuttle(&home)
        .args(["ps", "--all-sessions", "--session", "abc"])
        .assert()
        .failure();
}

#[test]
fn test_json_logs_go_to_stderr() {
    let home = TempDir::new().unwrap();
    let output = scuttle(&home)
        .args(["config", "--log-format", "json", "--log-level", "debug"])
        .output()
        .unwrap();
    assert!(output.status.success());

    // stdout stays a single JSON document
    let stdout: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(stdout["docker_path"], "docker");

    let stderr = String::from_utf8_lossy(&output.stderr);
    let entries: Vec<Value> = stderr
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    assert!(!entries.is_empty(), "no JSON log lines in: {}", stderr);
    assert!(entries.iter().any(|entry| {
        entry["fields"]["message"]
            .as_str()
            .is_some_and(|m| m.contains("Loaded configuration"))
    }));
}
