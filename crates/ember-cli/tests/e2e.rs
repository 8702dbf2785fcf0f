//! End-to-end tests for the `ember` binary.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Temporary project with a config file pointing at a worker script.
struct TestProject {
    temp_dir: TempDir,
    config_path: PathBuf,
}

impl TestProject {
    #[cfg(unix)]
    fn new(script: &str) -> Self {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let script_path = temp_dir.path().join("worker.sh");
        fs::write(&script_path, script).expect("Failed to write worker script");
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755)).unwrap();

        let config = serde_json::json!({
            "process": {
                "project_path": temp_dir.path(),
                "executable_path": script_path,
            },
            "invocation": {
                "connection_timeout_ms": 500,
                "num_connection_retries": 0,
            },
        });
        let config_path = temp_dir.path().join("ember.json");
        fs::write(&config_path, config.to_string()).expect("Failed to write config");

        Self {
            temp_dir,
            config_path,
        }
    }
}

fn ember() -> Command {
    Command::cargo_bin("ember").expect("Failed to find ember binary")
}

#[test]
fn test_help_lists_commands() {
    ember()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("invoke"))
        .stdout(predicate::str::contains("check"));
}

#[test]
fn test_invoke_rejects_invalid_args() {
    ember()
        .args(["invoke", "index.js", "--args", "{not json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--args must be valid JSON"));
}

#[test]
fn test_missing_config_file() {
    ember()
        .args(["check", "--config", "/nonexistent/ember.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("configuration error"));
}

#[cfg(unix)]
#[test]
fn test_check_reports_worker() {
    let project = TestProject::new(concat!(
        "#!/bin/sh\n",
        "printf '[Ember: Listening on IP - 127.0.0.1 Port - 45123]\\0\\n'\n",
        "exec sleep 60\n",
    ));

    ember()
        .arg("check")
        .arg("--config")
        .arg(&project.config_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("endpoint: http://127.0.0.1:45123"))
        .stdout(predicate::str::contains("pid:"));
    assert!(project.temp_dir.path().exists());
}

#[cfg(unix)]
#[test]
fn test_check_fails_without_handshake() {
    let project = TestProject::new("#!/bin/sh\nexit 2\n");

    ember()
        .arg("check")
        .arg("--config")
        .arg(&project.config_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("exited with code 2"));
}
