mod common;

use common::*;
use std::process::Command;

fn cli_command() -> Command {
    Command::new(env!("CARGO_BIN_EXE_run-engine"))
}

const INSTANT_CONFIG: &str = r#"
failure_mode:
  mode: disabled
time_scale: 0
startup_delay_ms: 0
"#;

#[test]
fn test_cli_help() {
    let output = cli_command().arg("--help").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Submit automation tasks"));
    assert!(stdout.contains("submit"));
    assert!(stdout.contains("plan"));
    assert!(stdout.contains("templates"));
    assert!(stdout.contains("health"));
}

#[test]
fn test_cli_version() {
    let output = cli_command().arg("--version").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("run-engine"));
}

#[test]
fn test_cli_submit_help() {
    let output = cli_command().args(["submit", "--help"]).output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--template"));
    assert!(stdout.contains("--input"));
    assert!(stdout.contains("--custom"));
    assert!(stdout.contains("--delegate"));
    assert!(stdout.contains("--json"));
}

#[test]
fn test_cli_templates() {
    let output = cli_command().arg("templates").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("stock-transfer - Stock Transfer"));
    assert!(stdout.contains("lead-time-update"));
    assert!(stdout.contains("--input from_plant=<one of 1710/1020/1030>"));
}

#[test]
fn test_cli_plan() {
    let output = cli_command()
        .args([
            "plan",
            "-T",
            "stock-transfer",
            "-i",
            "material=FG100",
            "-i",
            "qty=100",
            "-i",
            "from_plant=1710",
            "-i",
            "to_plant=1010",
        ])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Plan (10 steps)"));
    assert!(stdout.contains("Entering material code: FG100"));
    assert!(stdout.contains("may fail: Validation failed: Insufficient stock"));
}

#[test]
fn test_cli_plan_requires_a_task() {
    let output = cli_command().arg("plan").output().unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_cli_rejects_malformed_input() {
    let output = cli_command()
        .args(["plan", "-T", "stock-check", "-i", "material"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("KEY=VALUE"));
}

#[test]
fn test_cli_submit_runs_to_completion() {
    let dir = create_test_dir();
    let config = write_config(dir.path(), INSTANT_CONFIG);

    let output = cli_command()
        .arg("submit")
        .arg("--config")
        .arg(&config)
        .args(["--custom", "Check open orders"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Submitted run run_"));
    assert!(stdout.contains("Status: completed"));
    assert!(stdout.contains("Progress: 100%"));
    assert!(stdout.contains("Processing custom automation request"));
}

#[test]
fn test_cli_submit_json_events() {
    let dir = create_test_dir();
    let config = write_config(dir.path(), INSTANT_CONFIG);

    let output = cli_command()
        .arg("submit")
        .arg("--config")
        .arg(&config)
        .args(["-T", "stock-check", "-i", "material=FG150", "--json"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let events: Vec<serde_json::Value> = stdout
        .lines()
        .filter(|l| l.starts_with('{'))
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(events.first().unwrap()["type"], "task_queued");
    assert_eq!(events.last().unwrap()["type"], "task_completed");
}

#[test]
fn test_cli_delegate_requires_config() {
    let output = cli_command()
        .args(["submit", "--custom", "Check open orders", "--delegate"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));

    let output = cli_command().arg("health").output().unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_cli_invalid_config_file() {
    let dir = create_test_dir();
    let config = write_config(dir.path(), "time_scale: -2");

    let output = cli_command()
        .arg("templates")
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}
