use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// A `macroflow` command isolated from the user's config file.
fn macroflow(config_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("macroflow").unwrap();
    cmd.env("MACROFLOW_CONFIG", config_dir.join("config.json"))
        .env_remove("MACROFLOW_LOOPS")
        .env_remove("MACROFLOW_LOG_FILE");
    cmd
}

#[test]
fn test_help_exits_zero() {
    Command::cargo_bin("macroflow")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("macroflow"));
}

#[test]
fn test_run_prints_extract() {
    let dir = tempfile::tempdir().unwrap();
    macroflow(dir.path())
        .args(["run", fixture_path("hello.iim").to_str().unwrap()])
        .assert()
        .success()
        .stdout("hello world\n")
        .stderr(predicate::str::contains("completed: 1 loop(s)"));
}

#[test]
fn test_run_reads_stdin() {
    let dir = tempfile::tempdir().unwrap();
    macroflow(dir.path())
        .args(["run", "-"])
        .write_stdin("SET !EXTRACT piped\n")
        .assert()
        .success()
        .stdout("piped\n");
}

#[test]
fn test_loops_and_seeded_variables() {
    let dir = tempfile::tempdir().unwrap();
    macroflow(dir.path())
        .args(["run", "-", "--loops", "2", "--var", "!VAR1=x", "--var", "label=y"])
        .write_stdin("SET !EXTRACT {{!VAR1}}{{label}}{{!LOOP}}\n")
        .assert()
        .success()
        .stdout("xy1\nxy2\n");
}

#[test]
fn test_datasource_loop_over_fixture() {
    let dir = tempfile::tempdir().unwrap();
    macroflow(dir.path())
        .args(["run", fixture_path("people.iim").to_str().unwrap(), "--loops", "2"])
        .assert()
        .success()
        .stdout("Lovelace, Ada:1815\nGrace Hopper:1906\n");
}

#[test]
fn test_datasource_flag_feeds_columns() {
    let dir = tempfile::tempdir().unwrap();
    macroflow(dir.path())
        .args([
            "run",
            "-",
            "--datasource",
            fixture_path("people.csv").to_str().unwrap(),
        ])
        .write_stdin("SET !EXTRACT {{!COL2}}\n")
        .assert()
        .success()
        .stdout("1815\n");
}

#[test]
fn test_syntax_error_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    macroflow(dir.path())
        .args(["run", fixture_path("broken.iim").to_str().unwrap()])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Line 2"))
        .stderr(predicate::str::contains("SYNTAX_ERROR"));
}

#[test]
fn test_check_lists_every_error() {
    let dir = tempfile::tempdir().unwrap();
    macroflow(dir.path())
        .args(["check", fixture_path("broken.iim").to_str().unwrap()])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("Line 2: Unknown command: BADCOMMAND"))
        .stdout(predicate::str::contains("Line 4: Unknown command: ALSOBAD"));
}

#[test]
fn test_check_valid_macro() {
    let dir = tempfile::tempdir().unwrap();
    macroflow(dir.path())
        .args(["check", fixture_path("hello.iim").to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("OK: 4 lines, 3 commands"));
}

#[test]
fn test_check_json_output() {
    let dir = tempfile::tempdir().unwrap();
    let assert = macroflow(dir.path())
        .args(["--format", "json", "check", fixture_path("broken.iim").to_str().unwrap()])
        .assert()
        .code(2);

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(parsed["valid"], false);
    assert_eq!(parsed["errors"].as_array().unwrap().len(), 2);
    assert_eq!(parsed["errors"][0]["line_number"], 2);
}

#[test]
fn test_browser_commands_need_a_browser() {
    let dir = tempfile::tempdir().unwrap();
    macroflow(dir.path())
        .args(["run", fixture_path("browse.iim").to_str().unwrap()])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no browser attached"));
}

#[test]
fn test_dry_run_json_result() {
    let dir = tempfile::tempdir().unwrap();
    let assert = macroflow(dir.path())
        .args([
            "run",
            fixture_path("browse.iim").to_str().unwrap(),
            "--dry-run",
            "--format",
            "json",
        ])
        .assert()
        .success();

    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(parsed["success"], true);
    assert_eq!(parsed["status"], "completed");
    assert_eq!(parsed["error_code"], "OK");
    assert_eq!(parsed["variables"]["!URLCURRENT"], "https://example.com");
}

#[test]
fn test_error_ignore_flag() {
    let dir = tempfile::tempdir().unwrap();
    macroflow(dir.path())
        .args(["run", fixture_path("browse.iim").to_str().unwrap(), "--error-ignore"])
        .assert()
        .success()
        .stderr(predicate::str::contains("ignored: line 1"))
        .stderr(predicate::str::contains("ignored: line 2"));
}

#[test]
fn test_events_are_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let assert = macroflow(dir.path())
        .args(["run", "-", "--events"])
        .write_stdin("SET !VAR1 a\n")
        .assert()
        .success();

    let stderr = String::from_utf8(assert.get_output().stderr.clone()).unwrap();
    let events: Vec<serde_json::Value> = stderr
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    let names: Vec<&str> = events.iter().filter_map(|e| e["event"].as_str()).collect();
    assert_eq!(names, vec!["started", "line_started", "line_finished", "finished"]);
}

#[test]
fn test_config_file_sets_loops() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.json"), r#"{"max_loops": 3}"#).unwrap();
    macroflow(dir.path())
        .args(["run", "-"])
        .write_stdin("SET !EXTRACT {{!LOOP}}\n")
        .assert()
        .success()
        .stdout("1\n2\n3\n");
}

#[test]
fn test_pause_then_resume_from_saved_state() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("pause.iim");
    let state = dir.path().join("state.json");
    std::fs::write(&script, "SET !VAR1 a\nPAUSE\nSET !EXTRACT {{!VAR1}}b\n").unwrap();

    macroflow(dir.path())
        .args(["run", script.to_str().unwrap(), "--save-state", state.to_str().unwrap()])
        .assert()
        .code(5)
        .stdout("");

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&state).unwrap()).unwrap();
    assert_eq!(saved["status"], "paused");
    assert_eq!(saved["currentLine"], 3);

    macroflow(dir.path())
        .args(["run", script.to_str().unwrap(), "--resume", state.to_str().unwrap()])
        .assert()
        .success()
        .stdout("ab\n");
}

#[test]
fn test_resume_retries_failed_line() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("late.iim");
    let state = dir.path().join("state.json");
    std::fs::write(
        &script,
        "SET !VAR1 a\nSET !DATASOURCE late.csv\nSET !EXTRACT {{!VAR1}}-{{!COL1}}\n",
    )
    .unwrap();

    macroflow(dir.path())
        .args(["run", script.to_str().unwrap(), "--save-state", state.to_str().unwrap()])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("DATASOURCE_ERROR"));

    std::fs::write(dir.path().join("late.csv"), "x\n").unwrap();
    macroflow(dir.path())
        .args(["run", script.to_str().unwrap(), "--resume", state.to_str().unwrap()])
        .assert()
        .success()
        .stdout("a-x\n");
}

#[test]
fn test_saveas_extract_and_filedelete_touch_disk() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("save.iim");
    std::fs::write(dir.path().join("stale.txt"), "old").unwrap();
    std::fs::write(
        &script,
        concat!(
            "SET !EXTRACT {{!LOOP}}\n",
            "SAVEAS TYPE=EXTRACT FOLDER=* FILE=out/rows.csv\n",
            "FILEDELETE NAME=stale.txt\n",
        ),
    )
    .unwrap();

    macroflow(dir.path())
        .args(["run", script.to_str().unwrap()])
        .assert()
        .success()
        .stdout("1\n");

    let rows = std::fs::read_to_string(dir.path().join("out").join("rows.csv")).unwrap();
    assert_eq!(rows, "\"1\"\n");
    assert!(!dir.path().join("stale.txt").exists());
}

#[test]
fn test_resume_rejects_non_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let bogus = dir.path().join("bogus.json");
    std::fs::write(&bogus, r#"{"hello": "world"}"#).unwrap();
    macroflow(dir.path())
        .args([
            "run",
            fixture_path("hello.iim").to_str().unwrap(),
            "--resume",
            bogus.to_str().unwrap(),
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid state file"));
}

#[test]
fn test_missing_script_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    macroflow(dir.path())
        .args(["run", dir.path().join("nope.iim").to_str().unwrap()])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("nope.iim"));
}

#[test]
fn test_vars_lists_defaults() {
    let dir = tempfile::tempdir().unwrap();
    macroflow(dir.path())
        .arg("vars")
        .assert()
        .success()
        .stdout(predicate::str::contains("!LOOP = 1"))
        .stdout(predicate::str::contains("!TIMEOUT_STEP = 6"))
        .stdout(predicate::str::contains("!DATASOURCE_DELIMITER\n"));
}
