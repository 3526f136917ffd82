#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use serde_json::Value;
use ulid::Ulid;

const TODAY: &str = "2024-06-15";

fn dst_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_dst"))
}

fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../contracts/backup/v1/fixtures")
        .join(name)
}

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("dst-contract-{label}-{}.sqlite3", Ulid::new()))
}

fn dst_command(db_path: &Path) -> Command {
    let mut command = Command::new(dst_binary_path());
    command
        .arg("--db")
        .arg(db_path)
        .arg("--today")
        .arg(TODAY)
        .env_remove("DAILY_STATE_LOG");
    command
}

fn dst_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = dst_command(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run dst command {:?}: {err}", args),
    }
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed\nstdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn remove_db(db_path: &Path) {
    let _ = std::fs::remove_file(db_path);
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = db_path.as_os_str().to_owned();
        sidecar.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(sidecar));
    }
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(dst_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["fields", "today", "day", "export", "import"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn today_edits_merge_and_show_as_day_view_v1() {
    let db_path = temp_db("today");

    assert_success(&dst_output(&db_path, &["today", "rate", "deep_work", "3"]));
    assert_success(&dst_output(&db_path, &["today", "memo", "x"]));

    let output = dst_output(&db_path, &["today", "show", "--json"]);
    assert_success(&output);
    let payload = stdout_json(&output);
    assert_eq!(payload["contract_version"], Value::String("day_view.v1".to_string()));
    assert_eq!(payload["date"], Value::String(TODAY.to_string()));
    assert_eq!(payload["writable"], Value::Bool(true));
    assert_eq!(payload["record"]["deep_work"], Value::from(3));
    assert_eq!(payload["record"]["memo"], Value::String("x".to_string()));

    remove_db(&db_path);
}

#[test]
fn previous_day_view_is_read_only() {
    let db_path = temp_db("prev-day");
    assert_success(&dst_output(&db_path, &["today", "rate", "presence", "5"]));

    let output = dst_output(&db_path, &["day", "show", "--json"]);
    assert_success(&output);
    let payload = stdout_json(&output);
    assert_eq!(payload["date"], Value::String("2024-06-14".to_string()));
    assert_eq!(payload["writable"], Value::Bool(false));
    assert_eq!(payload["record"]["presence"], Value::String(String::new()));

    remove_db(&db_path);
}

#[test]
fn fixture_import_then_export_reproduces_backup_text() {
    let db_path = temp_db("roundtrip");
    let fixture = fixture_path("backup.sample.json");
    let fixture_text = match std::fs::read_to_string(&fixture) {
        Ok(value) => value,
        Err(err) => panic!("failed to read fixture {}: {err}", fixture.display()),
    };

    let import = dst_output(
        &db_path,
        &["import", "json", fixture.to_str().unwrap_or(""), "--json"],
    );
    assert_success(&import);
    let report = stdout_json(&import);
    assert_eq!(
        report["contract_version"],
        Value::String("import_report.v1".to_string())
    );
    assert_eq!(report["records"], Value::from(2));

    let export = dst_output(&db_path, &["export", "json", "--stdout"]);
    assert_success(&export);
    assert_eq!(String::from_utf8_lossy(&export.stdout), fixture_text);

    let csv = dst_output(&db_path, &["export", "csv", "--stdout"]);
    assert_success(&csv);
    let csv_text = String::from_utf8_lossy(&csv.stdout);
    let lines: Vec<&str> = csv_text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("date,pre_sleep_calmness,"));
    assert!(lines[1].starts_with("2024-01-01,"));
    assert!(lines[2].ends_with(",\"a,b\""));

    remove_db(&db_path);
}

#[test]
fn invalid_import_fails_and_leaves_store_unchanged() {
    let db_path = temp_db("bad-import");
    let bad_path = std::env::temp_dir().join(format!("dst-bad-{}.json", Ulid::new()));
    if let Err(err) = std::fs::write(&bad_path, "{ this is not json") {
        panic!("failed to write bad import file: {err}");
    }

    assert_success(&dst_output(&db_path, &["today", "memo", "precious"]));

    let output = dst_output(
        &db_path,
        &["import", "json", bad_path.to_str().unwrap_or("")],
    );
    assert!(!output.status.success(), "expected import to fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("invalid JSON"),
        "expected stable error shape, got stderr={stderr}"
    );

    let show = dst_output(&db_path, &["today", "show", "--json"]);
    assert_success(&show);
    assert_eq!(
        stdout_json(&show)["record"]["memo"],
        Value::String("precious".to_string())
    );

    remove_db(&db_path);
    let _ = std::fs::remove_file(&bad_path);
}

#[test]
fn memo_stream_appends_stdin_lines() {
    let db_path = temp_db("memo-stream");
    assert_success(&dst_output(&db_path, &["today", "memo", "morning"]));

    let mut command = dst_command(&db_path);
    command
        .args(["today", "memo-stream", "--quiet-period-ms", "10", "--json"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => panic!("failed to spawn memo-stream: {err}"),
    };

    match child.stdin.take() {
        Some(mut stdin) => {
            if let Err(err) = stdin.write_all(b"line one\nline two\n") {
                panic!("failed to write memo lines: {err}");
            }
        }
        None => panic!("memo-stream stdin was not piped"),
    }

    let output = match child.wait_with_output() {
        Ok(output) => output,
        Err(err) => panic!("failed waiting for memo-stream: {err}"),
    };
    assert_success(&output);
    assert_eq!(
        stdout_json(&output)["record"]["memo"],
        Value::String("morning\nline one\nline two".to_string())
    );

    remove_db(&db_path);
}

#[test]
fn unknown_rating_field_is_rejected_by_parser() {
    let db_path = temp_db("unknown-field");
    let output = dst_output(&db_path, &["today", "rate", "mood", "4"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown rating field"), "stderr={stderr}");
    remove_db(&db_path);
}
