//! CLI integration tests: run the actual opptick binary against a scratch
//! database. Marked `#[ignore]` to skip in normal `cargo test`.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

fn opptick(db: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_opptick"));
    cmd.arg("--db").arg(db).args(["--user", "cli-test"]);
    cmd
}

fn run(db: &Path, args: &[&str]) -> Output {
    opptick(db).args(args).output().expect("failed to execute")
}

fn chat(db: &Path, lines: &[&str]) -> Output {
    let mut child = opptick(db)
        .arg("chat")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn opptick chat");
    if let Some(mut stdin) = child.stdin.take() {
        for line in lines {
            writeln!(stdin, "{line}").unwrap();
        }
    }
    child.wait_with_output().expect("failed to wait for chat")
}

#[test]
#[ignore]
fn test_cli_status_output() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(&dir.path().join("db.sqlite"), &["status"]);
    assert!(
        output.status.success(),
        "opptick status failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("schema v1"));
}

#[test]
#[ignore]
fn test_cli_list_json_empty() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(&dir.path().join("db.sqlite"), &["list", "--json"]);
    assert!(output.status.success());
    let items: Vec<serde_json::Value> =
        serde_json::from_str(String::from_utf8_lossy(&output.stdout).trim())
            .expect("invalid JSON output");
    assert!(items.is_empty());
}

#[test]
#[ignore]
fn test_cli_chat_then_done() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("db.sqlite");

    let output = chat(
        &db,
        &[
            "Research internship at Acme. Apply in 3 weeks",
            "",
            "yes",
            "yes",
            "1",
            "Acme research internship",
        ],
    );
    assert!(
        output.status.success(),
        "chat failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("Saved: Acme research internship"));

    let output = run(&db, &["list", "--json"]);
    let items: Vec<serde_json::Value> =
        serde_json::from_str(String::from_utf8_lossy(&output.stdout).trim()).unwrap();
    assert_eq!(items.len(), 1);
    let id = items[0]["id"].as_str().unwrap().to_string();

    let output = run(&db, &["done", &id]);
    assert!(output.status.success());
    let output = run(&db, &["archived", "--json"]);
    let items: Vec<serde_json::Value> =
        serde_json::from_str(String::from_utf8_lossy(&output.stdout).trim()).unwrap();
    assert_eq!(items[0]["status"], "done");
}

#[test]
#[ignore]
fn test_cli_chat_accepts_multiline_forward() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("db.sqlite");

    let output = chat(
        &db,
        &[
            "Research internship at Acme",
            "Open to second-year students.",
            "Apply in 4 weeks",
            "",
            "yes",
            "yes",
            "2",
            "Acme internship",
        ],
    );
    assert!(
        output.status.success(),
        "chat failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("Saved: Acme internship"));

    let output = run(&db, &["list", "--json"]);
    let items: Vec<serde_json::Value> =
        serde_json::from_str(String::from_utf8_lossy(&output.stdout).trim()).unwrap();
    assert_eq!(items.len(), 1);
}

#[test]
#[ignore]
fn test_cli_unknown_id_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = run(&dir.path().join("db.sqlite"), &["show", "deadbeef"]);
    assert!(!output.status.success());
}

#[test]
#[ignore]
fn test_cli_settings_rejects_bad_time() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("db.sqlite");
    assert!(!run(&db, &["settings", "--time", "7pm"]).status.success());
    let output = run(&db, &["settings", "--disable", "--time", "07:30"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("07:30"));
}
