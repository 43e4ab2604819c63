//! End-to-end tests driving the `docketd` binary.

use std::io::Write;
use std::process::{Command, Output};

use serde_json::Value;

fn docketd(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_docketd"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run docketd")
}

fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> String {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path.to_string_lossy().into_owned()
}

const CONFIG: &str = r#"
[pool]
min_workers = 1
max_workers = 2
worker_types = ["document_processor"]
default_worker_type = "document_processor"

[retry]
max_retries = 0

[executor.commands]
ocr_processing = ["cat"]
text_extraction = ["sh", "-c", "echo corrupt page >&2; exit 1"]
"#;

#[test]
fn check_prints_effective_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_file(&dir, "docket.toml", CONFIG);

    let output = docketd(&["check", "--config", &config]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let effective: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(effective["pool"]["min_workers"], 1);
    assert_eq!(effective["pool"]["max_workers"], 2);
    assert_eq!(effective["retry"]["max_retries"], 0);
    assert_eq!(effective["executor"]["commands"]["ocr_processing"][0], "cat");
    assert_eq!(effective["compatibility"]["legal_analysis"][0], "legal_analyzer");
}

#[test]
fn check_rejects_invalid_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_file(
        &dir,
        "docket.toml",
        "[pool]\nmin_workers = 5\nmax_workers = 2\n",
    );

    let output = docketd(&["check", "--config", &config]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid pool configuration"));
}

#[test]
fn run_processes_a_task_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_file(&dir, "docket.toml", CONFIG);
    let tasks = write_file(
        &dir,
        "batch.ndjson",
        concat!(
            "{\"id\": \"scan-1\", \"type\": \"ocr_processing\", \"data\": {\"doc\": \"exhibit-4.pdf\"}}\n",
            "{\"id\": \"scan-2\", \"type\": \"text_extraction\"}\n",
        ),
    );

    let output = docketd(&["run", "--config", &config, "--tasks", &tasks]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let lines: Vec<Value> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    let completed = lines
        .iter()
        .find(|e| e["event"] == "task_completed")
        .unwrap();
    assert_eq!(completed["task_id"], "scan-1");
    assert_eq!(completed["output"]["doc"], "exhibit-4.pdf");

    let failed = lines.iter().find(|e| e["event"] == "task_failed").unwrap();
    assert_eq!(failed["task_id"], "scan-2");
    assert!(failed["error"].as_str().unwrap().contains("corrupt page"));

    let report = lines.last().unwrap();
    assert_eq!(report["summary"]["submitted"], 2);
    assert_eq!(report["summary"]["completed"], 1);
    assert_eq!(report["summary"]["failed"], 1);
}
