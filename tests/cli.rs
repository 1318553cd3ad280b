//! CLI test cases.
//!
//! These don't need tesseract or poppler, because every document here fails
//! before any page reaches the OCR engine. Tests which need the real tools
//! are marked `#[ignore]`.

use std::{fs, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use serde_json::Value;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("pagescribe").unwrap()
}

/// Parse JSONL output.
fn records(stdout: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_schema() {
    for type_name in ["JobRecord", "JobOutput", "DocumentResult", "PipelineConfig"] {
        cmd()
            .arg("schema")
            .arg(type_name)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"$schema\""));
    }
    cmd()
        .arg("schema")
        .arg("JobRecord")
        .assert()
        .stdout(predicate::str::contains("mime_type"));
}

#[test]
fn test_schema_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("config.schema.json");
    cmd()
        .arg("schema")
        .arg("PipelineConfig")
        .arg("-o")
        .arg(&out)
        .assert()
        .success();
    let schema: Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    assert!(schema["properties"]["page_boundary_marker"].is_object());
}

#[test]
fn test_ocr_reports_bad_documents_without_aborting() {
    let output = cmd()
        .arg("ocr")
        .arg("tests/fixtures/unsupported.jsonl")
        .arg("--allowed-failure-rate")
        .arg("1.0")
        .output()
        .unwrap();
    assert!(output.status.success());

    let records = records(&output.stdout);
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record["status"], "failed");
        assert!(record["error"]["http_status"].as_u64().unwrap() >= 400);
    }
    assert_eq!(records[0]["id"], "notes");
    assert_eq!(records[1]["id"], "missing");
}

#[test]
fn test_ocr_csv_input_and_unsupported_format() {
    let output = cmd()
        .arg("ocr")
        .arg("tests/fixtures/unsupported.csv")
        .arg("--allowed-failure-rate")
        .arg("1.0")
        .output()
        .unwrap();
    assert!(output.status.success());
    let records = records(&output.stdout);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["error"]["category"], "unsupported_media_type");
    assert_eq!(records[0]["error"]["http_status"], 415);
}

#[test]
fn test_ocr_fails_when_failure_rate_exceeded() {
    cmd()
        .arg("ocr")
        .arg("tests/fixtures/unsupported.jsonl")
        .assert()
        .failure()
        .stderr(predicate::str::contains("were allowed"));
}

#[test]
fn test_ocr_take_first_and_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.jsonl");
    cmd()
        .arg("ocr")
        .arg("tests/fixtures/unsupported.jsonl")
        .arg("--take-first")
        .arg("1")
        .arg("--allowed-failure-rate")
        .arg("1.0")
        .arg("-o")
        .arg(&out)
        .assert()
        .success();
    let records = records(&fs::read(&out).unwrap());
    assert_eq!(records.len(), 1);
}

#[test]
fn test_ocr_reads_stdin() {
    let output = assert_cmd::Command::cargo_bin("pagescribe")
        .unwrap()
        .arg("ocr")
        .arg("--allowed-failure-rate")
        .arg("1.0")
        .write_stdin("{\"id\": 1, \"path\": \"tests/fixtures/notes.txt\"}\n")
        .output()
        .unwrap();
    assert!(output.status.success());
    let records = records(&output.stdout);
    assert_eq!(records[0]["id"], 1);
}

#[test]
fn test_ocr_accepts_config_file() {
    cmd()
        .arg("ocr")
        .arg("tests/fixtures/unsupported.csv")
        .arg("--config")
        .arg("tests/fixtures/pagescribe.toml")
        .arg("--allowed-failure-rate")
        .arg("1.0")
        .assert()
        .success();
}

#[test]
fn test_ocr_rejects_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("bad.toml");
    fs::write(&config, "page_concurency = 2\n").unwrap();
    cmd()
        .arg("ocr")
        .arg("tests/fixtures/unsupported.csv")
        .arg("--config")
        .arg(&config)
        .assert()
        .failure();
}

#[test]
#[ignore = "Needs tesseract installed"]
fn test_ocr_real_image() {
    let dir = tempfile::tempdir().unwrap();
    let png = dir.path().join("blocks.png");
    image::GrayImage::from_fn(400, 200, |x, y| {
        if (40..160).contains(&y) && (y / 10) % 2 == 0 && (20..380).contains(&x) {
            image::Luma([0])
        } else {
            image::Luma([255])
        }
    })
    .save(&png)
    .unwrap();
    let input = dir.path().join("input.jsonl");
    fs::write(
        &input,
        format!("{}\n", serde_json::json!({"id": "blocks", "path": png})),
    )
    .unwrap();
    let output = cmd().arg("ocr").arg(&input).output().unwrap();
    assert!(output.status.success());
    let records = records(&output.stdout);
    assert_eq!(records[0]["result"]["page_count"], 1);
}
