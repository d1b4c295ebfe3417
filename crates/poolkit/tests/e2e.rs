//! End-to-end CLI integration tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn poolkit() -> Command {
    let mut cmd = Command::cargo_bin("poolkit").expect("binary not found");
    cmd.env_remove("POOLKIT_THREADS")
        .env_remove("POOLKIT_POOLS")
        .env_remove("POOLKIT_MAX_FREE")
        .env_remove("POOLKIT_OPTIONS")
        .env_remove("POOLKIT_TRACK_REFS");
    cmd
}

fn run_json(args: &[&str]) -> serde_json::Value {
    let output = poolkit().args(args).output().unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn help_flag() {
    poolkit()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("memory pool"));
}

#[test]
fn version_flag() {
    poolkit()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("poolkit"))
        .stdout(predicate::str::contains("(20 foreign symbols)"));
}

#[test]
fn run_text_report() {
    poolkit()
        .args(["run", "--threads", "2", "--pools", "10"])
        .assert()
        .success()
        .stdout(predicate::str::contains("pools:            20"))
        .stdout(predicate::str::contains("allocated bytes:  0"));
}

#[test]
fn run_json_report() {
    let report = run_json(&["run", "--threads", "3", "--pools", "16", "--allocs", "8", "--json"]);
    assert_eq!(report["threads"], 3);
    assert_eq!(report["totals"]["pools"], 48);
    assert_eq!(report["totals"]["allocations"], 48 * 8);
    assert_eq!(report["totals"]["cleanups_run"], 48);
    assert_eq!(report["totals"]["objects_released"], 48);
    assert_eq!(report["totals"]["large_hits"], 6);
    assert_eq!(report["allocator"]["allocated_bytes"], 0);
}

#[test]
fn run_with_tracking_is_clean() {
    let report = run_json(&["run", "--threads", "2", "--pools", "5", "--track-refs", "--json"]);
    assert_eq!(report["totals"]["objects_released"], 10);
}

#[test]
fn threads_from_env() {
    let output = poolkit()
        .env("POOLKIT_THREADS", "2")
        .env("POOLKIT_POOLS", "4")
        .args(["run", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["totals"]["pools"], 8);
}

#[test]
fn zero_threads_is_config_error() {
    poolkit()
        .args(["run", "--threads", "0"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("--threads"));
}

#[test]
fn max_free_limits_cache() {
    let report = run_json(&["run", "--threads", "1", "--pools", "8", "--max-free", "1", "--json"]);
    assert_eq!(report["allocator"]["cached_bytes"], 0);
}

#[test]
fn config_defaults() {
    let config = run_json(&["config"]);
    assert_eq!(config["allocator"]["boundary_index"], 12);
    assert_eq!(config["pool"]["large_threshold"], 64 * 1024);
    assert_eq!(config["pool"]["default_align"], 16);
}

#[test]
fn config_from_options_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("options.json");
    std::fs::write(&path, r#"{"pool": {"initial_block_size": 16384}}"#).unwrap();
    let config = run_json(&["config", "--options", path.to_str().unwrap()]);
    assert_eq!(config["pool"]["initial_block_size"], 16384);
    assert_eq!(config["allocator"]["max_free_bytes"], 0);
}

#[test]
fn bad_options_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("options.json");
    std::fs::write(&path, "{ nope").unwrap();
    poolkit()
        .args(["config", "--options", path.to_str().unwrap()])
        .assert()
        .code(4);
}

#[test]
fn invalid_allocator_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("options.json");
    std::fs::write(&path, r#"{"allocator": {"boundary_index": 3}}"#).unwrap();
    poolkit()
        .args(["config", "--options", path.to_str().unwrap()])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("boundary_index"));
}

#[test]
fn symbols_resolve() {
    poolkit()
        .arg("symbols")
        .assert()
        .success()
        .stdout(predicate::str::contains("poolkit_palloc"))
        .stdout(predicate::str::contains("backend: ready"))
        .stdout(predicate::str::contains("round trip: ok"));
}

#[test]
fn symbols_json() {
    let report = run_json(&["symbols", "--json"]);
    assert_eq!(report["ready"], true);
    assert_eq!(report["round_trip"], true);
    assert_eq!(report["symbols"].as_array().unwrap().len(), 20);
}
