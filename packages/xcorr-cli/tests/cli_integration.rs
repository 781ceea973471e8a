use assert_cmd::Command;
use predicates::prelude::*;

fn xcorr() -> Command {
    Command::cargo_bin("xcorr").unwrap()
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    let stdout = String::from_utf8(output.stdout.clone()).unwrap();
    serde_json::from_str(&stdout).unwrap()
}

// =============================================================================
// GENERAL
// =============================================================================

#[test]
fn test_no_args_shows_help() {
    xcorr()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn test_version_flag() {
    xcorr()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("xcorr"));
}

#[test]
fn test_help_flag() {
    xcorr()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("simulated correlator"));
}

// =============================================================================
// MODES SUBCOMMAND
// =============================================================================

#[test]
fn test_modes_table() {
    xcorr()
        .arg("modes")
        .assert()
        .success()
        .stdout(predicate::str::contains("counter"))
        .stdout(predicate::str::contains("autocorrelator"))
        .stdout(predicate::str::contains("crosscorrelator"));
}

#[test]
fn test_modes_json_counter_has_no_variants() {
    let output = xcorr().args(["modes", "--json"]).assert().success();
    let parsed = stdout_json(output.get_output());
    let modes = parsed.as_array().unwrap();
    assert_eq!(modes.len(), 3);

    let counter = &modes[0];
    assert_eq!(counter["name"], "counter");
    assert_eq!(counter["log"], false);
    assert_eq!(counter["inverse"], false);
    assert_eq!(modes[2]["scope"], "baseline");
    assert_eq!(modes[1]["inverse"], true);
}

// =============================================================================
// INFO SUBCOMMAND
// =============================================================================

#[test]
fn test_info_subcommand() {
    xcorr()
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("xcorr CLI v"))
        .stdout(predicate::str::contains("6 baselines"));
}

#[test]
fn test_info_json_buffer_sizes() {
    let output = xcorr()
        .args(["info", "--json", "--lines", "4", "--delay-size", "16", "--time-scale", "2"])
        .assert()
        .success();
    let parsed = stdout_json(output.get_output());
    // lines * delay * (k + 2) / 2 and baselines * (2 * delay * (k + 2) + 1)
    assert_eq!(parsed["buffers"]["autocorrelation_len"], 128);
    assert_eq!(parsed["buffers"]["crosscorrelation_len"], 6 * 129);
    assert_eq!(parsed["geometry"]["num_baselines"], 6);
    assert_eq!(parsed["sample_spacing_ns"], 10.0);
    assert_eq!(parsed["axes"].as_array().unwrap().len(), 3);
}

#[test]
fn test_info_rejects_single_line() {
    xcorr()
        .args(["info", "--lines", "1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid configuration"));
}

#[test]
fn test_info_rejects_time_scale_out_of_range() {
    xcorr()
        .args(["info", "--time-scale", "64"])
        .assert()
        .code(2);
}

// =============================================================================
// RUN SUBCOMMAND
// =============================================================================

fn quick_run() -> Command {
    let mut cmd = xcorr();
    cmd.args([
        "run",
        "--delay-size",
        "16",
        "--packet-period",
        "0.005",
        "--scan-pass-ms",
        "1",
        "--seed",
        "11",
        "--duration-ms",
        "300",
        "--publish-interval-ms",
        "50",
        "--quiet",
    ]);
    cmd
}

#[test]
fn test_run_counter_summary() {
    let output = quick_run().args(["--summary", "--compact"]).assert().success();
    let parsed = stdout_json(output.get_output());
    assert_eq!(parsed["mode"]["base"], "counter");
    assert_eq!(parsed["series"].as_array().unwrap().len(), 4);
    assert!(parsed["stats"]["frames_captured"].as_u64().unwrap() > 0);
    assert_eq!(parsed["axis"]["x_label"], "Time (s)");
}

#[test]
fn test_run_batch_autocorrelator_variants() {
    let output = quick_run()
        .args(["--mode", "auto", "--log", "--inverse", "--stack", "2", "--summary"])
        .assert()
        .success();
    let parsed = stdout_json(output.get_output());
    let series = parsed["series"].as_array().unwrap();
    // four lines, three kinds each
    assert_eq!(series.len(), 12);
    let plain = series
        .iter()
        .find(|s| s["channel"] == 0 && s["kind"] == "plain")
        .unwrap();
    assert_eq!(plain["points"], 14);
    assert!(parsed["stats"]["scans_completed"].as_u64().unwrap() > 0);
}

#[test]
fn test_run_streams_json_lines() {
    let output = quick_run().assert().success();
    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let events: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(events.first().unwrap()["event"], "connection_changed");
    assert_eq!(events.first().unwrap()["connected"], true);
    assert!(events
        .iter()
        .any(|e| e["event"] == "connection_changed" && e["connected"] == false));
    assert!(events.iter().any(|e| e["event"] == "sweep_update"));
}

#[test]
fn test_run_summary_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("summary.json");
    quick_run()
        .args(["--summary", "-o", path.to_str().unwrap()])
        .assert()
        .success();
    let text = std::fs::read_to_string(&path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert!(parsed["session_id"].is_string());
}

#[test]
fn test_run_log_filter_from_environment() {
    quick_run()
        .env("XCORR_LOG", "xcorr_core=info")
        .arg("--summary")
        .assert()
        .success()
        .stderr(predicate::str::contains("Capture loop started"));
}

#[test]
fn test_run_verbose_overrides_environment() {
    quick_run()
        .env("XCORR_LOG", "off")
        .args(["-v", "--summary"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Capture loop started"));
}

#[test]
fn test_run_counter_rejects_log() {
    quick_run()
        .args(["--log", "--summary"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("counter mode"));
}

#[test]
fn test_run_rejects_unknown_mode() {
    quick_run()
        .args(["--mode", "spectrum"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown mode"));
}

#[test]
fn test_run_rejects_bad_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"stack": "deep"}"#).unwrap();
    quick_run()
        .args(["--config", path.to_str().unwrap()])
        .assert()
        .code(2);
}

#[test]
fn test_run_rejects_missing_line() {
    quick_run()
        .args(["--low-power", "7", "--summary"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("line 7 out of range"));
}
