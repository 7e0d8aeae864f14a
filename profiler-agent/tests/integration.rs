// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

mod helpers;

use helpers::{DaemonHandle, write_config};
use std::time::Duration;

#[test]
fn daemon_starts_and_listens_for_heartbeats() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(dir.path(), "http://127.0.0.1:1", 0);

    let mut daemon = DaemonHandle::start(&config_path);
    assert!(
        daemon.wait_for_log_default("listening on"),
        "daemon should start the spark listener"
    );

    let status = daemon.stop();
    assert!(status.success(), "daemon should exit cleanly on SIGTERM");
}

#[test]
fn daemon_reports_heartbeat_failures_without_crashing() {
    let dir = tempfile::tempdir().unwrap();
    // Port 1 is reserved and never accepts connections, so every heartbeat
    // tick fails; the daemon must log and keep going rather than exit.
    let config_path = write_config(dir.path(), "http://127.0.0.1:1", 0);

    let mut daemon = DaemonHandle::start(&config_path);
    assert!(
        daemon.wait_for_log_default("tick failed"),
        "daemon should log the heartbeat failure instead of panicking"
    );

    let status = daemon.stop();
    assert!(status.success(), "daemon should still shut down cleanly");
}

#[test]
fn daemon_missing_config_file_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("does-not-exist.yaml");

    let mut daemon = DaemonHandle::start(&missing);
    let status = daemon.wait_with_timeout(Duration::from_secs(5));
    assert!(!status.success(), "daemon should fail fast on missing config");
}

#[test]
fn daemon_version_flag_prints_and_exits() {
    let bin = env!("CARGO_BIN_EXE_profiler-agentd");
    let output = std::process::Command::new(bin)
        .arg("--version")
        .output()
        .expect("failed to run profiler-agentd --version");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("profiler-agentd"));
}
