// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Thin `/proc` reader used by candidate enumeration and CPU-usage ranking.
//! Process-death is treated as routine here, not exceptional: every
//! accessor returns `Option`/`Result` rather than panicking when a pid has
//! already gone away by the time we get to it.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static PROC_ROOT: OnceLock<PathBuf> = OnceLock::new();

pub fn root_path() -> &'static Path {
    PROC_ROOT.get_or_init(|| {
        if let Ok(v) = env::var("HOST_PROC") {
            return v.into();
        }
        "/proc".into()
    })
}

/// A process command line, handling the common case of a runtime that
/// rewrites its own argv into a single space-joined string for display
/// purposes (gunicorn `-n`, puma).
#[derive(Debug)]
pub struct Cmdline {
    raw: String,
    separator: char,
}

impl Cmdline {
    pub fn new(mut raw: String) -> Self {
        let trim_len = raw.trim_end_matches('\0').len();
        raw.truncate(trim_len);

        let mut parts = raw.split_terminator('\0');
        let separator = if let (Some(first), None) = (parts.next(), parts.next())
            && first.contains(' ')
        {
            ' '
        } else {
            '\0'
        };
        Cmdline { raw, separator }
    }

    pub fn get(pid: i32) -> std::io::Result<Self> {
        let path = root_path().join(pid.to_string()).join("cmdline");
        Ok(Self::new(std::fs::read_to_string(path)?))
    }

    pub fn args(&self) -> impl DoubleEndedIterator<Item = &str> {
        self.raw.split_terminator(self.separator)
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

pub fn comm(pid: i32) -> std::io::Result<String> {
    let path = root_path().join(pid.to_string()).join("comm");
    Ok(std::fs::read_to_string(path)?.trim_end().to_string())
}

pub fn exe_path(pid: i32) -> std::io::Result<PathBuf> {
    let path = root_path().join(pid.to_string()).join("exe");
    std::fs::read_link(path)
}

pub fn exists(pid: i32) -> bool {
    root_path().join(pid.to_string()).exists()
}

/// Lists every numeric entry under the proc root, i.e. every currently
/// visible pid. Entries that vanish mid-scan are silently skipped.
pub fn list_pids() -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir(root_path()) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse::<i32>().ok()))
        .collect()
}

/// `/proc/<pid>/stat` field 22 (`starttime`, in clock ticks since boot),
/// used to compute process age without relying on `create_time` semantics
/// that differ across libraries.
fn start_time_ticks(pid: i32) -> Option<u64> {
    let stat = std::fs::read_to_string(root_path().join(pid.to_string()).join("stat")).ok()?;
    // comm can contain spaces/parens; the last ')' marks its end.
    let after_comm = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // fields[0] is state (field 3); starttime is field 22, i.e. index 22-3=19 here.
    fields.get(19)?.parse().ok()
}

fn clock_ticks_per_sec() -> u64 {
    100
}

fn boot_time_secs() -> Option<u64> {
    let stat = std::fs::read_to_string(root_path().join("stat")).ok()?;
    for line in stat.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            return rest.trim().parse().ok();
        }
    }
    None
}

/// Process age in seconds; returns `0.0` (never an error) if the process
/// has already vanished, matching the "skip unconditionally" boundary case
/// for `process_age < min_duration` rather than treating a dead process as
/// arbitrarily old or erroring the whole scheduling pass.
pub fn process_age_secs(pid: i32) -> f64 {
    let (Some(start_ticks), Some(btime)) = (start_time_ticks(pid), boot_time_secs()) else {
        return 0.0;
    };
    let start_secs = btime + start_ticks / clock_ticks_per_sec();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(start_secs);
    now.saturating_sub(start_secs) as f64
}

/// A short, process-death-tolerant CPU usage probe: reads total CPU ticks
/// (utime+stime) at the start and end of `interval`, returning the percent
/// of one core consumed. Dead/inaccessible processes read as `0.0` so they
/// sort last rather than being dropped from ranking outright.
pub async fn cpu_percent(pid: i32, interval: Duration) -> f64 {
    let Some(t0) = cpu_ticks(pid) else {
        return 0.0;
    };
    let start = Instant::now();
    tokio::time::sleep(interval).await;
    let Some(t1) = cpu_ticks(pid) else {
        return 0.0;
    };
    let elapsed = start.elapsed().as_secs_f64();
    if elapsed <= 0.0 {
        return 0.0;
    }
    let delta_ticks = t1.saturating_sub(t0) as f64;
    let delta_secs = delta_ticks / clock_ticks_per_sec() as f64;
    (delta_secs / elapsed) * 100.0
}

fn cpu_ticks(pid: i32) -> Option<u64> {
    let stat = std::fs::read_to_string(root_path().join(pid.to_string()).join("stat")).ok()?;
    let after_comm = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // utime is field 14, stime field 15; offset by the 2 fields (state, ...)
    // already consumed before `after_comm` starts at field 3.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_normalizes_packed_single_string() {
        let packed = Cmdline::new("python -u script.py".to_string());
        let args: Vec<&str> = packed.args().collect();
        assert_eq!(args, vec!["python", "-u", "script.py"]);
    }

    #[test]
    fn cmdline_leaves_normal_nul_separated_args_alone() {
        let normal = Cmdline::new("python\0-u\0script.py".to_string());
        let args: Vec<&str> = normal.args().collect();
        assert_eq!(args, vec!["python", "-u", "script.py"]);
    }

    #[test]
    fn cmdline_empty_has_no_args() {
        let empty = Cmdline::new(String::new());
        assert!(empty.is_empty());
        assert_eq!(empty.args().count(), 0);
    }

    #[test]
    fn process_age_is_zero_for_nonexistent_pid() {
        assert_eq!(process_age_secs(i32::MAX), 0.0);
    }

    #[tokio::test]
    async fn cpu_percent_is_zero_for_nonexistent_pid() {
        let pct = cpu_percent(i32::MAX, Duration::from_millis(10)).await;
        assert_eq!(pct, 0.0);
    }

    #[test]
    fn list_pids_includes_self() {
        let pids = list_pids();
        let me = std::process::id() as i32;
        assert!(pids.contains(&me) || root_path() != Path::new("/proc"));
    }
}
