// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Cgroup discovery and scoring for the kernel sampler's `--cgroup` mode.
//!
//! Supports both cgroup v1 (split `cpu,cpuacct`/`memory` hierarchies) and
//! v2 (unified hierarchy). A cgroup is only reported if its accounting
//! controller *and* the `perf_event` controller both resolve to a real
//! path, since `perf record -G` silently ignores names it cannot find.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use walkdir::WalkDir;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

#[derive(Debug, Clone, PartialEq)]
pub struct CgroupResourceUsage {
    pub path: PathBuf,
    pub name: String,
    pub cpu_ns: u64,
    pub memory_bytes: u64,
}

impl CgroupResourceUsage {
    /// `10 * cpu_seconds + memory_MB`. CPU is weighted ten to one because
    /// active CPU predicts profiling interest far better than resident
    /// memory alone.
    pub fn score(&self) -> f64 {
        let cpu_seconds = self.cpu_ns as f64 / 1_000_000_000.0;
        let memory_mb = self.memory_bytes as f64 / (1024.0 * 1024.0);
        10.0 * cpu_seconds + memory_mb
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

pub fn is_cgroup_available() -> bool {
    Path::new(CGROUP_ROOT).exists()
}

/// Detects which cgroup hierarchy layout the host uses. v2 is assumed when
/// the unified `cgroup.controllers` file exists at the root; otherwise we
/// fall back to the v1 split-hierarchy layout.
pub fn detect_version() -> Option<CgroupVersion> {
    if !is_cgroup_available() {
        return None;
    }
    if Path::new(CGROUP_ROOT).join("cgroup.controllers").exists() {
        Some(CgroupVersion::V2)
    } else {
        Some(CgroupVersion::V1)
    }
}

fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Reads `usage_usec=<n>` out of a v2 `cpu.stat` file, converting to ns.
fn read_cpu_stat_usage_ns(cgroup_dir: &Path) -> Option<u64> {
    let contents = fs::read_to_string(cgroup_dir.join("cpu.stat")).ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("usage_usec ") {
            return rest.trim().parse::<u64>().ok().map(|usec| usec * 1000);
        }
    }
    None
}

fn v1_cpu_usage(cgroup_dir: &Path) -> Option<u64> {
    read_u64(&cgroup_dir.join("cpuacct.usage"))
}

fn v1_memory_usage(cgroup_dir: &Path) -> Option<u64> {
    read_u64(&cgroup_dir.join("memory.usage_in_bytes"))
}

fn v2_memory_usage(cgroup_dir: &Path) -> Option<u64> {
    read_u64(&cgroup_dir.join("memory.current"))
}

/// The three cpuacct-hierarchy mount points the kernel may expose,
/// depending on distro cgroup manager configuration.
const V1_CPU_ROOTS: [&str; 2] = ["cpu,cpuacct", "cpuacct"];

fn walk_candidate_dirs(root: &Path) -> Vec<PathBuf> {
    if !root.exists() {
        return Vec::new();
    }
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.path().to_path_buf())
        .collect()
}

/// Enumerates every cgroup directory with usable CPU and/or memory
/// accounting files, deduplicated by the relative name `to_perf_name`
/// would derive.
fn find_all_cgroups(version: CgroupVersion) -> Vec<PathBuf> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    let roots: Vec<PathBuf> = match version {
        CgroupVersion::V1 => {
            let mut r: Vec<PathBuf> = V1_CPU_ROOTS
                .iter()
                .map(|c| Path::new(CGROUP_ROOT).join(c))
                .collect();
            r.push(Path::new(CGROUP_ROOT).join("memory"));
            r
        }
        CgroupVersion::V2 => vec![Path::new(CGROUP_ROOT).to_path_buf()],
    };

    for root in roots {
        for dir in walk_candidate_dirs(&root) {
            let has_usage = match version {
                CgroupVersion::V1 => {
                    v1_cpu_usage(&dir).is_some() || v1_memory_usage(&dir).is_some()
                }
                CgroupVersion::V2 => {
                    read_cpu_stat_usage_ns(&dir).is_some() || v2_memory_usage(&dir).is_some()
                }
            };
            if !has_usage {
                continue;
            }
            let name = to_perf_name(&dir);
            if seen.insert(name) {
                out.push(dir);
            }
        }
    }
    out
}

/// Reads CPU and memory usage for one cgroup directory. Returns `None` if
/// neither metric is readable (the cgroup likely vanished mid-scan); a
/// metric that is present for one controller but missing for the other
/// defaults to zero rather than dropping the whole entry.
fn resource_usage(dir: &Path, version: CgroupVersion) -> Option<CgroupResourceUsage> {
    let (cpu_ns, memory_bytes) = match version {
        CgroupVersion::V1 => (v1_cpu_usage(dir), v1_memory_usage(dir)),
        CgroupVersion::V2 => (read_cpu_stat_usage_ns(dir), v2_memory_usage(dir)),
    };
    if cpu_ns.is_none() && memory_bytes.is_none() {
        return None;
    }
    // `name` must stay the exact string `perf -G` expects; truncating it
    // the way a human-facing container id display would is a different
    // concern and belongs to a caller that renders one, not here.
    Some(CgroupResourceUsage {
        path: dir.to_path_buf(),
        name: to_perf_name(dir),
        cpu_ns: cpu_ns.unwrap_or(0),
        memory_bytes: memory_bytes.unwrap_or(0),
    })
}

/// Strips a known controller mount prefix to derive the name `perf -G`
/// expects; falls back to the basename if no known prefix matches.
pub fn to_perf_name(path: &Path) -> String {
    let known_prefixes = [
        format!("{CGROUP_ROOT}/memory/"),
        format!("{CGROUP_ROOT}/cpu,cpuacct/"),
        format!("{CGROUP_ROOT}/cpuacct/"),
        format!("{CGROUP_ROOT}/"),
    ];
    let s = path.to_string_lossy();
    for prefix in &known_prefixes {
        if let Some(rest) = s.strip_prefix(prefix.as_str()) {
            return rest.trim_end_matches('/').to_string();
        }
    }
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Whether `name` also resolves under the `perf_event` controller, which
/// `perf record -G` requires independently of whichever controller we used
/// to measure usage.
pub fn has_perf_event_access(name: &str) -> bool {
    Path::new(CGROUP_ROOT)
        .join("perf_event")
        .join(name)
        .is_dir()
}

/// Returns the top `limit` cgroups by [`CgroupResourceUsage::score`],
/// restricted to ones with a matching `perf_event` path.
pub fn top_cgroups_for_perf(limit: usize) -> Vec<CgroupResourceUsage> {
    let Some(version) = detect_version() else {
        return Vec::new();
    };
    let mut usages: Vec<CgroupResourceUsage> = find_all_cgroups(version)
        .iter()
        .filter_map(|dir| resource_usage(dir, version))
        .filter(|u| has_perf_event_access(&u.name))
        .collect();
    usages.sort_by(|a, b| b.score().partial_cmp(&a.score()).unwrap());
    usages.truncate(limit);
    if usages.len() < limit {
        info!(
            "[cgroup] found only {} eligible cgroup(s), fewer than the requested {limit}",
            usages.len()
        );
    }
    usages
}

/// Names the kernel sampler supervisor should scope to, or an empty vec if
/// scoping was requested but nothing eligible exists (the caller must treat
/// that as a hard refusal to start, never a silent fallback).
pub fn top_cgroup_names_for_perf(limit: usize) -> Vec<String> {
    let names: Vec<String> = top_cgroups_for_perf(limit)
        .into_iter()
        .map(|u| u.name)
        .collect();
    if names.is_empty() {
        warn!("[cgroup] cgroup scoping requested but no eligible cgroups were found");
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn score_weights_cpu_ten_to_one() {
        let u = CgroupResourceUsage {
            path: PathBuf::new(),
            name: "x".into(),
            cpu_ns: 2_000_000_000, // 2s
            memory_bytes: 5 * 1024 * 1024, // 5MB
        };
        assert_eq!(u.score(), 25.0);
    }

    #[test]
    fn to_perf_name_strips_known_prefixes() {
        assert_eq!(
            to_perf_name(Path::new("/sys/fs/cgroup/cpu,cpuacct/docker/abc")),
            "docker/abc"
        );
        assert_eq!(
            to_perf_name(Path::new("/sys/fs/cgroup/memory/system.slice")),
            "system.slice"
        );
        assert_eq!(
            to_perf_name(Path::new("/sys/fs/cgroup/unknownroot/foo")),
            "foo"
        );
    }

    #[test]
    fn v2_cpu_stat_parses_usage_usec() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("cpu.stat"),
            "usage_usec 1500000\nuser_usec 1000000\nsystem_usec 500000\n",
        )
        .unwrap();
        assert_eq!(read_cpu_stat_usage_ns(dir.path()), Some(1_500_000_000));
    }

    #[test]
    fn resource_usage_none_when_both_missing() {
        let dir = tempdir().unwrap();
        assert!(resource_usage(dir.path(), CgroupVersion::V1).is_none());
    }

    #[test]
    fn resource_usage_defaults_missing_metric_to_zero() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("cpuacct.usage"), "123456\n").unwrap();
        let u = resource_usage(dir.path(), CgroupVersion::V1).unwrap();
        assert_eq!(u.cpu_ns, 123456);
        assert_eq!(u.memory_bytes, 0);
    }
}
