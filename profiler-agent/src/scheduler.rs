// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Per-process profiler scheduler: selects targets for one runtime sampler,
//! enforces the concurrency cap via CPU-usage ranking, runs one worker per
//! target, and optionally tracks newly spawned processes mid-cycle.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use crate::errors::ProfileError;
use crate::parser::{self, ProcessToStackSampleCounters, StackToSampleCount};
use crate::procfs;
use crate::registry::{ProcessRegistry, SpawnOpts};
use crate::resolver::{ContainerIdentity, RuntimeResolver};
use crate::runtime::RuntimeSampler;

const BACKOFF_SCHEDULE: [Duration; 4] = [
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(400),
    Duration::from_millis(800),
];

pub struct SchedulerConfig {
    pub duration: Duration,
    /// 0 disables the cap.
    pub max_processes: usize,
    pub spawn_tracking: bool,
    pub output_dir: PathBuf,
}

/// One runtime sampler's cycle result: per-pid collapsed-stack samples
/// alongside the container/pod identity resolved for each profiled pid.
#[derive(Debug, Clone, Default)]
pub struct SchedulerCycleResult {
    pub samples: ProcessToStackSampleCounters,
    pub identities: HashMap<i32, ContainerIdentity>,
}

/// Runs one profiling cycle for a single runtime sampler and returns its
/// per-pid results. `whitelist`, if present, further restricts the
/// candidate set (the collector's `pids` field).
pub async fn run_cycle(
    sampler: Arc<dyn RuntimeSampler>,
    registry: Arc<ProcessRegistry>,
    resolver: Arc<dyn RuntimeResolver>,
    cfg: SchedulerConfig,
    whitelist: Option<Vec<i32>>,
    stop: watch::Receiver<bool>,
) -> SchedulerCycleResult {
    let cycle_end = Instant::now() + cfg.duration;

    let mut candidates: Vec<i32> = sampler
        .enumerate_candidates()
        .into_iter()
        .filter(|&pid| !sampler.should_skip(pid))
        .collect();

    if let Some(whitelist) = &whitelist {
        let allowed: HashSet<i32> = whitelist.iter().copied().collect();
        candidates.retain(|pid| allowed.contains(pid));
    }

    if !sampler.is_system_wide() && cfg.max_processes > 0 && candidates.len() > cfg.max_processes {
        candidates = rank_by_cpu_and_truncate(candidates, cfg.max_processes).await;
    }

    let preexisting: HashSet<i32> = candidates.iter().copied().collect();

    let mut result = SchedulerCycleResult::default();
    if candidates.is_empty() && !cfg.spawn_tracking {
        return result;
    }

    let mut handles = Vec::new();
    for pid in &candidates {
        handles.push(tokio::spawn(profile_one(
            sampler.clone(),
            registry.clone(),
            resolver.clone(),
            *pid,
            cfg.duration,
            cfg.output_dir.clone(),
            stop.clone(),
        )));
    }

    let mut late_handles = Vec::new();
    if cfg.spawn_tracking {
        late_handles = spawn_tracking_barrier(
            sampler.clone(),
            registry.clone(),
            resolver.clone(),
            preexisting,
            cycle_end,
            cfg.output_dir.clone(),
            stop.clone(),
        )
        .await;
    }

    for h in handles.into_iter().chain(late_handles) {
        if let Ok((pid, data, identity)) = h.await {
            result.samples.insert(pid, data);
            result.identities.insert(pid, identity);
        }
    }

    result
}

async fn rank_by_cpu_and_truncate(candidates: Vec<i32>, max: usize) -> Vec<i32> {
    let mut scored = Vec::with_capacity(candidates.len());
    for pid in candidates {
        let pct = procfs::cpu_percent(pid, Duration::from_millis(100)).await;
        scored.push((pid, pct));
    }
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
    if log::log_enabled!(log::Level::Debug) {
        let top5: Vec<String> = scored
            .iter()
            .take(5)
            .map(|(pid, pct)| format!("({pid}, {pct:.1}%)"))
            .collect();
        debug!("[scheduler] top candidates by cpu: {}", top5.join(", "));
    }
    scored.truncate(max);
    scored.into_iter().map(|(pid, _)| pid).collect()
}

/// Markers the external samplers print on stderr when they attach to a pid
/// that turns out not to actually be the runtime they expected.
const MISCLASSIFICATION_MARKERS: &[&str] = &[
    "doesn't appear to be",
    "not a python process",
    "not a ruby process",
    "is not a",
    "no such process",
];

fn classify_failure(pid: i32, runtime: &'static str, status: Option<ExitStatus>, stderr: &str) -> ProfileError {
    let lower = stderr.to_lowercase();
    if MISCLASSIFICATION_MARKERS.iter().any(|m| lower.contains(m)) {
        return ProfileError::Misclassified { pid, runtime };
    }
    let detail = match status {
        Some(status) if !status.success() && !stderr.trim().is_empty() => stderr.trim().to_string(),
        Some(status) if !status.success() => format!("exited with {status}"),
        _ => "produced no output".to_string(),
    };
    ProfileError::SamplerCrashed { pid, detail }
}

async fn drain_stderr(stderr: tokio::process::ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut collected = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        collected.push(line);
    }
    collected.join("\n")
}

async fn profile_one(
    sampler: Arc<dyn RuntimeSampler>,
    registry: Arc<ProcessRegistry>,
    resolver: Arc<dyn RuntimeResolver>,
    pid: i32,
    duration: Duration,
    output_dir: PathBuf,
    mut stop: watch::Receiver<bool>,
) -> (i32, StackToSampleCount, ContainerIdentity) {
    let comm = procfs::comm(pid).unwrap_or_else(|_| "unknown".to_string());
    let identity = resolver.resolve(pid);

    if !procfs::exists(pid) {
        let (what, reason) = ProfileError::TargetGone { pid }.error_stack_parts();
        return (pid, parser::error_stack(what, &reason, &comm), identity);
    }

    let output_path = output_dir.join(format!("{}.{}.col", sampler.name(), pid));
    let argv = sampler.argv(pid, duration, &output_path);

    let mut opts = SpawnOpts::new(sampler.name(), &argv);
    opts.stdout = Stdio::null();
    opts.stderr = Stdio::piped();

    let handle = match registry.spawn(opts) {
        Ok(h) => h,
        Err(e) => {
            let (what, reason) = ProfileError::Other { kind: e.to_string() }.error_stack_parts();
            return (pid, parser::error_stack(what, &reason, &comm), identity);
        }
    };

    let stderr_task = registry
        .take_stderr(handle)
        .map(|stderr| tokio::spawn(drain_stderr(stderr)));

    let grace = duration + Duration::from_secs(2);
    let status: Option<ExitStatus> = tokio::select! {
        _ = tokio::time::sleep(grace) => {
            registry.send_signal(handle, nix::sys::signal::Signal::SIGKILL);
            registry.wait(handle).await
        }
        status = registry.wait(handle) => status,
        _ = stop.changed() => {
            registry.send_signal(handle, nix::sys::signal::Signal::SIGTERM);
            registry.wait(handle).await
        }
    };
    registry.reap_exited();

    let stderr_tail = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    match std::fs::read_to_string(&output_path) {
        Ok(text) if !text.trim().is_empty() => {
            let (samples, _) = parser::collapsed::parse_one_collapsed(&text, Some(&comm));
            (pid, samples, identity)
        }
        _ => {
            let err = classify_failure(pid, sampler.name(), status, &stderr_tail);
            let (what, reason) = err.error_stack_parts();
            (pid, parser::error_stack(what, &reason, &comm), identity)
        }
    }
}

/// Polls for newly exec'd candidates at the exponential backoff schedule,
/// launching a late worker (with the remaining cycle time as its duration)
/// for every new pid that passes `should_skip`. Returns the join handles of
/// every late worker so the caller can await them up to the cycle end.
async fn spawn_tracking_barrier(
    sampler: Arc<dyn RuntimeSampler>,
    registry: Arc<ProcessRegistry>,
    resolver: Arc<dyn RuntimeResolver>,
    preexisting: HashSet<i32>,
    cycle_end: Instant,
    output_dir: PathBuf,
    stop: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<(i32, StackToSampleCount, ContainerIdentity)>> {
    let mut seen = preexisting;
    let mut late_handles = Vec::new();

    for backoff in BACKOFF_SCHEDULE {
        if Instant::now() >= cycle_end {
            break;
        }
        tokio::time::sleep(backoff.min(cycle_end.saturating_duration_since(Instant::now()))).await;

        let now = Instant::now();
        if now >= cycle_end {
            break;
        }

        let fresh: Vec<i32> = sampler
            .enumerate_candidates()
            .into_iter()
            .filter(|pid| !seen.contains(pid) && !sampler.should_skip(*pid))
            .collect();

        for pid in fresh {
            seen.insert(pid);
            let remaining = cycle_end.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                continue;
            }
            late_handles.push(tokio::spawn(profile_one(
                sampler.clone(),
                registry.clone(),
                resolver.clone(),
                pid,
                remaining,
                output_dir.clone(),
                stop.clone(),
            )));
        }
    }

    late_handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::NoopResolver;
    use crate::runtime::generic::GenericRuntimeSampler;

    fn self_sampler() -> Arc<dyn RuntimeSampler> {
        Arc::new(GenericRuntimeSampler {
            name: "test",
            tool_path: "/bin/true".to_string(),
            basenames: vec!["__never_matches__"],
            min_age_secs: 0.0,
            extra_args: vec![],
        })
    }

    fn noop_resolver() -> Arc<dyn RuntimeResolver> {
        Arc::new(NoopResolver)
    }

    #[tokio::test]
    async fn empty_candidate_set_without_spawn_tracking_returns_empty() {
        let registry = Arc::new(ProcessRegistry::new());
        let (_tx, rx) = watch::channel(false);
        let dir = tempfile::tempdir().unwrap();
        let cfg = SchedulerConfig {
            duration: Duration::from_millis(50),
            max_processes: 0,
            spawn_tracking: false,
            output_dir: dir.path().to_path_buf(),
        };
        let result = run_cycle(self_sampler(), registry, noop_resolver(), cfg, None, rx).await;
        assert!(result.samples.is_empty());
        assert!(result.identities.is_empty());
    }

    #[tokio::test]
    async fn profile_one_reports_error_stack_for_vanished_pid() {
        let registry = Arc::new(ProcessRegistry::new());
        let (_tx, rx) = watch::channel(false);
        let dir = tempfile::tempdir().unwrap();
        let sampler = self_sampler();
        let (pid, samples, _identity) = profile_one(
            sampler,
            registry,
            noop_resolver(),
            999_999,
            Duration::from_millis(10),
            dir.path().to_path_buf(),
            rx,
        )
        .await;
        assert_eq!(pid, 999_999);
        let (stack, _) = samples.iter().next().unwrap();
        assert!(stack.starts_with("error;process went down during profiling;"));
    }

    #[tokio::test]
    async fn rank_by_cpu_truncates_to_max() {
        let pids = vec![std::process::id() as i32, 1];
        let ranked = rank_by_cpu_and_truncate(pids, 1).await;
        assert_eq!(ranked.len(), 1);
    }
}
