// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Supervises the host-wide kernel sampler child process: builds its
//! argument vector, starts it, rotates its output on a signal, restarts it
//! when it leaks memory or dies, and streams its decoded event text.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{info, warn};
use nix::sys::signal::Signal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::errors::SupervisorError;
use crate::registry::{Handle, ProcessRegistry, ProcessState, SpawnOpts};

const DUMP_TIMEOUT: Duration = Duration::from_secs(5);
const RESTART_AFTER: Duration = Duration::from_secs(600);
const PERF_MEMORY_THRESHOLD_BYTES: u64 = 200 * 1024 * 1024;
const MMAP_PAGES_FP: u32 = 129;
const MMAP_PAGES_DWARF: u32 = 257;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Init,
    Started,
    Dumped,
    Switched,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScope {
    SystemWide,
    Pids,
    Cgroups,
}

pub struct SamplerConfig {
    pub perf_path: PathBuf,
    pub output_path: PathBuf,
    pub frequency_hz: u32,
    pub is_dwarf: bool,
    pub inject_jit: bool,
    pub switch_timeout_secs: u64,
    pub pids: Vec<i32>,
    pub cgroup_names: Vec<String>,
    pub use_cgroups: bool,
    pub extra_args: Vec<String>,
}

/// Perf event families to probe, in priority order, when discovering which
/// one actually produces samples on this kernel. `Default` means "don't
/// pass `-e` at all", letting `perf` pick its own default event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedPerfEvent {
    Default,
    CpuClock,
    TaskClock,
}

impl SupportedPerfEvent {
    const ALL: [SupportedPerfEvent; 3] = [
        SupportedPerfEvent::Default,
        SupportedPerfEvent::CpuClock,
        SupportedPerfEvent::TaskClock,
    ];

    fn extra_args(self) -> Vec<String> {
        match self {
            SupportedPerfEvent::Default => Vec::new(),
            SupportedPerfEvent::CpuClock => vec!["-e".to_string(), "cpu-clock".to_string()],
            SupportedPerfEvent::TaskClock => vec!["-e".to_string(), "task-clock".to_string()],
        }
    }
}

/// Probes each event family with a short, throwaway `perf record` run
/// against `sleep 1` until one actually produces a non-empty output file.
/// A family that crashes `perf` outright (fatal signal on some GPU hosts)
/// is treated the same as one that silently produces nothing: logged,
/// moved past. Only total failure across every family is an error.
async fn discover_appropriate_perf_event(
    registry: &ProcessRegistry,
    perf_path: &Path,
    probe_dir: &Path,
) -> Result<SupportedPerfEvent, SupervisorError> {
    for event in SupportedPerfEvent::ALL {
        let probe_output = probe_dir.join(format!("perf-probe-{event:?}.data"));
        let _ = std::fs::remove_file(&probe_output);

        let mut argv = vec![
            perf_path.to_string_lossy().to_string(),
            "record".to_string(),
            "-o".to_string(),
            probe_output.to_string_lossy().to_string(),
            "-g".to_string(),
        ];
        argv.extend(event.extra_args());
        argv.push("--".to_string());
        argv.push("sleep".to_string());
        argv.push("1".to_string());

        let mut opts = SpawnOpts::new("perf-discovery", &argv);
        opts.stdout = Stdio::null();
        opts.stderr = Stdio::null();

        let handle = match registry.spawn(opts) {
            Ok(h) => h,
            Err(e) => {
                warn!("[sampler] discovery probe for {event:?} failed to spawn: {e}");
                continue;
            }
        };
        let status = registry.wait(handle).await;
        registry.reap_exited();
        let produced_samples = std::fs::metadata(&probe_output).map(|m| m.len() > 0).unwrap_or(false);
        let _ = std::fs::remove_file(&probe_output);

        match status {
            Some(status) if status.success() && produced_samples => {
                info!("[sampler] event discovery selected {event:?}");
                return Ok(event);
            }
            Some(status) => warn!("[sampler] discovery probe for {event:?} exited with {status}, no usable output"),
            None => warn!("[sampler] discovery probe for {event:?} could not be awaited"),
        }
    }
    Err(SupervisorError::NoSupportedEvent)
}

fn is_pid_related_error(message: &str) -> bool {
    const MARKERS: &[&str] = &[
        "no such process",
        "invalid pid",
        "process not found",
        "process exited",
        "operation not permitted",
        "permission denied",
        "attach failed",
        "failed to attach",
    ];
    let lower = message.to_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

/// Builds the kernel sampler's argv, in the order the sampler requires:
/// frequency/call-graph/output/rotation flags, then explicit events, then
/// pid or cgroup targeting flags (events must precede `-G` when mixing with
/// cgroup targets), then the JIT flag.
fn build_argv(
    cfg: &SamplerConfig,
    scope: TargetScope,
    discovered_args: &[String],
) -> Result<Vec<String>, SupervisorError> {
    let mmap_pages = if cfg.is_dwarf { MMAP_PAGES_DWARF } else { MMAP_PAGES_FP };
    let mut argv = vec![
        cfg.perf_path.to_string_lossy().to_string(),
        "record".to_string(),
        "-F".to_string(),
        cfg.frequency_hz.to_string(),
        "-g".to_string(),
        "-o".to_string(),
        cfg.output_path.to_string_lossy().to_string(),
        format!("--switch-output={}s,signal", cfg.switch_timeout_secs),
        "--switch-max-files=1".to_string(),
        "-m".to_string(),
        mmap_pages.to_string(),
    ];

    if scope == TargetScope::Cgroups && cfg.extra_args.is_empty() {
        for _ in &cfg.cgroup_names {
            argv.push("-e".to_string());
            argv.push("cycles".to_string());
        }
    } else if cfg.extra_args.is_empty() {
        argv.extend(discovered_args.iter().cloned());
    }
    argv.extend(cfg.extra_args.iter().cloned());

    match scope {
        TargetScope::Pids => {
            let pids = cfg
                .pids
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(",");
            argv.push("--pid".to_string());
            argv.push(pids);
        }
        TargetScope::Cgroups => {
            if cfg.cgroup_names.is_empty() {
                return Err(SupervisorError::NoCgroupsFound);
            }
            argv.push("-a".to_string());
            argv.push("-G".to_string());
            argv.push(cfg.cgroup_names.join(","));
        }
        TargetScope::SystemWide => {
            argv.push("-a".to_string());
        }
    }

    if cfg.inject_jit {
        argv.push("-k".to_string());
        argv.push("1".to_string());
    }

    Ok(argv)
}

pub struct SamplerSupervisor {
    registry: std::sync::Arc<ProcessRegistry>,
    cfg: SamplerConfig,
    scope: TargetScope,
    state: Mutex<SamplerState>,
    handle: Mutex<Option<Handle>>,
    started_at: Mutex<Option<Instant>>,
    /// The event-family args picked by `discover_appropriate_perf_event`,
    /// cached after the first `start()` so later restarts don't re-probe.
    discovered_extra_args: Mutex<Option<Vec<String>>>,
    /// Set once discovery exhausted every event family without a usable
    /// result. The supervisor still starts with the default event; callers
    /// should treat this cycle's (and subsequent empty cycles') output as
    /// expected rather than a fresh failure.
    known_broken: AtomicBool,
}

impl SamplerSupervisor {
    pub fn new(
        registry: std::sync::Arc<ProcessRegistry>,
        cfg: SamplerConfig,
        scope: TargetScope,
    ) -> Self {
        SamplerSupervisor {
            registry,
            cfg,
            scope,
            state: Mutex::new(SamplerState::Init),
            handle: Mutex::new(None),
            started_at: Mutex::new(None),
            discovered_extra_args: Mutex::new(None),
            known_broken: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SamplerState {
        *self.state.lock().unwrap()
    }

    /// `true` once event-type discovery has exhausted every family without
    /// finding one that produces samples. The sampler still runs with the
    /// default event; this just means empty cycles are expected, not a bug.
    pub fn is_known_broken(&self) -> bool {
        self.known_broken.load(Ordering::Relaxed)
    }

    /// Starts the kernel sampler. Never falls back to system-wide sampling
    /// if cgroup scoping was requested and no cgroups were eligible: that
    /// is a hard refusal, surfaced to the caller.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        if self.scope == TargetScope::Cgroups && self.cfg.cgroup_names.is_empty() {
            return Err(SupervisorError::NoCgroupsFound);
        }

        let needs_discovery = self.discovered_extra_args.lock().unwrap().is_none();
        if needs_discovery {
            let probe_dir = self
                .cfg
                .output_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(std::env::temp_dir);
            let event = discover_appropriate_perf_event(&self.registry, &self.cfg.perf_path, &probe_dir)
                .await
                .unwrap_or_else(|e| {
                    warn!("[sampler] {e}, falling back to the default event; subsequent empty cycles are expected");
                    self.known_broken.store(true, Ordering::Relaxed);
                    SupportedPerfEvent::Default
                });
            let mut discovered = self.discovered_extra_args.lock().unwrap();
            if discovered.is_none() {
                *discovered = Some(event.extra_args());
            }
        }
        let extra_args = self.discovered_extra_args.lock().unwrap().clone().unwrap_or_default();

        let _ = std::fs::remove_file(&self.cfg.output_path);

        let argv = build_argv(&self.cfg, self.scope, &extra_args)?;
        let mut opts = SpawnOpts::new("kernel-sampler", &argv);
        opts.stdout = Stdio::null();
        let handle = self.registry.spawn(opts).map_err(|e| {
            let msg = e.to_string();
            if is_pid_related_error(&msg) {
                warn!("[sampler] start failed, target processes may have exited: {msg}");
            } else {
                warn!("[sampler] start failed: {msg}");
            }
            SupervisorError::Io(std::io::Error::other(msg))
        })?;

        if let Some(stderr) = self.registry.take_stderr(handle) {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("[sampler] kernel sampler stderr: {line}");
                }
            });
        }

        let deadline = Instant::now() + DUMP_TIMEOUT;
        loop {
            if self.cfg.output_path.exists() {
                break;
            }
            if Instant::now() >= deadline {
                self.registry.send_signal(handle, Signal::SIGKILL);
                self.registry.reap_exited();
                return Err(SupervisorError::StartTimeout {
                    secs: DUMP_TIMEOUT.as_secs(),
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        *self.handle.lock().unwrap() = Some(handle);
        *self.started_at.lock().unwrap() = Some(Instant::now());
        *self.state.lock().unwrap() = SamplerState::Started;
        info!("[sampler] started (handle={handle})");
        Ok(())
    }

    pub async fn stop(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(h) = handle {
            self.registry.send_signal(h, Signal::SIGTERM);
            self.registry.wait(h).await;
        }
        *self.state.lock().unwrap() = SamplerState::Stopped;
        *self.started_at.lock().unwrap() = None;
    }

    pub fn is_running(&self) -> bool {
        match *self.handle.lock().unwrap() {
            Some(h) => self.registry.state(h) == Some(ProcessState::Running),
            None => false,
        }
    }

    /// Removes any stale rotated output before signalling so the caller can
    /// unambiguously find the newly rotated file, then sends the rotation
    /// signal.
    pub fn switch_output(&self) {
        if let Some(parent) = self.cfg.output_path.parent() {
            let stem = self.cfg.output_path.file_name().and_then(|n| n.to_str());
            if let (Ok(entries), Some(stem)) = (std::fs::read_dir(parent), stem) {
                for entry in entries.flatten() {
                    if entry
                        .file_name()
                        .to_str()
                        .is_some_and(|n| n.starts_with(stem) && n != stem)
                    {
                        let _ = std::fs::remove_file(entry.path());
                    }
                }
            }
        }
        if let Some(h) = *self.handle.lock().unwrap() {
            self.registry.send_signal(h, Signal::SIGUSR2);
            *self.state.lock().unwrap() = SamplerState::Dumped;
        }
    }

    pub fn mark_switched(&self) {
        *self.state.lock().unwrap() = SamplerState::Switched;
    }

    /// Restarts if the child is no longer running, or if it has exceeded
    /// both the minimum uptime and the RSS threshold.
    pub async fn restart_if_needed(&self) -> Result<bool, SupervisorError> {
        if !self.is_running() {
            warn!("[sampler] child unexpectedly exited, restarting");
            self.stop().await;
            self.start().await?;
            return Ok(true);
        }

        let elapsed = self.started_at.lock().unwrap().map(|t| t.elapsed());
        let pid = self.handle.lock().unwrap().and_then(|h| self.registry.pid(h));
        if let (Some(elapsed), Some(pid)) = (elapsed, pid) {
            if elapsed >= RESTART_AFTER {
                if let Some(rss) = read_rss_bytes(pid)
                    && rss >= PERF_MEMORY_THRESHOLD_BYTES
                {
                    warn!(
                        "[sampler] rss {rss} bytes exceeds threshold after {}s uptime, restarting",
                        elapsed.as_secs()
                    );
                    self.stop().await;
                    self.start().await?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Spawns `perf script` against the current output file and streams its
    /// stdout line by line without buffering the whole output in memory.
    pub async fn stream_script(&self) -> Result<tokio::sync::mpsc::Receiver<String>, SupervisorError> {
        let deadline = Instant::now() + DUMP_TIMEOUT;
        loop {
            if rotated_file_exists(&self.cfg.output_path) {
                break;
            }
            if Instant::now() >= deadline {
                return Err(SupervisorError::StartTimeout {
                    secs: DUMP_TIMEOUT.as_secs(),
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut cmd = Command::new(&self.cfg.perf_path);
        cmd.arg("script")
            .arg("-F")
            .arg("+pid")
            .arg("-i")
            .arg(&self.cfg.output_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(SupervisorError::Io)?;
        let stdout = child.stdout.take().expect("stdout was piped");
        let (tx, rx) = tokio::sync::mpsc::channel(1024);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            let status = child.wait().await;
            if let Ok(status) = status
                && !status.success()
            {
                warn!("[sampler] perf script exited with {status}");
            }
        });

        Ok(rx)
    }
}

fn rotated_file_exists(output_path: &Path) -> bool {
    let Some(parent) = output_path.parent() else {
        return false;
    };
    let Some(stem) = output_path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    std::fs::read_dir(parent)
        .map(|mut entries| {
            entries.any(|e| {
                e.ok()
                    .and_then(|e| e.file_name().into_string().ok())
                    .is_some_and(|n| n.starts_with(stem) && n != stem)
            })
        })
        .unwrap_or(false)
}

fn read_rss_bytes(pid: i32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}
