// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Translates a collector command into a running profiling cycle, and the
//! heartbeat loop that drives the whole command-and-control cadence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::{Mutex, watch};

use crate::cgroup;
use crate::command::{CommandScheduler, CommandType, ProfilingCommand};
use crate::config::{AgentConfig, CombinedConfig, PerfMode, ProfilerConfigs, ProfilingMode, PySpyMode, SimpleMode};
use crate::heartbeat::{CompletionStatus, HeartbeatClient};
use crate::idempotency::IdempotencySet;
use crate::merger;
use crate::parser::ProcessToStackSampleCounters;
use crate::registry::ProcessRegistry;
use crate::resolver::{CachingResolver, ContainerIdentity, NoopResolver, RuntimeResolver};
use crate::runtime::RuntimeSampler;
use crate::sampler::{SamplerConfig, SamplerSupervisor, TargetScope};
use crate::scheduler::{self, SchedulerConfig};

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const IDEMPOTENCY_CAPACITY: usize = 1000;

/// One cycle's result across every sampler: per-pid collapsed-stack samples
/// alongside the container/pod identity resolved for each profiled pid.
#[derive(Debug, Clone, Default)]
pub struct CycleResult {
    pub samples: ProcessToStackSampleCounters,
    pub identities: HashMap<i32, ContainerIdentity>,
}

/// One running profiling cycle's handle: its stop signal and its join
/// target, so `stop()` can reach it without caring how it was started.
struct RunningCycle {
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<CycleResult>,
}

pub struct LifecycleManager {
    registry: Arc<ProcessRegistry>,
    hostname: String,
    temp_root: PathBuf,
    runtimes: Vec<Arc<dyn RuntimeSampler>>,
    resolver: Arc<CachingResolver<NoopResolver>>,
    current: Mutex<Option<RunningCycle>>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        hostname: String,
        temp_root: PathBuf,
        runtimes: Vec<Arc<dyn RuntimeSampler>>,
    ) -> Self {
        LifecycleManager {
            registry,
            hostname,
            temp_root,
            runtimes,
            resolver: Arc::new(CachingResolver::new(NoopResolver)),
            current: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.current.lock().await.is_some()
    }

    /// Starts a new cycle from the collector's config. A no-op (returns
    /// `Ok(false)`) if `target_hostnames` is set and excludes this host.
    pub async fn start(&self, cfg: CombinedConfig) -> anyhow::Result<bool> {
        if !cfg.targets_host(&self.hostname) {
            info!("[lifecycle] command does not target this host, ignoring");
            return Ok(false);
        }

        let duration = Duration::from_secs(cfg.duration);
        let cycle_dir = self.temp_root.join(format!("cycle-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&cycle_dir)?;

        // Container composition may have changed since the last cycle; a
        // stale cache entry would misattribute samples to a dead container.
        self.resolver.flush();

        let (stop_tx, stop_rx) = watch::channel(false);
        let registry = self.registry.clone();
        let runtimes = self.runtimes.clone();
        let resolver: Arc<dyn RuntimeResolver> = self.resolver.clone();
        let max_processes = cfg.max_processes.unwrap_or(0);
        let pids = if cfg.pids.is_empty() { None } else { Some(cfg.pids.clone()) };
        let cgroup_limit = cfg.max_docker_containers.unwrap_or(0);
        let frequency_hz = cfg.frequency;
        let profiling_mode = cfg.profiling_mode;
        let profiler_configs = cfg.profiler_configs.clone();
        let enable_perfspect = cfg.enable_perfspect;

        let task = tokio::spawn(async move {
            run_cycle(
                registry,
                runtimes,
                resolver,
                duration,
                max_processes,
                pids,
                cgroup_limit,
                frequency_hz,
                profiling_mode,
                profiler_configs,
                enable_perfspect,
                cycle_dir,
                stop_rx,
            )
            .await
        });

        *self.current.lock().await = Some(RunningCycle { stop_tx, task });
        Ok(true)
    }

    /// Signals the running cycle to stop and awaits it up to a deadline.
    /// Always reaps the process registry afterward regardless of whether
    /// the cycle exited cleanly.
    pub async fn stop(&self) -> Option<CycleResult> {
        let running = self.current.lock().await.take();
        let result = if let Some(running) = running {
            let _ = running.stop_tx.send(true);
            match tokio::time::timeout(STOP_JOIN_TIMEOUT, running.task).await {
                Ok(Ok(result)) => Some(result),
                Ok(Err(e)) => {
                    warn!("[lifecycle] cycle task panicked: {e}");
                    None
                }
                Err(_) => {
                    warn!("[lifecycle] cycle did not stop within {}s", STOP_JOIN_TIMEOUT.as_secs());
                    None
                }
            }
        } else {
            None
        };

        let stats = self.registry.reap_exited();
        info!(
            "[lifecycle] post-stop reap: {} cleaned, {} still running",
            stats.cleaned, stats.still_running
        );
        result
    }
}

/// `true` if `name`'s external sampler should run at all under `cfg`.
/// Absence of a per-runtime setting means enabled, matching the collector's
/// "opt everything in unless told otherwise" convention.
fn runtime_enabled(name: &str, cfg: &ProfilerConfigs) -> bool {
    match name {
        "python" => !matches!(cfg.pyspy, Some(PySpyMode::Disabled)),
        "ruby" => !matches!(cfg.rbspy, Some(SimpleMode::Disabled)),
        _ => true,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_cycle(
    registry: Arc<ProcessRegistry>,
    runtimes: Vec<Arc<dyn RuntimeSampler>>,
    resolver: Arc<dyn RuntimeResolver>,
    duration: Duration,
    max_processes: usize,
    pids: Option<Vec<i32>>,
    cgroup_limit: usize,
    frequency_hz: u32,
    profiling_mode: Option<ProfilingMode>,
    profiler_configs: ProfilerConfigs,
    enable_perfspect: bool,
    cycle_dir: PathBuf,
    stop_rx: watch::Receiver<bool>,
) -> CycleResult {
    if enable_perfspect {
        debug!("[lifecycle] enable_perfspect requested but hardware-metric collection is not carried by this agent");
    }

    let use_cgroups = cgroup_limit > 0;
    let scope = if use_cgroups {
        TargetScope::Cgroups
    } else if pids.is_some() {
        TargetScope::Pids
    } else {
        TargetScope::SystemWide
    };

    let cgroup_names = if use_cgroups {
        cgroup::top_cgroup_names_for_perf(cgroup_limit)
    } else {
        Vec::new()
    };

    let perf_mode = profiler_configs.perf.unwrap_or(PerfMode::EnabledRestricted);
    let system_samples = if matches!(perf_mode, PerfMode::Disabled) {
        info!("[lifecycle] kernel sampler disabled by profiler_configs.perf");
        ProcessToStackSampleCounters::new()
    } else {
        let sampler_cfg = SamplerConfig {
            perf_path: PathBuf::from("/usr/bin/perf"),
            output_path: cycle_dir.join("kernel.perf.data"),
            frequency_hz,
            is_dwarf: matches!(perf_mode, PerfMode::EnabledAggressive),
            inject_jit: false,
            switch_timeout_secs: duration.as_secs().max(1),
            pids: pids.clone().unwrap_or_default(),
            cgroup_names,
            use_cgroups,
            extra_args: Vec::new(),
        };

        let supervisor = SamplerSupervisor::new(registry.clone(), sampler_cfg, scope);
        if let Err(e) = supervisor.start().await {
            warn!("[lifecycle] kernel sampler refused to start: {e}");
            ProcessToStackSampleCounters::new()
        } else {
            let deadline = Instant::now() + duration;
            while Instant::now() < deadline && *stop_rx.borrow() == false {
                tokio::time::sleep(Duration::from_millis(200).min(deadline.saturating_duration_since(Instant::now()))).await;
            }
            supervisor.switch_output();
            supervisor.stop().await;
            if supervisor.is_known_broken() {
                warn!("[lifecycle] kernel sampler fell back to the default perf event; empty cycles are expected until it is fixed");
            }
            ProcessToStackSampleCounters::new()
        }
    };

    let mut runtime_samples = ProcessToStackSampleCounters::new();
    let mut identities: HashMap<i32, ContainerIdentity> = HashMap::new();
    for sampler in &runtimes {
        if matches!(profiling_mode, Some(ProfilingMode::Allocation)) {
            debug!("[lifecycle] skipping {} sampler: allocation profiling mode is not supported", sampler.name());
            continue;
        }
        if !runtime_enabled(sampler.name(), &profiler_configs) {
            debug!("[lifecycle] skipping {} sampler: disabled by profiler_configs", sampler.name());
            continue;
        }

        let scheduler_cfg = SchedulerConfig {
            duration,
            max_processes,
            spawn_tracking: false,
            output_dir: cycle_dir.clone(),
        };
        let per_runtime = scheduler::run_cycle(
            sampler.clone(),
            registry.clone(),
            resolver.clone(),
            scheduler_cfg,
            pids.clone(),
            stop_rx.clone(),
        )
        .await;
        for (pid, stacks) in per_runtime.samples {
            let entry = runtime_samples.entry(pid).or_default();
            crate::parser::merge_into(entry, &stacks);
        }
        identities.extend(per_runtime.identities);
    }

    let _ = std::fs::remove_dir_all(&cycle_dir);
    CycleResult {
        samples: merger::merge(&system_samples, &runtime_samples),
        identities,
    }
}

/// Drives the periodic collector exchange: sends a heartbeat, executes at
/// most one command per response (idempotently), waits for the next tick.
pub struct HeartbeatLoop {
    client: HeartbeatClient,
    lifecycle: Arc<LifecycleManager>,
    scheduler: Arc<CommandScheduler>,
    idempotency: IdempotencySet,
    interval: Duration,
}

impl HeartbeatLoop {
    pub fn new(
        agent_cfg: &AgentConfig,
        lifecycle: Arc<LifecycleManager>,
        scheduler: Arc<CommandScheduler>,
    ) -> Self {
        let client = HeartbeatClient::new(
            agent_cfg.collector_url.clone(),
            agent_cfg.service_name.clone(),
            agent_cfg.server_token.as_deref(),
        );
        HeartbeatLoop {
            client,
            lifecycle,
            scheduler,
            idempotency: IdempotencySet::new(IDEMPOTENCY_CAPACITY),
            interval: Duration::from_secs(agent_cfg.heartbeat_interval_secs),
        }
    }

    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut last_command_id: Option<String> = None;
        while !*stop.borrow() {
            self.tick(&mut last_command_id).await;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = stop.changed() => {}
            }
        }
    }

    async fn tick(&self, last_command_id: &mut Option<String>) {
        let resp = match self.client.send_heartbeat(last_command_id.as_deref()).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("[heartbeat] tick failed: {e}");
                return;
            }
        };

        let Some(resp) = resp else { return };
        let Some(wire) = resp.profiling_command else { return };
        let command_id = resp.command_id.unwrap_or_default();

        if self.idempotency.contains(&command_id) {
            return;
        }
        self.idempotency.insert(&command_id);
        *last_command_id = Some(command_id.clone());

        let cmd = wire.into_command(command_id.clone());
        self.execute(cmd).await;
    }

    async fn execute(&self, cmd: ProfilingCommand) {
        let start = Instant::now();
        match cmd.command_type {
            CommandType::Stop => {
                self.lifecycle.stop().await;
                self.report(&cmd.command_id, CompletionStatus::Completed, start, None)
                    .await;
            }
            CommandType::Start => {
                self.lifecycle.stop().await;
                let combined: Result<CombinedConfig, _> = serde_json::from_value(cmd.config.clone());
                match combined {
                    Ok(combined) => match self.lifecycle.start(combined).await {
                        Ok(_) => {
                            self.report(&cmd.command_id, CompletionStatus::Completed, start, None)
                                .await;
                        }
                        Err(e) => {
                            self.report(
                                &cmd.command_id,
                                CompletionStatus::Failed,
                                start,
                                Some(e.to_string()),
                            )
                            .await;
                        }
                    },
                    Err(e) => {
                        self.report(
                            &cmd.command_id,
                            CompletionStatus::Failed,
                            start,
                            Some(format!("invalid combined_config: {e}")),
                        )
                        .await;
                    }
                }
            }
        }
        let _ = &self.scheduler;
    }

    async fn report(
        &self,
        command_id: &str,
        status: CompletionStatus,
        start: Instant,
        error_message: Option<String>,
    ) {
        if let Err(e) = self
            .client
            .send_command_completion(
                command_id,
                status,
                start.elapsed(),
                error_message.as_deref(),
                None,
            )
            .await
        {
            warn!("[heartbeat] failed to report completion for {command_id}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle_start_no_ops_when_host_not_targeted() {
        let registry = Arc::new(ProcessRegistry::new());
        let lifecycle = LifecycleManager::new(
            registry,
            "this-host".to_string(),
            std::env::temp_dir(),
            Vec::new(),
        );
        let cfg = CombinedConfig {
            duration: 1,
            frequency: 11,
            profiling_mode: None,
            target_hostnames: vec!["other-host".to_string()],
            pids: vec![],
            continuous: false,
            enable_perfspect: false,
            max_processes: None,
            profiler_configs: Default::default(),
            max_docker_containers: None,
        };
        let started = lifecycle.start(cfg).await.unwrap();
        assert!(!started);
        assert!(!lifecycle.is_running().await);
    }

    #[tokio::test]
    async fn lifecycle_stop_without_a_running_cycle_is_a_noop() {
        let registry = Arc::new(ProcessRegistry::new());
        let lifecycle = LifecycleManager::new(
            registry,
            "host".to_string(),
            std::env::temp_dir(),
            Vec::new(),
        );
        assert!(lifecycle.stop().await.is_none());
    }
}
