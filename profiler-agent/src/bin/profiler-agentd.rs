// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::sync::watch;

use profiler_agent::command::CommandScheduler;
use profiler_agent::config::{self, AgentConfig};
use profiler_agent::lifecycle::{HeartbeatLoop, LifecycleManager};
use profiler_agent::registry::ProcessRegistry;
use profiler_agent::runtime::RuntimeSampler;
use profiler_agent::runtime::python::PythonSampler;
use profiler_agent::runtime::ruby::RubySampler;
use profiler_agent::spark::{self, SparkRegistry};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "profiler-agentd")]
#[command(about = "Host-resident continuous profiling agent", long_about = None)]
struct Args {
    /// Path to the agent's YAML config file.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<String>,

    /// Run a single profiling cycle against the default config, then exit.
    #[arg(long)]
    one_shot: bool,

    #[arg(long)]
    version: bool,
}

fn build_runtimes() -> Vec<Arc<dyn RuntimeSampler>> {
    vec![
        Arc::new(PythonSampler {
            tool_path: "/usr/bin/py-spy".to_string(),
        }),
        Arc::new(RubySampler {
            tool_path: "/usr/bin/rbspy".to_string(),
        }),
    ]
}

async fn run(cfg: AgentConfig, one_shot: bool) -> Result<()> {
    let registry = Arc::new(ProcessRegistry::new());
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string());
    let temp_root = cfg
        .temp_root
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    std::fs::create_dir_all(&temp_root).context("creating agent temp root")?;

    let lifecycle = Arc::new(LifecycleManager::new(
        registry.clone(),
        hostname,
        temp_root,
        build_runtimes(),
    ));
    let scheduler = Arc::new(CommandScheduler::new());

    let spark_registry = Arc::new(SparkRegistry::new());
    let spark_addr: SocketAddr = ([127, 0, 0, 1], cfg.spark_port).into();
    let (stop_tx, stop_rx) = watch::channel(false);

    let spark_task = tokio::spawn(spark::serve(spark_registry.clone(), spark_addr));
    let cleanup_task = tokio::spawn(spark::run_cleanup_loop(spark_registry.clone(), stop_rx.clone()));

    if one_shot {
        info!("[main] running a single profiling cycle (--one-shot)");
        let combined = profiler_agent::config::CombinedConfig {
            duration: cfg.default_duration_secs,
            frequency: cfg.default_frequency_hz,
            profiling_mode: None,
            target_hostnames: vec![],
            pids: vec![],
            continuous: false,
            enable_perfspect: false,
            max_processes: None,
            profiler_configs: Default::default(),
            max_docker_containers: None,
        };
        lifecycle.start(combined).await?;
        tokio::time::sleep(Duration::from_secs(cfg.default_duration_secs)).await;
        lifecycle.stop().await;
    } else {
        let heartbeat = HeartbeatLoop::new(&cfg, lifecycle.clone(), scheduler.clone());
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?;

        tokio::select! {
            _ = heartbeat.run(stop_rx.clone()) => {}
            _ = sigterm.recv() => {
                info!("[main] received SIGTERM, shutting down");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("[main] received SIGINT, shutting down");
            }
        }
    }

    let _ = stop_tx.send(true);
    lifecycle.stop().await;
    registry.terminate_all(SHUTDOWN_GRACE).await;
    spark_task.abort();
    cleanup_task.abort();
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        println!("profiler-agentd {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let level = args
        .log_level
        .as_deref()
        .map(agent_log::level_from_str)
        .unwrap_or_else(|| {
            std::env::var("AGENT_LOG_LEVEL")
                .ok()
                .map(|s| agent_log::level_from_str(&s))
                .unwrap_or(log::Level::Info)
        });
    agent_log::init_with_level(level);

    let config_path = args.config.unwrap_or_else(config::config_path);
    let cfg = config::load_config(&config_path)
        .with_context(|| format!("loading agent config from {}", config_path.display()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let result = runtime.block_on(run(cfg, args.one_shot));
    if let Err(e) = &result {
        warn!("[main] exiting with error: {e}");
    }
    result
}
