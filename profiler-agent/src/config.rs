// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! On-disk agent configuration plus the collector-supplied per-command
//! config schema (`combined_config`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_duration() -> u64 {
    60
}

fn default_frequency() -> u32 {
    11
}

fn default_spark_port() -> u16 {
    12345
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Static, on-disk agent configuration. Loaded once at startup; the
/// collector drives everything else dynamically via `CombinedConfig`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub collector_url: String,
    #[serde(default)]
    pub server_token: Option<String>,
    pub service_name: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_duration")]
    pub default_duration_secs: u64,
    #[serde(default = "default_frequency")]
    pub default_frequency_hz: u32,
    #[serde(default = "default_spark_port")]
    pub spark_port: u16,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub temp_root: Option<PathBuf>,
}

/// Returns the config path: `AGENT_CONFIG` env override, else a fixed
/// system default.
pub fn config_path() -> PathBuf {
    std::env::var("AGENT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/profiler-agent/config.yaml"))
}

pub fn load_config(path: &Path) -> Result<AgentConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading agent config: {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing agent config: {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfilingMode {
    Cpu,
    Allocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerfMode {
    EnabledRestricted,
    EnabledAggressive,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimpleMode {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PySpyMode {
    Enabled,
    EnabledFallback,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncProfilerTime {
    Cpu,
    Wall,
}

/// `async_profiler`'s config accepts either the structured
/// `{enabled, time}` form or a legacy bare `"enabled"`/`"disabled"` string;
/// both deserialize to the same value.
#[derive(Debug, Clone, Copy)]
pub struct AsyncProfilerConfig {
    pub enabled: bool,
    pub time: AsyncProfilerTime,
}

impl<'de> Deserialize<'de> for AsyncProfilerConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Legacy(String),
            Structured {
                enabled: bool,
                #[serde(default)]
                time: Option<String>,
            },
        }
        let raw = Raw::deserialize(deserializer)?;
        Ok(match raw {
            Raw::Legacy(s) => AsyncProfilerConfig {
                enabled: s == "enabled",
                time: AsyncProfilerTime::Cpu,
            },
            Raw::Structured { enabled, time } => AsyncProfilerConfig {
                enabled,
                time: match time.as_deref() {
                    Some("wall") => AsyncProfilerTime::Wall,
                    _ => AsyncProfilerTime::Cpu,
                },
            },
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfilerConfigs {
    pub perf: Option<PerfMode>,
    pub pyperf: Option<SimpleMode>,
    pub pyspy: Option<PySpyMode>,
    pub async_profiler: Option<AsyncProfilerConfig>,
    pub phpspy: Option<SimpleMode>,
    pub rbspy: Option<SimpleMode>,
    pub dotnet_trace: Option<SimpleMode>,
    pub nodejs_perf: Option<SimpleMode>,
}

/// The wire schema of `profiling_command.combined_config`. Unknown keys are
/// ignored by `serde` rather than rejected, since the collector may add
/// fields an older agent build does not understand.
#[derive(Debug, Clone, Deserialize)]
pub struct CombinedConfig {
    #[serde(default = "default_duration")]
    pub duration: u64,
    #[serde(default = "default_frequency")]
    pub frequency: u32,
    #[serde(default)]
    pub profiling_mode: Option<ProfilingMode>,
    #[serde(default)]
    pub target_hostnames: Vec<String>,
    #[serde(default)]
    pub pids: Vec<i32>,
    #[serde(default)]
    pub continuous: bool,
    #[serde(default)]
    pub enable_perfspect: bool,
    #[serde(default)]
    pub max_processes: Option<usize>,
    #[serde(default)]
    pub profiler_configs: ProfilerConfigs,
    /// When set, requests the distinct cgroup-enumeration mode: instead of
    /// sampling the whole host, the kernel sampler scopes to the top-N
    /// cgroups by resource usage (`N` is this value).
    #[serde(default)]
    pub max_docker_containers: Option<usize>,
}

impl CombinedConfig {
    /// `true` if this command targets every host or explicitly names
    /// `hostname`.
    pub fn targets_host(&self, hostname: &str) -> bool {
        self.target_hostnames.is_empty() || self.target_hostnames.iter().any(|h| h == hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_agent_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "collector_url: https://collector.example\nservice_name: myapp\n",
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.heartbeat_interval_secs, 30);
        assert_eq!(cfg.default_frequency_hz, 11);
        assert!(cfg.verify_tls);
    }

    #[test]
    fn missing_config_file_errors() {
        assert!(load_config(Path::new("/nonexistent/config.yaml")).is_err());
    }

    #[test]
    fn async_profiler_accepts_legacy_string_form() {
        let json = r#"{"perf": null, "async_profiler": "enabled"}"#;
        let pc: ProfilerConfigs = serde_json::from_str(json).unwrap();
        let ap = pc.async_profiler.unwrap();
        assert!(ap.enabled);
        assert!(matches!(ap.time, AsyncProfilerTime::Cpu));
    }

    #[test]
    fn async_profiler_accepts_structured_form() {
        let json = r#"{"async_profiler": {"enabled": true, "time": "wall"}}"#;
        let pc: ProfilerConfigs = serde_json::from_str(json).unwrap();
        let ap = pc.async_profiler.unwrap();
        assert!(ap.enabled);
        assert!(matches!(ap.time, AsyncProfilerTime::Wall));
    }

    #[test]
    fn combined_config_ignores_unknown_keys() {
        let json = r#"{"duration": 30, "frequency": 99, "totally_unknown_field": 1}"#;
        let cc: CombinedConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cc.duration, 30);
        assert_eq!(cc.frequency, 99);
    }

    #[test]
    fn targets_host_empty_list_means_all_hosts() {
        let cc = CombinedConfig {
            duration: 1,
            frequency: 1,
            profiling_mode: None,
            target_hostnames: vec![],
            pids: vec![],
            continuous: false,
            enable_perfspect: false,
            max_processes: None,
            profiler_configs: ProfilerConfigs::default(),
            max_docker_containers: None,
        };
        assert!(cc.targets_host("anything"));
    }

    #[test]
    fn targets_host_respects_explicit_list() {
        let mut cc = CombinedConfig {
            duration: 1,
            frequency: 1,
            profiling_mode: None,
            target_hostnames: vec!["host-a".to_string()],
            pids: vec![],
            continuous: false,
            enable_perfspect: false,
            max_processes: None,
            profiler_configs: ProfilerConfigs::default(),
            max_docker_containers: None,
        };
        assert!(cc.targets_host("host-a"));
        assert!(!cc.targets_host("host-b"));
        cc.target_hostnames.push("host-b".to_string());
        assert!(cc.targets_host("host-b"));
    }
}
