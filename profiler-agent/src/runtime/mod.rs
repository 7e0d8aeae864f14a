// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Per-runtime sampler contract. One capability set — `enumerate`,
//! `should_skip`, `argv` — implemented by a tagged variant per runtime; the
//! scheduler is the only code that dispatches on the variant.

pub mod python;
pub mod ruby;

use std::path::Path;
use std::time::Duration;

use crate::parser::StackToSampleCount;

/// One target process's profiling result for a single cycle. A target that
/// failed carries a synthetic `error;<what>;<reason>;<comm>` stack instead
/// of aborting the cycle.
#[derive(Debug, Clone, Default)]
pub struct ProfileData {
    pub samples: StackToSampleCount,
    pub app_id: Option<String>,
    pub container_name: Option<String>,
}

pub trait RuntimeSampler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Candidate pids for this runtime, found by walking `/proc`.
    fn enumerate_candidates(&self) -> Vec<i32>;

    /// `true` if `pid` should not be profiled this cycle (too young, self,
    /// embeds rather than is the runtime, etc).
    fn should_skip(&self, pid: i32) -> bool;

    /// The external sampler's argv for profiling `pid` for `duration`,
    /// writing collapsed output to `output_path`.
    fn argv(&self, pid: i32, duration: Duration, output_path: &Path) -> Vec<String>;

    /// System-wide samplers (kernel sampler, eBPF) do not respect the
    /// per-cycle process cap; runtime samplers do.
    fn is_system_wide(&self) -> bool {
        false
    }
}

pub mod generic {
    use super::*;

    /// A runtime sampler driven entirely by configuration, used for
    /// languages whose external tool just needs a pid + duration + output
    /// path and a basename match to find candidates.
    pub struct GenericRuntimeSampler {
        pub name: &'static str,
        pub tool_path: String,
        pub basenames: Vec<&'static str>,
        pub min_age_secs: f64,
        pub extra_args: Vec<String>,
    }

    impl RuntimeSampler for GenericRuntimeSampler {
        fn name(&self) -> &'static str {
            self.name
        }

        fn enumerate_candidates(&self) -> Vec<i32> {
            crate::procfs::list_pids()
                .into_iter()
                .filter(|&pid| {
                    crate::procfs::comm(pid)
                        .map(|c| self.basenames.iter().any(|b| c.contains(b)))
                        .unwrap_or(false)
                })
                .collect()
        }

        fn should_skip(&self, pid: i32) -> bool {
            if pid == std::process::id() as i32 {
                return true;
            }
            crate::procfs::process_age_secs(pid) < self.min_age_secs
        }

        fn argv(&self, pid: i32, duration: Duration, output_path: &Path) -> Vec<String> {
            let mut argv = vec![self.tool_path.clone()];
            argv.extend(self.extra_args.iter().cloned());
            argv.push("--pid".to_string());
            argv.push(pid.to_string());
            argv.push("--duration".to_string());
            argv.push(duration.as_secs().to_string());
            argv.push("--output".to_string());
            argv.push(output_path.to_string_lossy().to_string());
            argv
        }
    }
}
