// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::path::Path;
use std::time::Duration;

use super::RuntimeSampler;

const MIN_PROCESS_AGE_SECS: f64 = 1.0;

/// Wraps an external `rbspy`-compatible sampler.
pub struct RubySampler {
    pub tool_path: String,
}

impl RuntimeSampler for RubySampler {
    fn name(&self) -> &'static str {
        "ruby"
    }

    fn enumerate_candidates(&self) -> Vec<i32> {
        crate::procfs::list_pids()
            .into_iter()
            .filter(|&pid| {
                crate::procfs::comm(pid)
                    .map(|c| c.starts_with("ruby") || c.starts_with("puma"))
                    .unwrap_or(false)
            })
            .collect()
    }

    fn should_skip(&self, pid: i32) -> bool {
        if pid == std::process::id() as i32 {
            return true;
        }
        crate::procfs::process_age_secs(pid) < MIN_PROCESS_AGE_SECS
    }

    fn argv(&self, pid: i32, duration: Duration, output_path: &Path) -> Vec<String> {
        vec![
            self.tool_path.clone(),
            "record".to_string(),
            "--pid".to_string(),
            pid.to_string(),
            "--duration".to_string(),
            duration.as_secs().to_string(),
            "--file".to_string(),
            output_path.to_string_lossy().to_string(),
            "--raw".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_uses_rbspy_flag_names() {
        let sampler = RubySampler {
            tool_path: "/usr/bin/rbspy".to_string(),
        };
        let argv = sampler.argv(42, Duration::from_secs(15), Path::new("/tmp/r.raw"));
        assert!(argv.contains(&"--file".to_string()));
        assert!(argv.contains(&"--raw".to_string()));
        assert!(argv.contains(&"42".to_string()));
    }
}
