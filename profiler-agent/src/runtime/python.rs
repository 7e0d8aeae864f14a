// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use std::path::Path;
use std::time::Duration;

use super::RuntimeSampler;

const MIN_PROCESS_AGE_SECS: f64 = 1.0;

/// Wraps an external `py-spy`-compatible sampler. Candidate selection
/// matches either the interpreter basename or a `gunicorn`/`celery`-style
/// rewritten cmdline, since those processes replace argv\[0\] with a
/// descriptive string instead of keeping `python` visible.
pub struct PythonSampler {
    pub tool_path: String,
}

impl RuntimeSampler for PythonSampler {
    fn name(&self) -> &'static str {
        "python"
    }

    fn enumerate_candidates(&self) -> Vec<i32> {
        crate::procfs::list_pids()
            .into_iter()
            .filter(|&pid| is_python_process(pid))
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
            "--output".to_string(),
            output_path.to_string_lossy().to_string(),
            "--format".to_string(),
            "raw".to_string(),
            "--nonblocking".to_string(),
        ]
    }
}

fn is_python_process(pid: i32) -> bool {
    if let Ok(comm) = crate::procfs::comm(pid)
        && comm.starts_with("python")
    {
        return true;
    }
    if let Ok(cmdline) = crate::procfs::Cmdline::get(pid) {
        let mut args = cmdline.args();
        if let Some(first) = args.next() {
            let basename = first.rsplit('/').next().unwrap_or(first);
            if basename.starts_with("python") || basename.starts_with("gunicorn") {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_excludes_self() {
        let sampler = PythonSampler {
            tool_path: "py-spy".to_string(),
        };
        assert!(sampler.should_skip(std::process::id() as i32));
    }

    #[test]
    fn argv_contains_pid_and_duration() {
        let sampler = PythonSampler {
            tool_path: "/usr/bin/py-spy".to_string(),
        };
        let argv = sampler.argv(1234, Duration::from_secs(30), Path::new("/tmp/out.col"));
        assert!(argv.contains(&"1234".to_string()));
        assert!(argv.contains(&"30".to_string()));
        assert!(argv.contains(&"/tmp/out.col".to_string()));
    }
}
