// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

use thiserror::Error;

/// Per-target profiling failures the scheduler must classify by variant, not
/// by matching on a formatted string.
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("process {pid} went down during profiling")]
    TargetGone { pid: i32 },

    #[error("process {pid} is not actually a {runtime} process")]
    Misclassified { pid: i32, runtime: &'static str },

    #[error("sampler for {pid} crashed: {detail}")]
    SamplerCrashed { pid: i32, detail: String },

    #[error("sampler for {pid} timed out after {secs}s")]
    Timeout { pid: i32, secs: u64 },

    #[error("exception {kind}")]
    Other { kind: String },
}

impl ProfileError {
    /// The `<what>;<reason>` pair used to build a synthetic error stack, per
    /// the `error;<what>;<reason>;<comm>` convention.
    pub fn error_stack_parts(&self) -> (&'static str, String) {
        match self {
            ProfileError::TargetGone { .. } => {
                ("error", "process went down during profiling".to_string())
            }
            ProfileError::Misclassified { runtime, .. } => {
                ("error", format!("not a {runtime} process"))
            }
            ProfileError::SamplerCrashed { detail, .. } => {
                ("error", format!("sampler crashed: {detail}"))
            }
            ProfileError::Timeout { secs, .. } => {
                ("error", format!("sampler timed out after {secs}s"))
            }
            ProfileError::Other { kind } => ("error", format!("exception {kind}")),
        }
    }
}

/// Failures that abort a whole profiling cycle rather than a single target.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("cgroup scoping requested but no eligible cgroups were found")]
    NoCgroupsFound,

    #[error("no supported sampling event available on this kernel")]
    NoSupportedEvent,

    #[error("sampler output file did not appear within {secs}s")]
    StartTimeout { secs: u64 },

    #[error("sampler child exited unexpectedly: {detail}")]
    ChildExited { detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Command-and-control transport failures; never retried beyond the next
/// scheduled heartbeat tick.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("heartbeat request failed: {0}")]
    Heartbeat(String),

    #[error("command completion report failed: {0}")]
    CommandCompletion(String),
}
