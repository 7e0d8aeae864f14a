// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Combines the kernel sampler's system-wide samples with the per-process
//! runtime samplers' output into one cycle's result.
//!
//! Merge order is deterministic: the system-wide sampler contributes
//! first. For any pid a runtime sampler also profiled, its user-space
//! frames take priority — the runtime unwinder sees interpreter state the
//! kernel sampler cannot. Kernel frames contributed by the system-wide
//! sampler for that same pid (the trailing run of frames tagged `_[k]`) are
//! preserved rather than discarded, since the runtime sampler never
//! observes them.

use crate::parser::{ProcessToStackSampleCounters, StackToSampleCount, merge_into};

const KERNEL_TAG: &str = "_[k]";

/// Longest trailing run of kernel-tagged frames in a root-first collapsed
/// stack, or `None` if the stack has no kernel tail.
fn kernel_tail(stack: &str) -> Option<String> {
    let frames: Vec<&str> = stack.split(';').collect();
    let mut tail_start = frames.len();
    for (i, frame) in frames.iter().enumerate().rev() {
        if frame.ends_with(KERNEL_TAG) {
            tail_start = i;
        } else {
            break;
        }
    }
    if tail_start == frames.len() {
        None
    } else {
        Some(frames[tail_start..].join(";"))
    }
}

/// Merges one cycle's system-wide and per-runtime samples.
pub fn merge(
    system: &ProcessToStackSampleCounters,
    runtime: &ProcessToStackSampleCounters,
) -> ProcessToStackSampleCounters {
    let mut out = ProcessToStackSampleCounters::new();

    for (pid, stacks) in system {
        if let Some(runtime_stacks) = runtime.get(pid) {
            let mut kept = StackToSampleCount::new();
            for (stack, count) in stacks {
                if let Some(tail) = kernel_tail(stack) {
                    *kept.entry(tail).or_insert(0) += count;
                }
            }
            out.insert(*pid, kept);
        } else {
            out.insert(*pid, stacks.clone());
        }
    }

    for (pid, stacks) in runtime {
        let entry = out.entry(*pid).or_default();
        merge_into(entry, stacks);
    }

    out
}
