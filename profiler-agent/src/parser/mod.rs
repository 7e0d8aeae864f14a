// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

pub mod collapsed;
pub mod kernel_events;

use std::collections::HashMap;

/// Mapping from a semicolon-joined, root-first frame string to a sample
/// count. Concatenation of two maps is pointwise addition; the empty map is
/// the identity.
pub type StackToSampleCount = HashMap<String, u64>;

/// Per-PID [`StackToSampleCount`].
pub type ProcessToStackSampleCounters = HashMap<i32, StackToSampleCount>;

pub fn merge_into(dst: &mut StackToSampleCount, src: &StackToSampleCount) {
    for (stack, count) in src {
        *dst.entry(stack.clone()).or_insert(0) += count;
    }
}

/// Builds the `error;<what>;<reason>;<comm>` synthetic stack used to
/// surface a per-target failure without dropping the rest of a cycle. The
/// nominal count of 1 may be rescaled by the merger.
pub fn error_stack(what: &str, reason: &str, comm: &str) -> StackToSampleCount {
    let mut m = StackToSampleCount::new();
    m.insert(format!("{what};{reason};{comm}"), 1);
    m
}
