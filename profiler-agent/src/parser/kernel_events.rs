// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Parsing of the kernel sampler's textual event stream (`perf script`
//! output): one sample per blank-line-delimited block, a header line
//! followed by one frame per call-stack entry, innermost frame first.

use regex::Regex;
use std::sync::OnceLock;

use super::ProcessToStackSampleCounters;

static HEADER_RE: OnceLock<Regex> = OnceLock::new();
static FRAME_RE: OnceLock<Regex> = OnceLock::new();

fn header_re() -> &'static Regex {
    HEADER_RE.get_or_init(|| {
        Regex::new(r"^(?P<comm>.+?)\s+(?P<pid>\d+)/(?P<tid>\d+)\s+\[\d+\]\s+\S+:\s*(?:\d+\s+)?\S+")
            .unwrap()
    })
}

fn frame_re() -> &'static Regex {
    FRAME_RE.get_or_init(|| {
        Regex::new(r"^\s*[0-9a-fA-F]+\s+(?P<sym>\S+)(?:\s+\((?P<dso>[^)]*)\))?\s*$").unwrap()
    })
}

struct ParsedHeader {
    comm: String,
    pid: i32,
}

fn parse_header(line: &str) -> Option<ParsedHeader> {
    let caps = header_re().captures(line)?;
    let pid: i32 = caps.name("pid")?.as_str().parse().ok()?;
    Some(ParsedHeader {
        comm: caps.name("comm")?.as_str().trim().to_string(),
        pid,
    })
}

/// Strips a `+<offset>` suffix and tags frames attributed to the kernel
/// symbol map so user and kernel frames stay visually distinguishable once
/// collapsed.
fn collapse_frame(line: &str) -> Option<String> {
    let caps = frame_re().captures(line)?;
    let raw_sym = caps.name("sym")?.as_str();
    let sym = raw_sym.split('+').next().unwrap_or(raw_sym);
    let dso = caps.name("dso").map(|m| m.as_str()).unwrap_or("");

    let is_kernel = dso.contains("kallsyms") || dso.contains("vmlinux");
    let name = if sym == "[unknown]" && !dso.is_empty() {
        dso.to_string()
    } else {
        sym.to_string()
    };
    Some(if is_kernel {
        format!("{name}_[k]")
    } else {
        name
    })
}

/// Parses a full `perf script` text stream, grouping samples by pid. Frame
/// order in the input is innermost-first (call-stack leaf first); the
/// collapsed stack is emitted root-first per the collapsed-stack
/// convention, so frames are reversed before joining.
pub fn parse_kernel_events(text: &str) -> ProcessToStackSampleCounters {
    let mut out = ProcessToStackSampleCounters::new();

    for block in text.split("\n\n") {
        let mut lines = block.lines().filter(|l| !l.trim().is_empty());
        let Some(header_line) = lines.next() else {
            continue;
        };
        let Some(header) = parse_header(header_line) else {
            continue;
        };
        let frames: Vec<String> = lines.filter_map(collapse_frame).collect();
        if frames.is_empty() {
            continue;
        }
        let mut reversed = frames;
        reversed.reverse();
        let mut all_frames = Vec::with_capacity(reversed.len() + 1);
        all_frames.push(header.comm.clone());
        all_frames.extend(reversed);
        let stack = all_frames.join(";");
        let per_pid = out.entry(header.pid).or_default();
        *per_pid.entry(stack).or_insert(0) += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_sample_with_user_and_kernel_frames() {
        let text = "\
swapper 0/0 [000] 12345.678: 1 cycles:
\tffffffff81000000 entry_SYSCALL_64+0x0 ([kernel.kallsyms])
\t00007f0000000000 main+0x10 (/usr/bin/myapp)
";
        let out = parse_kernel_events(text);
        assert_eq!(out.len(), 1);
        let stack_map = &out[&0];
        let (stack, count) = stack_map.iter().next().unwrap();
        assert_eq!(*count, 1);
        assert_eq!(stack, "swapper;main;entry_SYSCALL_64_[k]");
    }

    #[test]
    fn groups_multiple_samples_by_pid() {
        let text = "\
myapp 100/100 [000] 1.0: cycles:
\t00007f0000000000 foo+0x1 (/bin/myapp)

myapp 100/100 [000] 2.0: cycles:
\t00007f0000000000 foo+0x1 (/bin/myapp)

other 200/200 [000] 3.0: cycles:
\t00007f0000000000 bar+0x1 (/bin/other)
";
        let out = parse_kernel_events(text);
        assert_eq!(out[&100]["myapp;foo"], 2);
        assert_eq!(out[&200]["other;bar"], 1);
    }

    #[test]
    fn ignores_blocks_with_no_resolvable_header() {
        let text = "not a valid header at all\n\tffffffff81000000 foo+0x1 ([kernel.kallsyms])\n";
        let out = parse_kernel_events(text);
        assert!(out.is_empty());
    }
}
