// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Parsing of per-runtime samplers' collapsed-stack output.
//!
//! A collapsed-stack line is `<semicolon-separated frames> <count>`; a
//! second, pid-tagged variant used when one sampler reports for several
//! processes at once prefixes the stack with `<comm>-<pid>/<tid>;`.
//! Neither parser ever raises on malformed input: individual bad lines are
//! counted and logged, and the cycle's output is used as-is.

use log::{error, warn};

use super::{ProcessToStackSampleCounters, StackToSampleCount};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParseStats {
    pub total_lines: usize,
    pub parsed_lines: usize,
    pub bad_lines: usize,
}

/// Parses one sampler's collapsed output into a [`StackToSampleCount`],
/// optionally tagging every stack with a trailing synthetic frame
/// identifying the process command name.
pub fn parse_one_collapsed(collapsed: &str, add_comm: Option<&str>) -> (StackToSampleCount, ParseStats) {
    let mut counts = StackToSampleCount::new();
    let mut stats = ParseStats::default();
    let mut bad_samples: Vec<String> = Vec::new();

    for line in collapsed.lines() {
        if line.is_empty() {
            continue;
        }
        stats.total_lines += 1;

        match parse_collapsed_line(line) {
            Some((stack, count)) => {
                let key = match add_comm {
                    Some(comm) => format!("{stack};{comm}"),
                    None => stack.to_string(),
                };
                *counts.entry(key).or_insert(0) += count;
                stats.parsed_lines += 1;
            }
            None => {
                stats.bad_lines += 1;
                if bad_samples.len() < 5 {
                    bad_samples.push(line.to_string());
                }
            }
        }
    }

    if stats.bad_lines > 0 {
        warn!(
            "[collapsed] {} bad line(s) out of {}, e.g. {:?}",
            stats.bad_lines, stats.total_lines, bad_samples
        );
        if stats.total_lines > 0 && stats.bad_lines as f64 > stats.total_lines as f64 * 0.5 {
            error!(
                "[collapsed] output severely corrupted ({}/{} bad lines); sampler may have crashed mid-write",
                stats.bad_lines, stats.total_lines
            );
        }
    }

    (counts, stats)
}

fn parse_collapsed_line(line: &str) -> Option<(&str, u64)> {
    let (stack, count_str) = line.rsplit_once(' ')?;
    if stack.is_empty() || count_str.is_empty() {
        return None;
    }
    let count: u64 = count_str.parse().ok()?;
    Some((stack, count))
}

/// Parses a multi-process collapsed stream whose lines look like
/// `comm-pid/tid;frame1;frame2 count`, grouping by pid.
pub fn parse_many_collapsed(text: &str) -> (ProcessToStackSampleCounters, ParseStats) {
    let mut out = ProcessToStackSampleCounters::new();
    let mut stats = ParseStats::default();
    let mut bad_samples: Vec<String> = Vec::new();

    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        stats.total_lines += 1;

        match parse_tagged_line(line) {
            Some((pid, stack, count)) => {
                let per_pid = out.entry(pid).or_default();
                *per_pid.entry(stack.to_string()).or_insert(0) += count;
                stats.parsed_lines += 1;
            }
            None => {
                stats.bad_lines += 1;
                if bad_samples.len() < 8 {
                    bad_samples.push(line.to_string());
                }
            }
        }
    }

    if stats.bad_lines > 0 {
        warn!(
            "[collapsed] {} bad line(s) in tagged stream out of {}, e.g. {:?}",
            stats.bad_lines, stats.total_lines, bad_samples
        );
    }

    (out, stats)
}

fn parse_tagged_line(line: &str) -> Option<(i32, &str, u64)> {
    let (rest, count_str) = line.rsplit_once(' ')?;
    let count: u64 = count_str.parse().ok()?;
    let (comm_pid_tid, stack) = rest.split_once(';')?;
    let (_comm, pid_tid) = comm_pid_tid.rsplit_once('-')?;
    let pid_str = pid_tid.split('/').next()?;
    let pid: i32 = pid_str.parse().ok()?;
    Some((pid, stack, count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_collapsed_output() {
        let input = "a;b;c 5\na;b;d 3\n";
        let (counts, stats) = parse_one_collapsed(input, None);
        assert_eq!(counts["a;b;c"], 5);
        assert_eq!(counts["a;b;d"], 3);
        assert_eq!(stats.bad_lines, 0);
        assert_eq!(stats.parsed_lines, 2);
    }

    #[test]
    fn adds_comm_suffix_when_requested() {
        let (counts, _) = parse_one_collapsed("a;b 1\n", Some("python"));
        assert_eq!(counts["a;b;python"], 1);
    }

    #[test]
    fn sums_counts_across_duplicate_stacks() {
        let (counts, _) = parse_one_collapsed("a;b 1\na;b 2\n", None);
        assert_eq!(counts["a;b"], 3);
    }

    #[test]
    fn tracks_bad_lines_without_failing() {
        let input = "a;b;c 5\nnot a valid line\na;b;d notanumber\n";
        let (counts, stats) = parse_one_collapsed(input, None);
        assert_eq!(counts.len(), 1);
        assert_eq!(stats.bad_lines, 2);
        assert_eq!(stats.total_lines, 3);
    }

    #[test]
    fn round_trips_sum_of_counts() {
        let input = "a;b 10\nc;d 20\ne 30\n";
        let (counts, _) = parse_one_collapsed(input, None);
        let total: u64 = counts.values().sum();
        assert_eq!(total, 60);
    }

    #[test]
    fn parses_pid_tagged_stream_grouped_by_pid() {
        let input = "python-123/123;a;b 4\njava-456/456;x;y 2\npython-123/123;a;c 1\n";
        let (by_pid, stats) = parse_many_collapsed(input);
        assert_eq!(by_pid[&123]["a;b"], 4);
        assert_eq!(by_pid[&123]["a;c"], 1);
        assert_eq!(by_pid[&456]["x;y"], 2);
        assert_eq!(stats.parsed_lines, 3);
    }
}
