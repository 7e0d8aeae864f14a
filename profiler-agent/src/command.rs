// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Two-queue command scheduler: ad-hoc (one-shot) jobs always pre-empt
//! continuous jobs. Both queues are bounded; an overflowing enqueue drops
//! the *incoming* command rather than evicting a queued one.

use std::collections::VecDeque;
use std::sync::Mutex;

use log::warn;
use serde::{Deserialize, Serialize};

pub const ADHOC_QUEUE_MAX_SIZE: usize = 10;
pub const CONTINUOUS_QUEUE_MAX_SIZE: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Start,
    Stop,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProfilingCommand {
    pub command_id: String,
    pub command_type: CommandType,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub is_continuous: bool,
}

#[derive(Default)]
pub struct CommandScheduler {
    adhoc: Mutex<VecDeque<ProfilingCommand>>,
    continuous: Mutex<VecDeque<ProfilingCommand>>,
}

impl CommandScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `cmd` into the queue matching `cmd.is_continuous`. Returns
    /// `false` (and logs) if that queue is already at capacity; the
    /// incoming command is dropped, the queue is left untouched.
    pub fn enqueue(&self, cmd: ProfilingCommand) -> bool {
        let (queue, max, name) = if cmd.is_continuous {
            (&self.continuous, CONTINUOUS_QUEUE_MAX_SIZE, "continuous")
        } else {
            (&self.adhoc, ADHOC_QUEUE_MAX_SIZE, "adhoc")
        };
        let mut q = queue.lock().unwrap();
        if q.len() >= max {
            warn!(
                "[command] {name} queue full ({max}), dropping command {}",
                cmd.command_id
            );
            return false;
        }
        q.push_back(cmd);
        true
    }

    /// Pops the oldest ad-hoc command if any, else the oldest continuous
    /// command, else `None`. Ad-hoc commands are always drained before any
    /// continuous command is returned.
    pub fn dequeue(&self) -> Option<ProfilingCommand> {
        if let Some(cmd) = self.adhoc.lock().unwrap().pop_front() {
            return Some(cmd);
        }
        self.continuous.lock().unwrap().pop_front()
    }

    pub fn has_queued_commands(&self) -> bool {
        !self.adhoc.lock().unwrap().is_empty() || !self.continuous.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.adhoc.lock().unwrap().clear();
        self.continuous.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adhoc(id: &str) -> ProfilingCommand {
        ProfilingCommand {
            command_id: id.to_string(),
            command_type: CommandType::Start,
            config: serde_json::Value::Null,
            is_continuous: false,
        }
    }

    fn continuous(id: &str) -> ProfilingCommand {
        ProfilingCommand {
            is_continuous: true,
            ..adhoc(id)
        }
    }

    #[test]
    fn adhoc_drains_before_continuous_regardless_of_arrival_order() {
        let sched = CommandScheduler::new();
        assert!(sched.enqueue(continuous("c1")));
        assert!(sched.enqueue(adhoc("a1")));
        assert!(sched.enqueue(adhoc("a2")));

        assert_eq!(sched.dequeue().unwrap().command_id, "a1");
        assert_eq!(sched.dequeue().unwrap().command_id, "a2");
        assert_eq!(sched.dequeue().unwrap().command_id, "c1");
        assert!(sched.dequeue().is_none());
    }

    #[test]
    fn adhoc_queue_is_fifo() {
        let sched = CommandScheduler::new();
        for i in 0..5 {
            sched.enqueue(adhoc(&format!("a{i}")));
        }
        for i in 0..5 {
            assert_eq!(sched.dequeue().unwrap().command_id, format!("a{i}"));
        }
    }

    #[test]
    fn eleventh_adhoc_enqueue_is_dropped_without_mutating_queue() {
        let sched = CommandScheduler::new();
        for i in 0..ADHOC_QUEUE_MAX_SIZE {
            assert!(sched.enqueue(adhoc(&format!("a{i}"))));
        }
        assert!(!sched.enqueue(adhoc("overflow")));

        for i in 0..ADHOC_QUEUE_MAX_SIZE {
            assert_eq!(sched.dequeue().unwrap().command_id, format!("a{i}"));
        }
        assert!(sched.dequeue().is_none());
    }

    #[test]
    fn continuous_queue_caps_at_one() {
        let sched = CommandScheduler::new();
        assert!(sched.enqueue(continuous("c1")));
        assert!(!sched.enqueue(continuous("c2")));
        assert_eq!(sched.dequeue().unwrap().command_id, "c1");
    }

    #[test]
    fn has_queued_commands_reflects_both_queues() {
        let sched = CommandScheduler::new();
        assert!(!sched.has_queued_commands());
        sched.enqueue(continuous("c1"));
        assert!(sched.has_queued_commands());
        sched.clear();
        assert!(!sched.has_queued_commands());
    }
}
