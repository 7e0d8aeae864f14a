// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Central registry of every helper process the agent spawns.
//!
//! Nothing outside this module ever holds a `tokio::process::Child` directly:
//! callers get back an opaque [`Handle`] id. Managed runtimes do not close
//! file descriptors or reap child-table entries just because an object
//! becomes unreachable, so ownership of both is made explicit here instead
//! of left to `Drop`.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::time::timeout;

pub type Handle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited,
}

struct Entry {
    name: String,
    pid: i32,
    child: Option<Child>,
    state: ProcessState,
    exit_status: Option<ExitStatus>,
    spawned_at: Instant,
}

/// Counts returned by a single [`ProcessRegistry::reap_exited`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapStats {
    pub scanned: usize,
    pub cleaned: usize,
    pub still_running: usize,
    pub pipes_closed: usize,
}

#[derive(Default)]
pub struct ProcessRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<Handle, Entry>>,
}

/// What to hand `spawn` for a new child process.
pub struct SpawnOpts<'a> {
    pub name: &'a str,
    pub argv: &'a [String],
    pub stdout: Stdio,
    pub stderr: Stdio,
    pub stdin: Stdio,
    pub working_dir: Option<&'a str>,
}

impl<'a> SpawnOpts<'a> {
    pub fn new(name: &'a str, argv: &'a [String]) -> Self {
        SpawnOpts {
            name,
            argv,
            stdout: Stdio::piped(),
            stderr: Stdio::piped(),
            stdin: Stdio::null(),
            working_dir: None,
        }
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `opts.argv[0]` with the remaining elements as arguments,
    /// registering the resulting child before returning its handle. A child
    /// exists in the registry before any other module touches its pipes.
    pub fn spawn(&self, opts: SpawnOpts<'_>) -> Result<Handle> {
        let (program, args) = opts
            .argv
            .split_first()
            .context("spawn requires a non-empty argv")?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdout(opts.stdout);
        cmd.stderr(opts.stderr);
        cmd.stdin(opts.stdin);
        if let Some(dir) = opts.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}: {program}", opts.name))?;
        let pid = child.id().unwrap_or(0) as i32;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            name: opts.name.to_string(),
            pid,
            child: Some(child),
            state: ProcessState::Running,
            exit_status: None,
            spawned_at: Instant::now(),
        };
        self.entries.lock().unwrap().insert(id, entry);
        info!("[registry] spawned {} (pid={pid}, handle={id})", opts.name);
        Ok(id)
    }

    pub fn pid(&self, handle: Handle) -> Option<i32> {
        self.entries.lock().unwrap().get(&handle).map(|e| e.pid)
    }

    pub fn state(&self, handle: Handle) -> Option<ProcessState> {
        self.entries.lock().unwrap().get(&handle).map(|e| e.state)
    }

    pub fn uptime(&self, handle: Handle) -> Option<Duration> {
        self.entries
            .lock()
            .unwrap()
            .get(&handle)
            .map(|e| e.spawned_at.elapsed())
    }

    /// Takes ownership of the child's stderr pipe for draining, if it was
    /// piped. The entry keeps the `Child` itself, so `wait`/`reap_exited`
    /// still see and reap it normally.
    pub fn take_stderr(&self, handle: Handle) -> Option<tokio::process::ChildStderr> {
        let mut entries = self.entries.lock().unwrap();
        entries.get_mut(&handle)?.child.as_mut()?.stderr.take()
    }

    pub fn send_signal(&self, handle: Handle, sig: Signal) {
        let pid = {
            let entries = self.entries.lock().unwrap();
            match entries.get(&handle) {
                Some(e) if e.state == ProcessState::Running => e.pid,
                _ => return,
            }
        };
        if let Err(e) = signal::kill(Pid::from_raw(pid), sig) {
            warn!("[registry] failed to send {sig} to pid {pid}: {e}");
        }
    }

    /// Awaits the child's exit without leaving it in the registry as a
    /// zombie. Returns `None` if `handle` is unknown or already reaped.
    pub async fn wait(&self, handle: Handle) -> Option<ExitStatus> {
        let child = {
            let mut entries = self.entries.lock().unwrap();
            entries.get_mut(&handle)?.child.take()
        }?;
        let mut child = child;
        let status = child.wait().await.ok();
        let mut entries = self.entries.lock().unwrap();
        if let Some(e) = entries.get_mut(&handle) {
            e.state = ProcessState::Exited;
            e.exit_status = status;
            e.child = None;
        }
        status
    }

    /// Non-blocking poll of one entry; moves it to `Exited` if its child has
    /// terminated since the last check.
    fn poll_one(entry: &mut Entry) -> bool {
        if entry.state == ProcessState::Exited {
            return true;
        }
        let Some(child) = entry.child.as_mut() else {
            entry.state = ProcessState::Exited;
            return true;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                entry.state = ProcessState::Exited;
                entry.exit_status = Some(status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(
                    "[registry] try_wait failed for {} (pid={}): {e}",
                    entry.name, entry.pid
                );
                false
            }
        }
    }

    /// One reap pass over the whole registry: every entry whose OS exit
    /// status is now available has its pipes dropped and is removed. Never
    /// blocks.
    pub fn reap_exited(&self) -> ReapStats {
        let mut stats = ReapStats::default();
        let mut entries = self.entries.lock().unwrap();
        stats.scanned = entries.len();

        let exited: Vec<Handle> = entries
            .iter_mut()
            .filter_map(|(id, entry)| Self::poll_one(entry).then_some(*id))
            .collect();

        for id in exited {
            if let Some(entry) = entries.remove(&id) {
                // Dropping the Child here closes any still-open stdio pipes
                // and releases the kernel's zombie table entry.
                let had_pipes = entry.child.is_some();
                drop(entry.child);
                if had_pipes {
                    stats.pipes_closed += 1;
                }
                stats.cleaned += 1;
                info!(
                    "[registry] reaped {} (pid={}, status={:?})",
                    entry.name, entry.pid, entry.exit_status
                );
            }
        }
        stats.still_running = entries.len();
        stats
    }

    /// Sends the termination signal to every still-running child, waits up
    /// to `grace`, then escalates to the kill signal for stragglers. Always
    /// reaps on the way out, regardless of whether anything timed out.
    pub async fn terminate_all(&self, grace: Duration) {
        let running: Vec<Handle> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .filter(|(_, e)| e.state == ProcessState::Running)
                .map(|(id, _)| *id)
                .collect()
        };
        for &id in &running {
            self.send_signal(id, Signal::SIGTERM);
        }

        let wait_all = async {
            for &id in &running {
                self.wait(id).await;
            }
        };
        if timeout(grace, wait_all).await.is_err() {
            warn!(
                "[registry] shutdown timeout ({}s) reached, sending SIGKILL",
                grace.as_secs()
            );
            for &id in &running {
                self.send_signal(id, Signal::SIGKILL);
            }
            for &id in &running {
                self.wait(id).await;
            }
        }
        self.reap_exited();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn spawn_and_reap_short_lived() {
        let reg = ProcessRegistry::new();
        let id = reg.spawn(SpawnOpts::new("true", &argv(&["/bin/true"]))).unwrap();
        assert_eq!(reg.state(id), Some(ProcessState::Running));

        // give the child a moment to exit
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = reg.reap_exited();
        assert_eq!(stats.scanned, 1);
        assert_eq!(stats.cleaned, 1);
        assert_eq!(stats.still_running, 0);
        assert_eq!(reg.len(), 0);
    }

    #[tokio::test]
    async fn reap_leaves_running_children_alone() {
        let reg = ProcessRegistry::new();
        let id = reg
            .spawn(SpawnOpts::new("sleeper", &argv(&["/bin/sleep", "60"])))
            .unwrap();
        let stats = reg.reap_exited();
        assert_eq!(stats.cleaned, 0);
        assert_eq!(stats.still_running, 1);
        reg.send_signal(id, Signal::SIGKILL);
        reg.wait(id).await;
    }

    #[tokio::test]
    async fn terminate_all_graceful() {
        let reg = ProcessRegistry::new();
        reg.spawn(SpawnOpts::new("p1", &argv(&["/bin/sleep", "60"])))
            .unwrap();
        reg.spawn(SpawnOpts::new("p2", &argv(&["/bin/sleep", "60"])))
            .unwrap();
        reg.terminate_all(Duration::from_secs(5)).await;
        assert_eq!(reg.len(), 0);
    }

    #[tokio::test]
    async fn terminate_all_sigkills_stragglers() {
        let reg = ProcessRegistry::new();
        reg.spawn(SpawnOpts::new(
            "stubborn",
            &argv(&["/bin/sh", "-c", "trap '' TERM; sleep 60"]),
        ))
        .unwrap();
        reg.terminate_all(Duration::from_secs(1)).await;
        assert_eq!(reg.len(), 0);
    }

    #[tokio::test]
    async fn spawn_nonexistent_binary_fails_without_registering() {
        let reg = ProcessRegistry::new();
        let result = reg.spawn(SpawnOpts::new("bad", &argv(&["/nonexistent/binary"])));
        assert!(result.is_err());
        assert_eq!(reg.len(), 0);
    }

    #[tokio::test]
    async fn terminate_all_on_empty_registry_is_a_noop() {
        let reg = ProcessRegistry::new();
        reg.terminate_all(Duration::from_secs(1)).await;
        assert_eq!(reg.len(), 0);
    }
}
