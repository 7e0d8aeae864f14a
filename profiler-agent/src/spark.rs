// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Auxiliary registry for Spark executor/driver processes that report
//! themselves over loopback HTTP instead of being discovered via `/proc`
//! scanning. A Spark JVM plugin posts a heartbeat naming its app id and
//! thread set; entries age out if the plugin stops heartbeating.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

const STALE_TIMEOUT: Duration = Duration::from_secs(300);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct SparkEntry {
    app_id: String,
    threads: Vec<u64>,
    last_heartbeat: Instant,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
enum SparkMessage {
    Heartbeat { pid: i32, app_id: String },
    ThreadInfo { pid: i32, threads: Vec<u64> },
}

#[derive(Debug, Serialize)]
struct SparkAck {
    ok: bool,
}

/// In-memory table of self-reporting Spark processes, keyed by pid.
#[derive(Default)]
pub struct SparkRegistry {
    entries: Mutex<HashMap<i32, SparkEntry>>,
}

impl SparkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_message(&self, msg: SparkMessage) {
        let mut entries = self.entries.lock().unwrap();
        match msg {
            SparkMessage::Heartbeat { pid, app_id } => {
                entries
                    .entry(pid)
                    .and_modify(|e| {
                        e.app_id = app_id.clone();
                        e.last_heartbeat = Instant::now();
                    })
                    .or_insert_with(|| SparkEntry {
                        app_id,
                        threads: Vec::new(),
                        last_heartbeat: Instant::now(),
                    });
            }
            SparkMessage::ThreadInfo { pid, threads } => {
                if let Some(entry) = entries.get_mut(&pid) {
                    entry.threads = threads;
                    entry.last_heartbeat = Instant::now();
                } else {
                    warn!("[spark] thread_info for unregistered pid {pid}, dropping");
                }
            }
        }
    }

    /// Drops every entry whose last heartbeat is older than [`STALE_TIMEOUT`].
    /// Returns how many were dropped.
    pub fn cleanup_stale(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| e.last_heartbeat.elapsed() < STALE_TIMEOUT);
        before - entries.len()
    }

    /// Restricts `pids` to those currently registered and fresh, pairing
    /// each with its reported Spark app id.
    pub fn filter_processes(&self, pids: &[i32]) -> Vec<(i32, String)> {
        let entries = self.entries.lock().unwrap();
        pids.iter()
            .filter_map(|pid| {
                entries.get(pid).map(|e| (*pid, e.app_id.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn handle_request(
    registry: std::sync::Arc<SparkRegistry>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    if req.method() != Method::POST || req.uri().path() != "/spark" {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found")))
            .unwrap_or_default());
    }

    let body = match req.collect().await {
        Ok(body) => body.to_bytes(),
        Err(e) => {
            error!("[spark] failed to read request body: {e}");
            return Ok(Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::from_static(b"bad request")))
                .unwrap_or_default());
        }
    };

    match serde_json::from_slice::<SparkMessage>(&body) {
        Ok(msg) => {
            registry.handle_message(msg);
            let ack = serde_json::to_vec(&SparkAck { ok: true }).unwrap_or_default();
            Ok(Response::builder()
                .header("Content-Type", "application/json")
                .body(Full::new(Bytes::from(ack)))
                .unwrap_or_default())
        }
        Err(e) => {
            warn!("[spark] malformed message: {e}");
            Ok(Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::from_static(b"bad request")))
                .unwrap_or_default())
        }
    }
}

/// Serves the `/spark` endpoint on `addr` until the process exits. Intended
/// to run as its own tokio task for the life of the agent.
pub async fn serve(registry: std::sync::Arc<SparkRegistry>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("[spark] listening on {addr}");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let registry = registry.clone();

        tokio::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(move |req| handle_request(registry.clone(), req)))
                .await
            {
                error!("[spark] connection error: {err}");
            }
        });
    }
}

/// Runs `cleanup_stale` on a fixed interval until `stop` fires.
pub async fn run_cleanup_loop(registry: std::sync::Arc<SparkRegistry>, mut stop: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let dropped = registry.cleanup_stale();
                if dropped > 0 {
                    info!("[spark] cleaned up {dropped} stale entr{}", if dropped == 1 { "y" } else { "ies" });
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_registers_new_pid() {
        let reg = SparkRegistry::new();
        reg.handle_message(SparkMessage::Heartbeat {
            pid: 100,
            app_id: "app-1".to_string(),
        });
        assert_eq!(reg.len(), 1);
        let filtered = reg.filter_processes(&[100]);
        assert_eq!(filtered, vec![(100, "app-1".to_string())]);
    }

    #[test]
    fn thread_info_for_unknown_pid_is_dropped_not_created() {
        let reg = SparkRegistry::new();
        reg.handle_message(SparkMessage::ThreadInfo {
            pid: 999,
            threads: vec![1, 2],
        });
        assert!(reg.is_empty());
    }

    #[test]
    fn thread_info_updates_existing_entry() {
        let reg = SparkRegistry::new();
        reg.handle_message(SparkMessage::Heartbeat {
            pid: 100,
            app_id: "app-1".to_string(),
        });
        reg.handle_message(SparkMessage::ThreadInfo {
            pid: 100,
            threads: vec![1, 2, 3],
        });
        let entries = reg.entries.lock().unwrap();
        assert_eq!(entries[&100].threads, vec![1, 2, 3]);
    }

    #[test]
    fn filter_processes_excludes_unregistered_pids() {
        let reg = SparkRegistry::new();
        reg.handle_message(SparkMessage::Heartbeat {
            pid: 1,
            app_id: "a".to_string(),
        });
        let filtered = reg.filter_processes(&[1, 2, 3]);
        assert_eq!(filtered, vec![(1, "a".to_string())]);
    }

    #[test]
    fn cleanup_stale_drops_old_entries() {
        let reg = SparkRegistry::new();
        reg.handle_message(SparkMessage::Heartbeat {
            pid: 1,
            app_id: "a".to_string(),
        });
        {
            let mut entries = reg.entries.lock().unwrap();
            entries.get_mut(&1).unwrap().last_heartbeat =
                Instant::now() - Duration::from_secs(400);
        }
        let dropped = reg.cleanup_stale();
        assert_eq!(dropped, 1);
        assert!(reg.is_empty());
    }
}
