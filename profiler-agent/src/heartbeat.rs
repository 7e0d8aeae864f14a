// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Collector heartbeat transport: reports agent liveness, receives the next
//! profiling command (if any), and reports command completion.

use std::net::UdpSocket;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::command::{CommandType, ProfilingCommand};
use crate::errors::TransportError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    ip_address: &'a str,
    hostname: &'a str,
    service_name: &'a str,
    last_command_id: Option<&'a str>,
    status: &'static str,
    timestamp: String,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    #[serde(default)]
    pub profiling_command: Option<ProfilingCommandWire>,
    #[serde(default)]
    pub command_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProfilingCommandWire {
    pub command_type: CommandType,
    #[serde(default)]
    pub combined_config: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct CommandCompletionRequest<'a> {
    command_id: &'a str,
    hostname: &'a str,
    status: &'static str,
    execution_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    results_path: Option<&'a str>,
}

pub struct HeartbeatClient {
    http: reqwest::Client,
    collector_url: String,
    hostname: String,
    ip_address: String,
    service_name: String,
}

impl HeartbeatClient {
    pub fn new(collector_url: String, service_name: String, server_token: Option<&str>) -> Self {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(token) = server_token {
            let mut headers = reqwest::header::HeaderMap::new();
            if let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
            builder = builder.default_headers(headers);
        }
        let http = builder.build().unwrap_or_default();

        HeartbeatClient {
            http,
            collector_url,
            hostname: hostname(),
            ip_address: local_ip(),
            service_name,
        }
    }

    pub async fn send_heartbeat(
        &self,
        last_command_id: Option<&str>,
    ) -> Result<Option<HeartbeatResponse>, TransportError> {
        let body = HeartbeatRequest {
            ip_address: &self.ip_address,
            hostname: &self.hostname,
            service_name: &self.service_name,
            last_command_id,
            status: "active",
            timestamp: now_rfc3339(),
        };

        let resp = self
            .http
            .post(format!("{}/api/metrics/heartbeat", self.collector_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Heartbeat(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(TransportError::Heartbeat(format!(
                "unexpected status {}",
                resp.status()
            )));
        }

        let parsed: HeartbeatResponse = resp
            .json()
            .await
            .map_err(|e| TransportError::Heartbeat(e.to_string()))?;

        if parsed.success && parsed.profiling_command.is_some() {
            Ok(Some(parsed))
        } else {
            Ok(None)
        }
    }

    pub async fn send_command_completion(
        &self,
        command_id: &str,
        status: CompletionStatus,
        execution_time: Duration,
        error_message: Option<&str>,
        results_path: Option<&str>,
    ) -> Result<bool, TransportError> {
        let body = CommandCompletionRequest {
            command_id,
            hostname: &self.hostname,
            status: status.as_str(),
            execution_time: execution_time.as_secs_f64(),
            error_message,
            results_path,
        };

        let resp = self
            .http
            .post(format!("{}/api/metrics/command_completion", self.collector_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::CommandCompletion(e.to_string()))?;

        if !resp.status().is_success() {
            warn!(
                "[heartbeat] command completion report for {command_id} failed: {}",
                resp.status()
            );
            return Ok(false);
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    Failed,
}

impl CompletionStatus {
    fn as_str(self) -> &'static str {
        match self {
            CompletionStatus::Completed => "completed",
            CompletionStatus::Failed => "failed",
        }
    }
}

impl ProfilingCommandWire {
    pub fn into_command(self, command_id: String) -> ProfilingCommand {
        let is_continuous = self
            .combined_config
            .get("continuous")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        ProfilingCommand {
            command_id,
            command_type: self.command_type,
            config: self.combined_config,
            is_continuous,
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// Determines the agent's outbound local address by "connecting" a UDP
/// socket to a well-known external address and reading back the local
/// endpoint; no packet is actually sent. Falls back to the loopback
/// address on any failure (sandboxed/offline hosts).
fn local_ip() -> String {
    (|| -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    })()
    .unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ip_never_panics_and_returns_some_address() {
        let ip = local_ip();
        assert!(!ip.is_empty());
    }

    #[test]
    fn profiling_command_wire_extracts_continuous_flag() {
        let wire = ProfilingCommandWire {
            command_type: CommandType::Start,
            combined_config: serde_json::json!({"continuous": true, "duration": 30}),
        };
        let cmd = wire.into_command("abc".to_string());
        assert!(cmd.is_continuous);
        assert_eq!(cmd.command_id, "abc");
    }

    #[test]
    fn profiling_command_wire_defaults_continuous_to_false() {
        let wire = ProfilingCommandWire {
            command_type: CommandType::Stop,
            combined_config: serde_json::json!({}),
        };
        let cmd = wire.into_command("xyz".to_string());
        assert!(!cmd.is_continuous);
    }

    #[test]
    fn heartbeat_response_without_profiling_command_deserializes() {
        let json = r#"{"success": true}"#;
        let resp: HeartbeatResponse = serde_json::from_str(json).unwrap();
        assert!(resp.success);
        assert!(resp.profiling_command.is_none());
    }
}
