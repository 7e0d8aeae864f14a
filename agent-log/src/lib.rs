// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Minimal `log`-facade backend for agent binaries.
//!
//! Writes one line per record to stderr: `<time> <LEVEL> <target>: <message>`.
//! There is no rotation, no structured fields and no remote shipping here;
//! that belongs to the collector side, not the on-host agent.

use std::io::Write;
use std::sync::OnceLock;

use log::{Level, LevelFilter, Log, Metadata, Record};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

struct AgentLogger {
    level: LevelFilter,
}

impl Log for AgentLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let ts = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "????-??-??T??:??:??Z".to_string());
        let mut stderr = std::io::stderr();
        let _ = writeln!(
            stderr,
            "{ts} {level:<5} {target}: {args}",
            level = record.level(),
            target = record.target(),
            args = record.args(),
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: OnceLock<AgentLogger> = OnceLock::new();

/// Initializes the global logger at the given level. Safe to call more than
/// once; only the first call takes effect.
pub fn init_with_level(level: Level) {
    let filter = level.to_level_filter();
    let logger = LOGGER.get_or_init(|| AgentLogger { level: filter });
    if log::set_logger(logger).is_ok() {
        log::set_max_level(filter);
    }
}

/// Initializes the global logger from the `AGENT_LOG_LEVEL` environment
/// variable (`trace|debug|info|warn|error`), defaulting to `info` when unset
/// or unparseable.
pub fn init_from_env() {
    let level = std::env::var("AGENT_LOG_LEVEL")
        .ok()
        .and_then(|v| v.parse::<Level>().ok())
        .unwrap_or(Level::Info);
    init_with_level(level);
}

/// Parses a CLI-supplied level string, falling back to `info` on anything
/// unrecognized rather than failing startup over a typo'd flag.
pub fn level_from_str(s: &str) -> Level {
    s.parse::<Level>().unwrap_or(Level::Info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_from_str_falls_back_to_info() {
        assert_eq!(level_from_str("debug"), Level::Debug);
        assert_eq!(level_from_str("bogus"), Level::Info);
        assert_eq!(level_from_str("ERROR"), Level::Error);
    }
}
