use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::{MAX_SWEEP_INTERVAL_MS, MIN_SWEEP_INTERVAL_MS};
use crate::model::Ms;

pub const DEFAULT_LOCK_TTL_SECS: u64 = 300;

/// Runtime settings, read from `SLOTKEEPER_*` environment variables.
/// Unparseable values fall back to the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub lock_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7420,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            sweep_interval: Duration::from_millis(500),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let sweep_ms = parse_or(
            lookup("SLOTKEEPER_SWEEP_INTERVAL_MS"),
            defaults.sweep_interval.as_millis() as u64,
        )
        .clamp(MIN_SWEEP_INTERVAL_MS, MAX_SWEEP_INTERVAL_MS);

        let ttl_secs = parse_or(lookup("SLOTKEEPER_LOCK_TTL_SECS"), DEFAULT_LOCK_TTL_SECS).max(1);

        Self {
            bind: lookup("SLOTKEEPER_BIND").unwrap_or(defaults.bind),
            port: parse_or(lookup("SLOTKEEPER_PORT"), defaults.port),
            data_dir: lookup("SLOTKEEPER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: parse_or(lookup("SLOTKEEPER_MAX_CONNECTIONS"), defaults.max_connections)
                .max(1),
            compact_threshold: parse_or(
                lookup("SLOTKEEPER_COMPACT_THRESHOLD"),
                defaults.compact_threshold,
            ),
            metrics_port: lookup("SLOTKEEPER_METRICS_PORT").and_then(|s| s.parse().ok()),
            lock_ttl: Duration::from_secs(ttl_secs),
            sweep_interval: Duration::from_millis(sweep_ms),
        }
    }

    pub fn lock_ttl_ms(&self) -> Ms {
        self.lock_ttl.as_millis() as Ms
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("schedules.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}
