use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;
use tracing::{info, warn};

/// Upper bound for the cache TTL and sweep interval. Keeps `now + ttl`
/// representable and a typo from pinning stale status for years.
pub const MAX_CACHE_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub cache_ttl: TimeDelta,
    pub lock_timeout: Duration,
    /// Compact the WAL once this many appends have piled up since the last one.
    pub compact_threshold: u64,
    pub cache_sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8003,
            data_dir: PathBuf::from("./data"),
            cache_ttl: TimeDelta::seconds(60),
            lock_timeout: Duration::from_millis(2000),
            compact_threshold: 1000,
            cache_sweep_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable keys keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let ttl_secs: i64 = try_load(&lookup, "ROOMBOOK_CACHE_TTL_SECS", d.cache_ttl.num_seconds());
        let lock_ms: u64 = try_load(&lookup, "ROOMBOOK_LOCK_TIMEOUT_MS", d.lock_timeout.as_millis() as u64);
        let sweep_secs: u64 = try_load(
            &lookup,
            "ROOMBOOK_CACHE_SWEEP_SECS",
            d.cache_sweep_interval.as_secs(),
        );
        Self {
            bind: try_load(&lookup, "ROOMBOOK_BIND", d.bind),
            port: try_load(&lookup, "ROOMBOOK_PORT", d.port),
            data_dir: PathBuf::from(try_load(
                &lookup,
                "ROOMBOOK_DATA_DIR",
                d.data_dir.display().to_string(),
            )),
            cache_ttl: TimeDelta::seconds(clamp_secs("ROOMBOOK_CACHE_TTL_SECS", ttl_secs)),
            lock_timeout: Duration::from_millis(lock_ms.max(1)),
            compact_threshold: try_load(&lookup, "ROOMBOOK_COMPACT_THRESHOLD", d.compact_threshold),
            cache_sweep_interval: Duration::from_secs(
                clamp_secs("ROOMBOOK_CACHE_SWEEP_SECS", i64::try_from(sweep_secs).unwrap_or(i64::MAX))
                    as u64,
            ),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roombook.wal")
    }
}

fn clamp_secs(key: &str, secs: i64) -> i64 {
    if secs > MAX_CACHE_SECS {
        warn!("{key} value {secs} too large; using {MAX_CACHE_SECS}");
    }
    secs.clamp(1, MAX_CACHE_SECS)
}

fn try_load<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Some(raw) = lookup(key) else {
        info!("{key} not set, using default: {default}");
        return default;
    };
    raw.trim().parse().unwrap_or_else(|e| {
        warn!("Invalid {key} value {raw:?}: {e}; using default: {default}");
        default
    })
}
