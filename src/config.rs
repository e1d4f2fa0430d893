use std::path::PathBuf;
use std::time::Duration;

/// Daemon settings, read from `BOOKD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub sweep_interval: Duration,
    pub sweep_timeout: Duration,
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            sweep_interval: Duration::from_secs(60),
            sweep_timeout: Duration::from_secs(5),
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(60),
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Missing or unparseable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|&s| s > 0)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Self {
            data_dir: lookup("BOOKD_DATA_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            sweep_interval: secs("BOOKD_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            sweep_timeout: secs("BOOKD_SWEEP_TIMEOUT_SECS", defaults.sweep_timeout),
            compact_threshold: lookup("BOOKD_COMPACT_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.compact_threshold),
            compact_interval: secs("BOOKD_COMPACT_INTERVAL_SECS", defaults.compact_interval),
            metrics_port: lookup("BOOKD_METRICS_PORT").and_then(|v| v.parse().ok()),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}
