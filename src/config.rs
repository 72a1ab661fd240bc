use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings, read from `KITROOM_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub session_timeout: Duration,
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub metrics_port: Option<u16>,
    /// JSON directory seed applied at startup.
    pub seed: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            session_timeout: Duration::from_secs(180),
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(30),
            metrics_port: None,
            seed: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        Self {
            data_dir: lookup("KITROOM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            session_timeout: parsed("KITROOM_SESSION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.session_timeout),
            compact_threshold: parsed("KITROOM_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            compact_interval: parsed("KITROOM_COMPACT_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.compact_interval),
            metrics_port: lookup("KITROOM_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            seed: lookup("KITROOM_SEED").filter(|s| !s.is_empty()).map(PathBuf::from),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("kitroom.wal")
    }
}
