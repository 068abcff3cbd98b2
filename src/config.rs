use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::SchedulerPolicy;
use crate::model::{Ms, UserId};
use crate::reconcile::{JitteredInterval, PollConfig, ReplicaCache};

/// Server settings, read from `SLOTKEEPER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub policy: SchedulerPolicy,
    pub poll: PollConfig,
    /// How old a replica may get before it counts as stale.
    pub cache_max_staleness: Ms,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotkeeper".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            policy: SchedulerPolicy::default(),
            poll: PollConfig::default(),
            cache_max_staleness: 60_000,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing or unparseable values keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let lookup = &lookup;
        let millis = |key: &str, default: Duration| {
            parsed::<u64>(lookup, key)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };

        Self {
            port: parsed(lookup, "SLOTKEEPER_PORT").unwrap_or(defaults.port),
            bind: lookup("SLOTKEEPER_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("SLOTKEEPER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("SLOTKEEPER_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(lookup, "SLOTKEEPER_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parsed(lookup, "SLOTKEEPER_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(lookup, "SLOTKEEPER_METRICS_PORT"),
            tls_cert: lookup("SLOTKEEPER_TLS_CERT"),
            tls_key: lookup("SLOTKEEPER_TLS_KEY"),
            policy: SchedulerPolicy {
                reopen_slot_on_cancel: lookup("SLOTKEEPER_REOPEN_ON_CANCEL")
                    .and_then(|v| parse_flag(&v))
                    .unwrap_or(defaults.policy.reopen_slot_on_cancel),
            },
            poll: PollConfig {
                interval: millis("SLOTKEEPER_POLL_INTERVAL_MS", defaults.poll.interval),
                jitter: millis("SLOTKEEPER_POLL_JITTER_MS", defaults.poll.jitter),
                debounce: millis("SLOTKEEPER_POLL_DEBOUNCE_MS", defaults.poll.debounce),
                max_backoff: millis("SLOTKEEPER_POLL_MAX_BACKOFF_MS", defaults.poll.max_backoff),
            },
            cache_max_staleness: parsed(lookup, "SLOTKEEPER_CACHE_MAX_STALENESS_MS")
                .unwrap_or(defaults.cache_max_staleness),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotkeeper.wal")
    }

    pub fn poll_strategy(&self) -> JitteredInterval {
        JitteredInterval::new(self.poll)
    }

    /// An empty replica of `provider_id` that goes stale after `cache_max_staleness`.
    pub fn replica(&self, provider_id: UserId) -> ReplicaCache {
        ReplicaCache::new(provider_id, self.cache_max_staleness)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => bool::from_str(other).ok(),
    }
}
