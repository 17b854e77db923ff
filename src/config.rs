use std::time::Duration;

use serde::Deserialize;

use crate::queue::QueuePolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Backend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_backend")]
    pub backend: Backend,
    pub db_path: Option<String>,

    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default = "default_consumer_timeout_secs")]
    pub consumer_timeout_secs: u64,
    pub visibility_timeout_secs: Option<u64>,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default)]
    pub batch_window_secs: u64,
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_dead_letter_retention_secs")]
    pub dead_letter_retention_secs: u64,

    #[serde(default = "default_rate_limit")]
    pub rate_limit: u64,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    /// Key the rate limit on `X-Forwarded-For`. Only safe behind a proxy that sets it.
    #[serde(default)]
    pub trust_forwarded_for: bool,

    #[serde(default = "default_work_min_ms")]
    pub work_min_ms: u64,
    #[serde(default = "default_work_max_ms")]
    pub work_max_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    pub static_dir: Option<String>,
    #[serde(default)]
    pub admin_api: bool,
}

fn default_backend() -> Backend {
    Backend::Sqlite
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    8080
}

fn default_channels() -> Vec<String> {
    vec!["alpha".to_owned(), "beta".to_owned()]
}

fn default_source() -> String {
    "api-gateway".to_owned()
}

fn default_max_body_bytes() -> usize {
    crate::message::MAX_BODY_BYTES
}

fn default_consumer_timeout_secs() -> u64 {
    30
}

fn default_max_batch_size() -> usize {
    10
}

fn default_max_receive_count() -> u32 {
    3
}

fn default_retention_secs() -> u64 {
    4 * 24 * 60 * 60
}

fn default_dead_letter_retention_secs() -> u64 {
    14 * 24 * 60 * 60
}

fn default_rate_limit() -> u64 {
    2000
}

fn default_rate_limit_window_secs() -> u64 {
    300
}

fn default_work_min_ms() -> u64 {
    100
}

fn default_work_max_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("SLUICE_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("sluice.db")
    }

    pub fn consumer_timeout(&self) -> Duration {
        Duration::from_secs(self.consumer_timeout_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn work_latency(&self) -> (Duration, Duration) {
        let min = self.work_min_ms.min(self.work_max_ms);
        (
            Duration::from_millis(min),
            Duration::from_millis(self.work_max_ms),
        )
    }

    pub fn queue_policy(&self) -> QueuePolicy {
        let batch_window = Duration::from_secs(self.batch_window_secs);
        let mut policy = QueuePolicy::for_consumer_timeout(self.consumer_timeout());

        // Without an explicit value, messages also stay hidden while their batch fills.
        policy.visibility_timeout = match self.visibility_timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => policy.visibility_timeout.saturating_add(batch_window),
        };

        QueuePolicy {
            max_receive_count: self.max_receive_count,
            retention: Duration::from_secs(self.retention_secs),
            dead_letter_retention: Duration::from_secs(self.dead_letter_retention_secs),
            max_batch_size: self.max_batch_size,
            batch_window,
            ..policy
        }
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            db_path: None,
            host: default_host(),
            port: default_port(),
            channels: default_channels(),
            source: default_source(),
            max_body_bytes: default_max_body_bytes(),
            consumer_timeout_secs: default_consumer_timeout_secs(),
            visibility_timeout_secs: None,
            max_batch_size: default_max_batch_size(),
            batch_window_secs: 0,
            max_receive_count: default_max_receive_count(),
            retention_secs: default_retention_secs(),
            dead_letter_retention_secs: default_dead_letter_retention_secs(),
            rate_limit: default_rate_limit(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            trust_forwarded_for: false,
            work_min_ms: default_work_min_ms(),
            work_max_ms: default_work_max_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            static_dir: None,
            admin_api: false,
        }
    }
}
