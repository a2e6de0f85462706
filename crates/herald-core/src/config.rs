use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, retry::RetryPolicy, store::RequeuePolicy};

pub const DEFAULT_TOPIC: &str = "publications.pending";
pub const DEFAULT_GROUP: &str = "publications-dispatch";
pub const DEFAULT_BROKERS: &str = "localhost:29092";
pub const DEFAULT_PLATFORM: &str = "Telegram";
pub const DEFAULT_PORT: u16 = 8080;

/// Top-level config (herald.toml + HERALD_* env overrides + KAFKA_BROKERS).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeraldConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between ticks. The first tick fires at startup.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Maximum destinations claimed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Delay window each worker waits before delivering.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Upper bound on concurrently running delivery workers.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Platform name whose credentials the workers resolve.
    #[serde(default = "default_platform")]
    pub platform: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_delay_ms(),
            max_concurrent: default_max_concurrent(),
            platform: default_platform(),
        }
    }
}

impl WorkerConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_claim_timeout_secs")]
    pub claim_timeout_secs: u64,
    #[serde(default = "default_redeliver_after_secs")]
    pub redeliver_after_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval_secs(),
            claim_timeout_secs: default_claim_timeout_secs(),
            redeliver_after_secs: default_redeliver_after_secs(),
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn policy(&self, retry: &RetryConfig) -> RequeuePolicy {
        RequeuePolicy {
            claim_timeout: Duration::from_secs(self.claim_timeout_secs),
            redeliver_after: Duration::from_secs(self.redeliver_after_secs),
            retry: retry.policy(),
        }
    }
}

/// Which event channel implementation carries publication events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelBackend {
    /// Durable log in a SQLite file. Survives restarts; single host.
    #[default]
    Sqlite,
    /// In-process only. Events are lost on exit.
    Memory,
    /// Apache Kafka (requires the `kafka` feature of `herald-channel`).
    Kafka,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub backend: ChannelBackend,
    /// Comma-separated broker addresses (Kafka backend).
    #[serde(default = "default_brokers")]
    pub brokers: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Consumer group; restarts resume from its committed offsets.
    #[serde(default = "default_group")]
    pub group: String,
    /// Partition count for the SQLite and memory backends.
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// Log file for the SQLite backend.
    #[serde(default = "default_channel_path")]
    pub path: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a publish may wait for the broker acknowledgement.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            backend: ChannelBackend::default(),
            brokers: default_brokers(),
            topic: default_topic(),
            group: default_group(),
            partitions: default_partitions(),
            path: default_channel_path(),
            poll_interval_ms: default_poll_interval_ms(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl ChannelConfig {
    /// Broker addresses, trimmed, empties dropped, falling back to the local default.
    pub fn broker_list(&self) -> Vec<String> {
        let brokers: Vec<String> = self
            .brokers
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(String::from)
            .collect();
        if brokers.is_empty() {
            vec![DEFAULT_BROKERS.to_string()]
        } else {
            brokers
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Serve the HTTP CRUD surface alongside the pipeline.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Bound on the wait for in-flight workers during shutdown.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn bool_true() -> bool {
    true
}
fn default_interval_secs() -> u64 {
    60
}
fn default_batch_size() -> usize {
    100
}
fn default_delay_ms() -> u64 {
    10_000
}
fn default_max_concurrent() -> usize {
    16
}
fn default_platform() -> String {
    DEFAULT_PLATFORM.to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    2_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_reaper_interval_secs() -> u64 {
    60
}
fn default_claim_timeout_secs() -> u64 {
    300
}
fn default_redeliver_after_secs() -> u64 {
    900
}
fn default_brokers() -> String {
    DEFAULT_BROKERS.to_string()
}
fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}
fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}
fn default_partitions() -> u32 {
    3
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_send_timeout_ms() -> u64 {
    5_000
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_shutdown_timeout_secs() -> u64 {
    30
}
fn default_db_path() -> String {
    format!("{}/herald.db", herald_home())
}
fn default_channel_path() -> String {
    format!("{}/channel.db", herald_home())
}

fn herald_home() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.herald", home)
}

fn default_config_path() -> String {
    format!("{}/herald.toml", herald_home())
}

impl HeraldConfig {
    /// Load config from a TOML file with environment overrides.
    ///
    /// File lookup: explicit path, then `~/.herald/herald.toml` (missing files
    /// are skipped). `HERALD_SECTION__KEY` overrides any key;
    /// `KAFKA_BROKERS` overrides `channel.brokers`.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let figment = Figment::from(Serialized::defaults(HeraldConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HERALD_").split("__"))
            .merge(
                Env::raw()
                    .only(&["KAFKA_BROKERS"])
                    .map(|_| "channel.brokers".into()),
            );
        Self::from_figment(figment)
    }

    /// Extract from an already assembled figment.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject reaper windows the requeue sweep would close on work still in
    /// flight, which would lead to duplicate sends.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let claim_timeout = Duration::from_secs(self.reaper.claim_timeout_secs);
        if claim_timeout <= self.channel.send_timeout() {
            return Err(ConfigError::Invalid(format!(
                "reaper.claim_timeout_secs ({claim_timeout:?}) must exceed channel.send_timeout_ms ({:?})",
                self.channel.send_timeout()
            )));
        }

        let delivery_budget = self.worker.delay() + self.retry.policy().total_backoff();
        let redeliver_after = Duration::from_secs(self.reaper.redeliver_after_secs);
        if redeliver_after <= delivery_budget {
            return Err(ConfigError::Invalid(format!(
                "reaper.redeliver_after_secs ({redeliver_after:?}) must exceed the worker delay \
                 plus retry backoff ({delivery_budget:?})"
            )));
        }
        Ok(())
    }
}
