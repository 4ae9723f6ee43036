//! Configuration loading and representation.
//!
//! Sources, lowest precedence first: built-in defaults, an optional
//! `hasty.toml` in the working directory, then
//! `HASTY__SECTION__KEY` environment variables. A `.env` file is loaded into
//! the environment first when present.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use hasty_events::{DeliverPolicy, RetryPolicy, SubscriptionOptions};
use hasty_jobs::{CooldownPolicy, ReadmissionMode, SleepPolicy, Subject};

use crate::jobs::AdmissionRules;
use crate::workers::LifecycleWorkerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Absent: in-memory job store.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Absent: in-memory bus (single-process dev mode).
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    #[serde(default)]
    pub admission: AdmissionConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,

    /// Stream keys are `<prefix>:<subject>`
    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    #[serde(default)]
    pub readmission: ReadmissionMode,

    /// Upper bound on admission + publish for one HTTP request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            readmission: ReadmissionMode::default(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_min_sleep_secs")]
    pub min_sleep_secs: u32,

    #[serde(default = "default_max_sleep_secs")]
    pub max_sleep_secs: u32,

    #[serde(default = "default_ceiling_secs")]
    pub ceiling_secs: u64,

    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,

    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default = "default_queue_group")]
    pub queue_group: String,

    #[serde(default = "default_durable_name")]
    pub durable_name: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            min_sleep_secs: default_min_sleep_secs(),
            max_sleep_secs: default_max_sleep_secs(),
            ceiling_secs: default_ceiling_secs(),
            ack_wait_secs: default_ack_wait_secs(),
            max_deliveries: default_max_deliveries(),
            max_in_flight: default_max_in_flight(),
            queue_group: default_queue_group(),
            durable_name: default_durable_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// JSON log lines (otherwise human-readable)
    #[serde(default = "default_json")]
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json: default_json(),
        }
    }
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 9090 }
fn default_max_connections() -> u32 { 10 }
fn default_stream_prefix() -> String { "hasty".to_string() }
fn default_cooldown_secs() -> u64 { hasty_jobs::policy::DEFAULT_COOLDOWN_SECS }
fn default_request_timeout_ms() -> u64 { 800 }
fn default_min_sleep_secs() -> u32 { hasty_jobs::policy::DEFAULT_MIN_SLEEP_SECS }
fn default_max_sleep_secs() -> u32 { hasty_jobs::policy::DEFAULT_MAX_SLEEP_SECS }
fn default_ceiling_secs() -> u64 { 46 }
fn default_ack_wait_secs() -> u64 { 50 }
fn default_max_deliveries() -> u32 { 5 }
fn default_max_in_flight() -> usize { 64 }
fn default_queue_group() -> String { "hasty-jobs".to_string() }
fn default_durable_name() -> String { "hasty-jobs-durable".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_json() -> bool { true }

const ENV_PREFIX: &str = "HASTY";

impl AppConfig {
    /// Load from `.env`, an optional `hasty.toml`, and `HASTY__*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::build(config::File::with_name("hasty").required(false))
    }

    fn build(
        file: config::File<config::FileSourceFile, config::FileFormat>,
    ) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let cfg: AppConfig = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Cross-field checks the deserializer cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sleep_policy()?;

        let lc = &self.lifecycle;
        if lc.ack_wait_secs <= lc.ceiling_secs {
            return Err(ConfigError::Invalid(format!(
                "lifecycle.ack_wait_secs ({}) must exceed lifecycle.ceiling_secs ({})",
                lc.ack_wait_secs, lc.ceiling_secs
            )));
        }
        if lc.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "lifecycle.max_in_flight must be at least 1".to_string(),
            ));
        }
        if lc.queue_group.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "lifecycle.queue_group must not be empty".to_string(),
            ));
        }
        if self.admission.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "admission.request_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("server address: {e}")))
    }

    pub fn cooldown_policy(&self) -> CooldownPolicy {
        CooldownPolicy::from_secs(self.admission.cooldown_secs)
    }

    pub fn admission_rules(&self) -> AdmissionRules {
        AdmissionRules {
            cooldown: self.cooldown_policy(),
            readmission: self.admission.readmission,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.admission.request_timeout_ms)
    }

    pub fn sleep_policy(&self) -> Result<SleepPolicy, ConfigError> {
        let lc = &self.lifecycle;
        SleepPolicy::new(
            lc.min_sleep_secs,
            lc.max_sleep_secs,
            Duration::from_secs(lc.ceiling_secs),
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Durable queue-group subscription the workers share for `job:created`.
    pub fn created_subscription(&self) -> SubscriptionOptions {
        let lc = &self.lifecycle;
        SubscriptionOptions::new(Subject::Created.as_str(), lc.queue_group.clone())
            .durable(lc.durable_name.clone())
            .ack_wait(Duration::from_secs(lc.ack_wait_secs))
            .deliver(DeliverPolicy::All)
            .max_deliveries(lc.max_deliveries)
    }

    pub fn worker_config(&self) -> LifecycleWorkerConfig {
        LifecycleWorkerConfig {
            created: self.created_subscription(),
            max_in_flight: self.lifecycle.max_in_flight,
        }
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.lifecycle.ack_wait_secs)
    }

    /// Publish retries for the request path; fits inside the request timeout.
    pub fn publish_retry(&self) -> RetryPolicy {
        let budget = self.request_timeout();
        RetryPolicy {
            max_retries: 2,
            base_backoff: budget / 16,
            max_backoff: budget / 4,
            ..RetryPolicy::default()
        }
    }
}
