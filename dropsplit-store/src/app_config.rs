use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub queue: QueueConfig,
    pub platform: PlatformConfig,
    pub processor: ProcessorConfig,
    pub rates: RatesConfig,
    pub routing: RoutingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    /// Leave unset to quote without a cache.
    pub url: Option<String>,
    #[serde(default = "default_quote_ttl")]
    pub quote_ttl_seconds: u64,
}

fn default_quote_ttl() -> u64 { 60 }

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub jobs_topic: String,
    pub group_id: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Kafka,
    Local,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub capacity: usize,
    pub workers: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlatformConfig {
    pub api_version: String,
    /// Shared secret the platform signs webhooks with.
    pub app_secret: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessorConfig {
    pub api_base: String,
    pub secret_key: String,
    pub webhook_secret: String,
    pub signature_tolerance_seconds: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RatesConfig {
    pub supplier_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoutingConfig {
    pub default_service_code: String,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Untracked developer overrides
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `DROPSPLIT__PROCESSOR__WEBHOOK_SECRET=whsec_...`
            .add_source(config::Environment::with_prefix("DROPSPLIT").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
