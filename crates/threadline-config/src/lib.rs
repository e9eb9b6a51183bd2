use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    /// Leading segment of every cache key, e.g. `prod` or `staging`.
    pub environment: String,
    pub store: Store,
    pub cache: Cache,
    #[serde(default)]
    pub stream: Stream,
    #[serde(default)]
    pub ingest: Ingest,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub leads: Leads,
    #[serde(default)]
    pub routing: Routing,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// `redis` or `none`.
    pub backend: String,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_cache_op_timeout_ms")]
    pub op_timeout_ms: u64,
    #[serde(default = "default_cache_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_cache_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_window_ttl_secs")]
    pub window_ttl_secs: u64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_lead_ttl_secs")]
    pub lead_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ingest {
    #[serde(default = "default_ingest_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    #[serde(default = "default_context_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_context_max_chars")]
    pub max_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leads {
    #[serde(default = "default_auto_create")]
    pub auto_create: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Routing {
    /// Dealership-owned numbers mapped to the organization that owns them.
    #[serde(default)]
    pub numbers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for Stream {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for Ingest {
    fn default() -> Self {
        Self {
            timeout_ms: default_ingest_timeout_ms(),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self {
            max_turns: default_context_max_turns(),
            max_chars: default_context_max_chars(),
        }
    }
}

impl Default for Leads {
    fn default() -> Self {
        Self {
            auto_create: default_auto_create(),
        }
    }
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            filter: default_log_filter(),
        }
    }
}

fn default_cache_op_timeout_ms() -> u64 {
    250
}

fn default_cache_reconnect_interval_ms() -> u64 {
    5_000
}

fn default_cache_sweep_interval_ms() -> u64 {
    60_000
}

fn default_window_ttl_secs() -> u64 {
    6 * 60 * 60
}

fn default_window_size() -> usize {
    50
}

fn default_lead_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_heartbeat_interval_ms() -> u64 {
    25_000
}

fn default_idle_timeout_ms() -> u64 {
    60 * 60 * 1000
}

fn default_channel_capacity() -> usize {
    64
}

fn default_ingest_timeout_ms() -> u64 {
    10_000
}

fn default_context_max_turns() -> usize {
    20
}

fn default_context_max_chars() -> usize {
    4_000
}

fn default_auto_create() -> bool {
    true
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

/// Checks the schema cannot express: cross-field requirements and values
/// this build does not implement.
pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.environment.trim().is_empty() || cfg.environment.contains(':') {
        return Err(ConfigError::UnsupportedConfig(
            "environment must be non-empty and must not contain ':'".to_string(),
        ));
    }
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    match cfg.cache.backend.as_str() {
        "none" => {}
        "redis" => {
            if cfg
                .cache
                .redis_url
                .as_ref()
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
            {
                return Err(ConfigError::UnsupportedConfig(
                    "cache.redis_url is required when cache.backend=redis".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "cache.backend={other} is not implemented; supported: redis, none"
            )));
        }
    }
    if cfg.cache.op_timeout_ms == 0 || cfg.cache.reconnect_interval_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "cache.op_timeout_ms and cache.reconnect_interval_ms must be >= 1".to_string(),
        ));
    }
    if cfg.cache.sweep_interval_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "cache.sweep_interval_ms must be >= 1".to_string(),
        ));
    }
    if cfg.cache.window_size == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "cache.window_size must be >= 1".to_string(),
        ));
    }
    if cfg.stream.heartbeat_interval_ms == 0 || cfg.stream.channel_capacity == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "stream.heartbeat_interval_ms and stream.channel_capacity must be >= 1".to_string(),
        ));
    }
    if cfg.stream.idle_timeout_ms < cfg.stream.heartbeat_interval_ms {
        return Err(ConfigError::UnsupportedConfig(
            "stream.idle_timeout_ms must be >= stream.heartbeat_interval_ms".to_string(),
        ));
    }
    if cfg.ingest.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "ingest.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.logging.format != "json" && cfg.logging.format != "pretty" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "logging.format={} is not implemented; supported: json, pretty",
            cfg.logging.format
        )));
    }
    for (number, org) in &cfg.routing.numbers {
        if org.trim().is_empty() {
            return Err(ConfigError::UnsupportedConfig(format!(
                "routing.numbers[{number}] maps to an empty organization"
            )));
        }
    }
    Ok(())
}
