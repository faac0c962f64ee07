use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_SCHEMA: &str = include_str!("../../../config/config.schema.json");
const EXAMPLE_CONFIG: &str = include_str!("../../../config/example-config.yaml");

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
    pub backend: Backend,
    pub gitlab: Gitlab,
    pub http: Http,
    pub db: Db,
    #[serde(default)]
    pub watcher: Watcher,
    #[serde(default)]
    pub log: Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    pub addr: String,
    #[serde(default = "default_plugin_name")]
    pub plugin_name: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gitlab {
    #[serde(default = "default_gitlab_url")]
    pub url: String,
    pub token: String,
    pub project_id: String,
    pub webhook_secret: String,
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,
    #[serde(default = "default_gitlab_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicAuth {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Http {
    pub listen_addr: String,
    pub public_addr: String,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
    #[serde(default = "default_http_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Http {
    pub fn webhook_url(&self) -> String {
        format!("{}/webhook", self.public_addr.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Db {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Watcher {
    #[serde(default = "default_watch_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_watch_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
    #[serde(default = "default_watch_workers")]
    pub workers: usize,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for Watcher {
    fn default() -> Self {
        Self {
            ready_timeout_ms: default_watch_ready_timeout_ms(),
            handler_timeout_ms: default_watch_handler_timeout_ms(),
            workers: default_watch_workers(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    #[serde(default = "default_log_severity")]
    pub severity: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            severity: default_log_severity(),
        }
    }
}

fn default_plugin_name() -> String {
    "gitlab".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_gitlab_request_timeout_ms() -> u64 {
    5_000
}

fn default_gitlab_url() -> String {
    "https://gitlab.com".to_string()
}

fn default_label_prefix() -> String {
    "AccessBridge".to_string()
}

fn default_max_connections() -> usize {
    100
}

fn default_http_handler_timeout_ms() -> u64 {
    10_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_watch_ready_timeout_ms() -> u64 {
    5_000
}

fn default_watch_handler_timeout_ms() -> u64 {
    5_000
}

fn default_watch_workers() -> usize {
    4
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_log_severity() -> String {
    "info".to_string()
}

pub fn example_config() -> &'static str {
    EXAMPLE_CONFIG
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    parse_and_validate(&config_text)
}

pub fn parse_and_validate(config_text: &str) -> Result<Config, ConfigError> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(CONFIG_SCHEMA).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    for (field, value) in [
        ("backend.addr", cfg.backend.addr.as_str()),
        ("gitlab.url", cfg.gitlab.url.as_str()),
        ("http.public_addr", cfg.http.public_addr.as_str()),
    ] {
        if !(value.starts_with("http://") || value.starts_with("https://")) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "{field} must be an http:// or https:// URL, got {value}"
            )));
        }
    }
    if cfg.gitlab.token.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "gitlab.token must not be blank".to_string(),
        ));
    }
    if cfg.gitlab.webhook_secret.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "gitlab.webhook_secret must not be blank".to_string(),
        ));
    }
    if cfg.gitlab.label_prefix.contains(':') {
        return Err(ConfigError::UnsupportedConfig(
            "gitlab.label_prefix must not contain ':'".to_string(),
        ));
    }
    if cfg.watcher.workers == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "watcher.workers must be >= 1".to_string(),
        ));
    }
    if cfg.watcher.ready_timeout_ms == 0 || cfg.watcher.handler_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "watcher timeouts must be >= 1".to_string(),
        ));
    }
    if cfg.http.handler_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "http.handler_timeout_ms must be >= 1".to_string(),
        ));
    }
    // One tracker call must fit inside a webhook handler with time to spare.
    if cfg.http.handler_timeout_ms <= cfg.gitlab.request_timeout_ms {
        return Err(ConfigError::UnsupportedConfig(format!(
            "http.handler_timeout_ms={} must exceed gitlab.request_timeout_ms={}",
            cfg.http.handler_timeout_ms, cfg.gitlab.request_timeout_ms
        )));
    }
    if cfg.http.listen_addr.parse::<std::net::SocketAddr>().is_err() {
        return Err(ConfigError::UnsupportedConfig(format!(
            "http.listen_addr={} is not a socket address",
            cfg.http.listen_addr
        )));
    }
    Ok(())
}
