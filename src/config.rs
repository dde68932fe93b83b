use crate::error::ObserverError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub observer: ObserverConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
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

/// Everything the observation pipeline reads; treated as immutable once started
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ObserverConfig {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default = "default_true")]
    pub enable_request_logging: bool,
    #[serde(default = "default_true")]
    pub enable_runtime_logs: bool,
    #[serde(default = "default_true")]
    pub enable_exceptions: bool,
    #[serde(default = "default_true")]
    pub enable_request_body: bool,
    #[serde(default = "default_true")]
    pub enable_response_body: bool,
    /// Bodies larger than this are kept as truncated text
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Exact request paths that bypass capture
    #[serde(default = "default_exclude_paths")]
    pub exclude_paths: BTreeSet<String>,
    /// Methods that bypass capture (compared upper-cased)
    #[serde(default)]
    pub exclude_methods: BTreeSet<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enable_request_logging: true,
            enable_runtime_logs: true,
            enable_exceptions: true,
            enable_request_body: true,
            enable_response_body: true,
            max_body_bytes: default_max_body_bytes(),
            exclude_paths: default_exclude_paths(),
            exclude_methods: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedactionConfig {
    /// Header names to mask (case-insensitive)
    #[serde(default = "default_mask_headers")]
    pub mask_headers: BTreeSet<String>,
    /// Body, query and log payload field names to mask (case-insensitive)
    #[serde(default = "default_mask_body_fields")]
    pub mask_body_fields: BTreeSet<String>,
    #[serde(default = "default_mask_token")]
    pub mask_token: String,
    /// Replace non-structured bodies wholesale instead of passing them through
    #[serde(default)]
    pub mask_unstructured_bodies: bool,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            mask_headers: default_mask_headers(),
            mask_body_fields: default_mask_body_fields(),
            mask_token: default_mask_token(),
            mask_unstructured_bodies: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LiveConfig {
    #[serde(default = "default_hits_capacity")]
    pub hits_capacity: usize,
    #[serde(default = "default_logs_capacity")]
    pub logs_capacity: usize,
    #[serde(default = "default_exceptions_capacity")]
    pub exceptions_capacity: usize,
    /// Durations kept per endpoint for min/max/mean/percentiles
    #[serde(default = "default_stats_window")]
    pub stats_window: usize,
    /// Durations older than this leave the window; 0 disables age-based expiry
    #[serde(default)]
    pub stats_max_age_secs: u64,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            hits_capacity: default_hits_capacity(),
            logs_capacity: default_logs_capacity(),
            exceptions_capacity: default_exceptions_capacity(),
            stats_window: default_stats_window(),
            stats_max_age_secs: 0,
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Durable handoff queue bound; the oldest queued event is dropped when full
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Refill the live rings from the most recent durable events on start
    #[serde(default = "default_true")]
    pub rehydrate: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_path: default_database_path(),
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            rehydrate: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_exclude_paths() -> BTreeSet<String> {
    ["/health", "/healthz", "/ready", "/metrics", "/favicon.ico"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_mask_headers() -> BTreeSet<String> {
    ["authorization", "x-api-key", "cookie", "set-cookie"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_mask_body_fields() -> BTreeSet<String> {
    [
        "password",
        "secret",
        "token",
        "api_key",
        "apikey",
        "access_token",
        "refresh_token",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_mask_token() -> String {
    "***".to_string()
}

fn default_hits_capacity() -> usize {
    100
}

fn default_logs_capacity() -> usize {
    1000
}

fn default_exceptions_capacity() -> usize {
    100
}

fn default_stats_window() -> usize {
    1000
}

fn default_subscriber_buffer() -> usize {
    1024
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/request_lens.db")
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval_ms() -> u64 {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

impl ObserverConfig {
    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ObserverError> {
        let live = &self.live;
        if live.hits_capacity == 0 || live.logs_capacity == 0 || live.exceptions_capacity == 0 {
            return Err(ObserverError::Config(
                "ring buffer capacities must be greater than zero".to_string(),
            ));
        }
        if live.stats_window == 0 {
            return Err(ObserverError::Config("stats_window must be greater than zero".to_string()));
        }
        if live.subscriber_buffer == 0 {
            return Err(ObserverError::Config(
                "subscriber_buffer must be greater than zero".to_string(),
            ));
        }

        let storage = &self.storage;
        if storage.batch_size == 0 {
            return Err(ObserverError::Config("batch_size must be greater than zero".to_string()));
        }
        if storage.queue_capacity < storage.batch_size {
            return Err(ObserverError::Config(format!(
                "queue_capacity ({}) must be at least batch_size ({})",
                storage.queue_capacity, storage.batch_size
            )));
        }
        if storage.flush_interval_ms == 0 {
            return Err(ObserverError::Config(
                "flush_interval_ms must be greater than zero".to_string(),
            ));
        }

        if self.redaction.mask_token.is_empty() {
            return Err(ObserverError::Config("mask_token cannot be empty".to_string()));
        }

        if let Some(path) = self.capture.exclude_paths.iter().find(|p| !p.starts_with('/')) {
            return Err(ObserverError::Config(format!(
                "exclude path '{}' must start with '/'",
                path
            )));
        }

        Ok(())
    }
}

/// Load configuration from `path` (optional) layered under `REQUEST_LENS__*` env vars
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(
            config::Environment::with_prefix("REQUEST_LENS")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("observer.capture.exclude_paths")
                .with_list_parse_key("observer.capture.exclude_methods")
                .with_list_parse_key("observer.redaction.mask_headers")
                .with_list_parse_key("observer.redaction.mask_body_fields"),
        )
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if cfg.server.host.is_empty() {
        anyhow::bail!("Server host cannot be empty");
    }

    cfg.observer.validate()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert_ok!(validate_config(&cfg));
        assert_eq!(cfg.observer.live.hits_capacity, 100);
        assert_eq!(cfg.observer.live.logs_capacity, 1000);
        assert_eq!(cfg.observer.redaction.mask_token, "***");
        assert!(cfg.observer.capture.exclude_paths.contains("/health"));
        assert!(cfg.observer.redaction.mask_headers.contains("authorization"));
    }

    #[test]
    fn test_validate_config_rejects_zero_capacity() {
        let mut cfg = create_test_config();
        cfg.observer.live.hits_capacity = 0;

        let result = validate_config(&cfg);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("capacities"));
    }

    #[test]
    fn test_validate_config_rejects_small_queue() {
        let mut cfg = create_test_config();
        cfg.observer.storage.queue_capacity = 10;
        cfg.observer.storage.batch_size = 50;

        let result = validate_config(&cfg);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("queue_capacity"));
    }

    #[test]
    fn test_validate_config_rejects_relative_exclude_path() {
        let mut cfg = create_test_config();
        cfg.observer.capture.exclude_paths.insert("health".to_string());

        assert_err!(validate_config(&cfg));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9000

[observer.capture]
exclude_paths = ["/status"]
max_body_bytes = 128

[observer.storage]
enabled = false
"#
        )
        .unwrap();

        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.observer.capture.max_body_bytes, 128);
        assert!(cfg.observer.capture.exclude_paths.contains("/status"));
        assert!(!cfg.observer.capture.exclude_paths.contains("/health"));
        assert!(!cfg.observer.storage.enabled);
        assert_eq!(cfg.observer.live.hits_capacity, 100);
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert!(cfg.observer.storage.enabled);
    }

    fn create_test_config() -> Config {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            observer: ObserverConfig::default(),
        }
    }
}
