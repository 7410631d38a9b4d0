//! Configuration management for Windgate.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, WindgateError};
use crate::ratelimit::{
    ApiKeyExtractor, FailurePolicy, KeyExtractor, LimiterConfig, PeerIpExtractor, WindowAlgorithm,
    DEFAULT_KEY_PREFIX, MAX_WINDOW,
};

/// Prefix for environment overrides, e.g. `WINDGATE__RATE_LIMITING__MAX_REQUESTS`.
pub const ENV_PREFIX: &str = "WINDGATE";

/// Main configuration for the Windgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Window store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            log_format: LogFormat::default(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Where client identities come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// Forwarded-for headers, then the peer address
    #[default]
    PeerIp,
    /// `X-API-Key` or bearer token, then the peer address
    ApiKey,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Sliding window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Admitted requests per window per key
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    #[serde(default)]
    pub algorithm: WindowAlgorithm,

    /// Behaviour when the store is unreachable
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default)]
    pub key_source: KeySource,

    /// Forwarding headers trusted to name the client, in order
    #[serde(default = "default_trusted_headers")]
    pub trusted_headers: Vec<String>,

    /// Upper bound on a store round-trip in milliseconds
    #[serde(default)]
    pub store_timeout_ms: Option<u64>,

    /// Paths that bypass the limiter
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_requests: default_max_requests(),
            algorithm: WindowAlgorithm::default(),
            failure_policy: FailurePolicy::default(),
            key_source: KeySource::default(),
            trusted_headers: default_trusted_headers(),
            store_timeout_ms: None,
            exempt_paths: default_exempt_paths(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_requests() -> u64 {
    100
}

fn default_trusted_headers() -> Vec<String> {
    vec!["x-forwarded-for".to_string(), "x-real-ip".to_string()]
}

fn default_exempt_paths() -> Vec<String> {
    vec!["/health".to_string()]
}

/// Which window store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Window store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How often the in-process store sweeps idle keys
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Idle time past the window before a key may be reclaimed
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            sweep_interval_secs: default_sweep_interval(),
            grace_secs: default_grace_secs(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_grace_secs() -> u64 {
    5
}

impl StoreConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

impl WindgateConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| WindgateError::Config(e.to_string()))
    }

    /// Load an optional YAML file layered under `WINDGATE__*` environment overrides.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            let path = path.as_ref();
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let config: WindgateConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Reject settings that can never work.
    pub fn validate(&self) -> Result<()> {
        self.limiter_config()?;

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(WindgateError::InvalidConfiguration(
                "store.redis_url is required for the redis backend".to_string(),
            ));
        }
        if self.store.grace() > MAX_WINDOW {
            return Err(WindgateError::InvalidConfiguration(format!(
                "store.grace_secs must be at most {}",
                MAX_WINDOW.as_secs()
            )));
        }

        Ok(())
    }

    /// Limiter settings described by this configuration.
    pub fn limiter_config(&self) -> Result<LimiterConfig> {
        let rl = &self.rate_limiting;
        if rl.window_secs == 0 {
            return Err(WindgateError::InvalidConfiguration(
                "rate_limiting.window_secs must be greater than zero".to_string(),
            ));
        }

        let mut config = LimiterConfig::per_seconds(rl.max_requests, rl.window_secs)?
            .with_algorithm(rl.algorithm)
            .with_failure_policy(rl.failure_policy);
        if let Some(ms) = rl.store_timeout_ms {
            config = config.with_store_timeout(Duration::from_millis(ms));
        }
        Ok(config)
    }

    /// Key extractor described by this configuration.
    pub fn key_extractor(&self) -> Arc<dyn KeyExtractor> {
        let headers = self.rate_limiting.trusted_headers.iter().cloned();
        let peer = PeerIpExtractor::with_headers(headers);
        match self.rate_limiting.key_source {
            KeySource::PeerIp => Arc::new(peer),
            KeySource::ApiKey => Arc::new(ApiKeyExtractor::new(peer)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WindgateConfig::default();
        assert_eq!(config.server.http_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.server.log_format, LogFormat::Text);
        assert_eq!(config.rate_limiting.window_secs, 60);
        assert_eq!(config.rate_limiting.max_requests, 100);
        assert_eq!(config.rate_limiting.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(config.rate_limiting.algorithm, WindowAlgorithm::SlidingLog);
        assert_eq!(config.rate_limiting.exempt_paths, vec!["/health"]);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.key_prefix, "windgate:");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:9000"
  log_format: json
rate_limiting:
  window_secs: 30
  max_requests: 5
  algorithm: fixed_window
  failure_policy: fail_closed
  key_source: api_key
  store_timeout_ms: 250
store:
  backend: redis
  redis_url: "redis://127.0.0.1:6379"
"#;
        let config = WindgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.server.log_format, LogFormat::Json);
        assert_eq!(config.rate_limiting.key_source, KeySource::ApiKey);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.sweep_interval_secs, 30);

        let limiter = config.limiter_config().unwrap();
        assert_eq!(limiter.max_requests(), 5);
        assert_eq!(limiter.window_duration(), Duration::from_secs(30));
        assert_eq!(limiter.algorithm(), WindowAlgorithm::FixedWindow);
        assert_eq!(limiter.failure_policy(), FailurePolicy::FailClosed);
        assert_eq!(limiter.store_timeout(), Some(Duration::from_millis(250)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = WindgateConfig::from_yaml("rate_limiting:\n  max_requests: 0\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(WindgateError::InvalidConfiguration(_))
        ));

        let config = WindgateConfig::from_yaml("rate_limiting:\n  window_secs: 0\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(WindgateError::InvalidConfiguration(_))
        ));

        let config = WindgateConfig::from_yaml("store:\n  backend: redis\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(WindgateError::InvalidConfiguration(_))
        ));

        let yaml = "rate_limiting:\n  window_secs: 18446744073709551\n";
        let config = WindgateConfig::from_yaml(yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(WindgateError::InvalidConfiguration(_))
        ));

        let yaml = "store:\n  grace_secs: 18446744073709551615\n";
        let config = WindgateConfig::from_yaml(yaml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(WindgateError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_unknown_policy_is_a_parse_error() {
        let result = WindgateConfig::from_yaml("rate_limiting:\n  failure_policy: sometimes\n");
        assert!(matches!(result, Err(WindgateError::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = WindgateConfig::from_file("/nonexistent/windgate.yaml");
        assert!(matches!(result, Err(WindgateError::Io(_))));
    }

    #[test]
    fn test_load_layers_environment_over_file() {
        let path = std::env::temp_dir().join(format!("windgate-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "rate_limiting:\n  window_secs: 10\n  max_requests: 3\n").unwrap();

        std::env::set_var("WINDGATE__RATE_LIMITING__MAX_REQUESTS", "42");
        let config = WindgateConfig::load(Some(&path)).unwrap();
        std::env::remove_var("WINDGATE__RATE_LIMITING__MAX_REQUESTS");
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.rate_limiting.window_secs, 10);
        assert_eq!(config.rate_limiting.max_requests, 42);
        assert_eq!(config.rate_limiting.exempt_paths, vec!["/health"]);
    }
}
