//! Configuration management for connectors.

use crate::retry::{Backoff, RetryBudget};
use crate::traits::DeliveryPolicy;
use crate::{ConnectorError, ConnectorResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Largest accepted send batch
pub const MAX_BATCH_SIZE: usize = 10_000;

/// Largest accepted listener concurrency
pub const MAX_CONCURRENCY: usize = 256;

/// Longest exponential delay table derived from `max_retries`
const MAX_DERIVED_SLOTS: u32 = 16;

/// Shape of a retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyKind {
    /// Attempt-bounded with a delay table
    #[default]
    Phased,
    /// Attempt-bounded and expiring after `duration_ms`
    Duration,
    /// Bounded by `timeout_ms` only, or unbounded with `indefinite`
    Timeout,
    Never,
    Always,
}

impl std::str::FromStr for RetryStrategyKind {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "phased" => Ok(Self::Phased),
            "duration" => Ok(Self::Duration),
            "timeout" => Ok(Self::Timeout),
            "never" => Ok(Self::Never),
            "always" => Ok(Self::Always),
            other => Err(ConnectorError::config(format!(
                "unknown retry strategy '{}'",
                other
            ))),
        }
    }
}

/// Retry budget settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub strategy: RetryStrategyKind,

    /// Maximum number of retries for failed operations
    pub max_retries: u32,

    /// Base backoff duration in milliseconds
    pub retry_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds, also the cap on any single sleep
    pub max_backoff_ms: u64,

    /// Explicit delay table; derived from the backoff settings when empty
    pub delays_ms: Vec<u64>,

    /// Window for the `duration` strategy
    pub duration_ms: u64,

    /// Window for the `timeout` strategy
    pub timeout_ms: u64,

    /// Never expire the `timeout` strategy
    pub indefinite: bool,

    /// Randomize each sleep
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyKind::Phased,
            max_retries: 3,
            retry_backoff_ms: 1000,
            max_backoff_ms: 30000,
            delays_ms: Vec::new(),
            duration_ms: 60_000,
            timeout_ms: 60_000,
            indefinite: false,
            jitter: false,
        }
    }
}

impl RetrySettings {
    /// Phased settings with an explicit delay table
    pub fn phased(max_retries: u32, delays_ms: Vec<u64>) -> Self {
        Self {
            max_retries,
            delays_ms,
            ..Default::default()
        }
    }

    /// The delay table: explicit slots, or `retry_backoff_ms * 2^n` capped at
    /// `max_backoff_ms`.
    pub fn delays(&self) -> Vec<Duration> {
        if !self.delays_ms.is_empty() {
            return self
                .delays_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect();
        }

        let slots = self.max_retries.clamp(1, MAX_DERIVED_SLOTS);
        (0..slots)
            .map(|n| {
                let ms = self
                    .retry_backoff_ms
                    .saturating_mul(1u64 << n)
                    .min(self.max_backoff_ms);
                Duration::from_millis(ms)
            })
            .collect()
    }

    /// Build a fresh budget. Time-bounded budgets start their window now.
    pub fn budget(&self) -> RetryBudget {
        match self.strategy {
            RetryStrategyKind::Phased => RetryBudget::phased(self.max_retries, self.delays()),
            RetryStrategyKind::Duration => RetryBudget::duration(
                self.max_retries,
                Duration::from_millis(self.duration_ms),
                self.delays(),
            ),
            RetryStrategyKind::Timeout if self.indefinite => RetryBudget::indefinite(self.delays()),
            RetryStrategyKind::Timeout => {
                RetryBudget::timeout(Duration::from_millis(self.timeout_ms), self.delays())
            }
            RetryStrategyKind::Never => RetryBudget::never(),
            RetryStrategyKind::Always => RetryBudget::always(
                self.delays().first().copied().unwrap_or(Duration::ZERO),
            ),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(Duration::from_millis(self.max_backoff_ms)).with_jitter(self.jitter)
    }

    pub fn validate(&self) -> ConnectorResult<()> {
        if self.max_retries > 100 {
            return Err(ConnectorError::config("max_retries too high (max 100)"));
        }
        if self.max_backoff_ms == 0 {
            return Err(ConnectorError::config("max_backoff_ms must be > 0"));
        }
        Ok(())
    }
}

/// Adapter pool settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Retries for transient connection failures
    pub connect_retry: RetrySettings,
}

/// Listener runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    /// Number of concurrent consumers
    pub max_concurrency: usize,

    pub delivery: DeliveryPolicy,

    /// Only run while this process holds the cluster-wide lease
    pub singleton: bool,

    /// Pause after a transient receive error
    pub receive_error_backoff_ms: u64,

    /// Retries for retryable sink failures
    pub sink_retry: RetrySettings,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            delivery: DeliveryPolicy::AtLeastOnce,
            singleton: false,
            receive_error_backoff_ms: 1000,
            sink_retry: RetrySettings::default(),
        }
    }
}

impl ListenerSettings {
    pub fn validate(&self) -> ConnectorResult<()> {
        if self.max_concurrency == 0 {
            return Err(ConnectorError::config("max_concurrency must be > 0"));
        }
        if self.max_concurrency > MAX_CONCURRENCY {
            return Err(ConnectorError::config(format!(
                "max_concurrency too high (max {})",
                MAX_CONCURRENCY
            )));
        }
        self.sink_retry.validate()
    }
}

/// Send runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendSettings {
    /// Commit in batches inside a transport transaction
    pub transactional: bool,

    /// Messages per transactional batch
    pub batch_size: usize,

    /// Largest message accepted for sending
    pub size_threshold_bytes: u64,
}

impl Default for SendSettings {
    fn default() -> Self {
        Self {
            transactional: false,
            batch_size: 100,
            size_threshold_bytes: 1024 * 1024, // 1MB
        }
    }
}

impl SendSettings {
    pub fn validate(&self) -> ConnectorResult<()> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConnectorError::config(format!(
                "batch_size must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }
        if self.size_threshold_bytes == 0 {
            return Err(ConnectorError::config("size_threshold_bytes must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingSettings {
    /// Log level
    pub log_level: String,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Main configuration for connectors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Connector name (must be unique)
    pub connector_name: String,

    /// Identifier of the pooled connection, used as the resource key id
    #[serde(default)]
    pub connection_id: Option<String>,

    /// Retry budget for operation calls
    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub listener: ListenerSettings,

    #[serde(default)]
    pub send: SendSettings,

    #[serde(default)]
    pub processing: ProcessingSettings,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

impl ConnectorConfig {
    pub fn new(connector_name: impl Into<String>) -> Self {
        Self {
            connector_name: connector_name.into(),
            ..Default::default()
        }
    }

    /// Connection id, falling back to the connector name
    pub fn connection_id(&self) -> &str {
        self.connection_id
            .as_deref()
            .unwrap_or(&self.connector_name)
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `CONNECTOR_NAME`: Required, unique connector name
    /// - `CONNECTION_ID`: Pooled connection id (default: connector name)
    /// - `RETRY_STRATEGY`: phased, duration, timeout, never, always (default: phased)
    /// - `MAX_RETRIES`: Maximum retries (default: 3)
    /// - `RETRY_BACKOFF_MS`: Base backoff in ms (default: 1000)
    /// - `MAX_BACKOFF_MS`: Max backoff in ms (default: 30000)
    /// - `MAX_CONCURRENCY`: Listener consumers (default: 1)
    /// - `DELIVERY_POLICY`: at_most_once or at_least_once (default: at_least_once)
    /// - `SINGLETON`: Singleton listener (default: false)
    /// - `TRANSACTIONAL`: Transactional sends (default: false)
    /// - `BATCH_SIZE`: Transactional batch size (default: 100)
    /// - `SIZE_THRESHOLD_BYTES`: Max message size (default: 1048576)
    /// - `LOG_LEVEL`: Log level (default: info)
    pub fn from_env() -> ConnectorResult<Self> {
        let connector_name = env::var("CONNECTOR_NAME")
            .map_err(|_| ConnectorError::config("CONNECTOR_NAME is required"))?;

        let mut config = Self::new(connector_name);
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> ConnectorResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConnectorError::config(format!("Failed to read config file {}: {}", path, e))
        })?;

        toml::from_str(&content).map_err(|e| {
            ConnectorError::config(format!("Failed to parse config file {}: {}", path, e))
        })
    }

    /// Layered load: optional TOML file, then `RELAY_`-prefixed environment
    /// variables with `__` between nesting levels (e.g. `RELAY_SEND__BATCH_SIZE`).
    pub fn load(path: Option<&str>) -> ConnectorResult<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::new(path, ::config::FileFormat::Toml));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| ConnectorError::config(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to core configuration
    pub fn apply_env_overrides(&mut self) -> ConnectorResult<()> {
        if let Ok(val) = env::var("CONNECTOR_NAME") {
            self.connector_name = val;
        }
        if let Ok(val) = env::var("CONNECTION_ID") {
            self.connection_id = Some(val);
        }
        if let Ok(val) = env::var("RETRY_STRATEGY") {
            self.retry.strategy = val.parse()?;
        }
        if let Some(n) = env_parse("MAX_RETRIES") {
            self.retry.max_retries = n;
        }
        if let Some(n) = env_parse("RETRY_BACKOFF_MS") {
            self.retry.retry_backoff_ms = n;
        }
        if let Some(n) = env_parse("MAX_BACKOFF_MS") {
            self.retry.max_backoff_ms = n;
        }
        if let Some(n) = env_parse("MAX_CONCURRENCY") {
            self.listener.max_concurrency = n;
        }
        if let Ok(val) = env::var("DELIVERY_POLICY") {
            self.listener.delivery = match val.to_lowercase().as_str() {
                "at_most_once" => DeliveryPolicy::AtMostOnce,
                "at_least_once" => DeliveryPolicy::AtLeastOnce,
                other => {
                    return Err(ConnectorError::config(format!(
                        "unknown delivery policy '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(b) = env_parse("SINGLETON") {
            self.listener.singleton = b;
        }
        if let Some(b) = env_parse("TRANSACTIONAL") {
            self.send.transactional = b;
        }
        if let Some(n) = env_parse("BATCH_SIZE") {
            self.send.batch_size = n;
        }
        if let Some(n) = env_parse("SIZE_THRESHOLD_BYTES") {
            self.send.size_threshold_bytes = n;
        }
        if let Ok(val) = env::var("LOG_LEVEL") {
            self.processing.log_level = val;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConnectorResult<()> {
        if self.connector_name.is_empty() {
            return Err(ConnectorError::config("connector_name cannot be empty"));
        }
        if self.connection_id.as_deref() == Some("") {
            return Err(ConnectorError::config("connection_id cannot be empty"));
        }

        self.retry.validate()?;
        self.pool.connect_retry.validate()?;
        self.listener.validate()?;
        self.send.validate()?;
        Ok(())
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connector_name: "default-connector".to_string(),
            connection_id: None,
            retry: RetrySettings::default(),
            pool: PoolSettings::default(),
            listener: ListenerSettings::default(),
            send: SendSettings::default(),
            processing: ProcessingSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // environment variables are process-wide
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_config_default() {
        let config = ConnectorConfig::default();
        assert_eq!(config.connector_name, "default-connector");
        assert_eq!(config.connection_id(), "default-connector");
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.send.batch_size, 100);
        assert_eq!(config.listener.delivery, DeliveryPolicy::AtLeastOnce);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ConnectorConfig::default();
        config.connector_name = "".to_string();
        assert!(config.validate().is_err());

        let mut config = ConnectorConfig::default();
        config.send.batch_size = 0;
        assert!(config.validate().is_err());
        config.send.batch_size = MAX_BATCH_SIZE + 1;
        assert!(config.validate().is_err());

        let mut config = ConnectorConfig::default();
        config.listener.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = ConnectorConfig::default();
        config.retry.max_retries = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_delays() {
        let settings = RetrySettings {
            max_retries: 6,
            retry_backoff_ms: 100,
            max_backoff_ms: 1000,
            ..Default::default()
        };
        let delays: Vec<u64> = settings.delays().iter().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);

        let explicit = RetrySettings::phased(5, vec![0, 1, 2]);
        assert_eq!(explicit.delays().len(), 3);
    }

    #[test]
    fn test_budget_selection() {
        let mut settings = RetrySettings::phased(2, vec![10]);
        assert!(matches!(settings.budget(), RetryBudget::Phased(_)));

        settings.strategy = RetryStrategyKind::Timeout;
        settings.indefinite = true;
        match settings.budget() {
            RetryBudget::Timeout(budget) => assert!(budget.is_indefinite()),
            other => panic!("unexpected budget {:?}", other),
        }

        settings.strategy = RetryStrategyKind::Never;
        assert!(!settings.budget().evaluate(1).should_retry);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
connector_name = "orders-listener"
connection_id = "jms-primary"

[listener]
max_concurrency = 4
delivery = "at_most_once"

[send]
transactional = true
batch_size = 50

[retry]
strategy = "timeout"
timeout_ms = 5000
"#
        )
        .unwrap();

        let config = ConnectorConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.connection_id(), "jms-primary");
        assert_eq!(config.listener.max_concurrency, 4);
        assert_eq!(config.listener.delivery, DeliveryPolicy::AtMostOnce);
        assert!(config.send.transactional);
        assert_eq!(config.send.batch_size, 50);
        assert_eq!(config.send.size_threshold_bytes, 1024 * 1024);
        assert_eq!(config.retry.strategy, RetryStrategyKind::Timeout);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_env() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        env::set_var("CONNECTOR_NAME", "env-connector");
        env::set_var("BATCH_SIZE", "25");
        env::set_var("DELIVERY_POLICY", "at_most_once");

        let config = ConnectorConfig::from_env().unwrap();
        assert_eq!(config.connector_name, "env-connector");
        assert_eq!(config.send.batch_size, 25);
        assert_eq!(config.listener.delivery, DeliveryPolicy::AtMostOnce);

        env::set_var("DELIVERY_POLICY", "sometimes");
        assert!(ConnectorConfig::from_env().is_err());

        env::remove_var("CONNECTOR_NAME");
        env::remove_var("BATCH_SIZE");
        env::remove_var("DELIVERY_POLICY");
    }

    #[test]
    fn test_layered_load() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "connector_name = \"layered\"\n[send]\nbatch_size = 10").unwrap();

        env::set_var("RELAY_SEND__BATCH_SIZE", "20");
        env::set_var("RELAY_LISTENER__MAX_CONCURRENCY", "4");
        let loaded = ConnectorConfig::load(file.path().to_str());
        env::remove_var("RELAY_SEND__BATCH_SIZE");
        env::remove_var("RELAY_LISTENER__MAX_CONCURRENCY");

        let config = loaded.unwrap();
        assert_eq!(config.connector_name, "layered");
        assert_eq!(config.send.batch_size, 20);
        assert_eq!(config.listener.max_concurrency, 4);
    }

    #[test]
    fn test_layered_load_top_level_key() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "connector_name = \"from-file\"").unwrap();

        env::set_var("RELAY_CONNECTOR_NAME", "from-env");
        let loaded = ConnectorConfig::load(file.path().to_str());
        env::remove_var("RELAY_CONNECTOR_NAME");

        assert_eq!(loaded.unwrap().connector_name, "from-env");
    }
}
