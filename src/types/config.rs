//! Configuration types for the event bus and the service shell.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BusError, Result};
use crate::{
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_PORT, DEFAULT_SHUTDOWN_GRACE_PERIOD_MS,
    DEFAULT_SHUTDOWN_TIMEOUT_MS,
};

/// Broker backends the bus knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Kafka through librdkafka
    Kafka,
    /// Process-local broker, for tests and local development
    Memory,
    /// Recognized but not implemented
    CloudPubsub,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kafka => "kafka",
            Self::Memory => "memory",
            Self::CloudPubsub => "cloud-pubsub",
        }
    }

    /// Whether a provider implementation exists for this kind.
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::CloudPubsub)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "kafka" => Ok(Self::Kafka),
            "memory" | "in-memory" => Ok(Self::Memory),
            "cloud-pubsub" => Ok(Self::CloudPubsub),
            other => Err(BusError::UnsupportedProvider(other.to_string())),
        }
    }
}

/// Deployment environment of the running service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppEnvironment {
    Local,
    Development,
    Staging,
    Production,
    Test,
}

impl AppEnvironment {
    /// Development environments expose every subscriber over HTTP.
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Local | Self::Development)
    }
}

impl FromStr for AppEnvironment {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "local" => Self::Local,
            "development" | "dev" => Self::Development,
            "staging" => Self::Staging,
            "test" => Self::Test,
            _ => Self::Production,
        })
    }
}

/// Which halves of the service this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    All,
    Webserver,
    Worker,
}

impl ServerMode {
    /// Whether subscribers are attached in this mode.
    pub fn runs_workers(&self) -> bool {
        matches!(self, Self::All | Self::Worker)
    }
}

impl FromStr for ServerMode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "webserver" => Self::Webserver,
            "worker" => Self::Worker,
            _ => Self::All,
        })
    }
}

/// SASL mechanisms supported by the Kafka client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    /// Value for librdkafka's `sasl.mechanisms`.
    pub fn as_librdkafka(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

impl FromStr for SaslMechanism {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "plain" => Ok(Self::Plain),
            "scram-sha-256" => Ok(Self::ScramSha256),
            "scram-sha-512" => Ok(Self::ScramSha512),
            other => Err(BusError::Configuration(format!(
                "unsupported kafka authentication method: {other}"
            ))),
        }
    }
}

/// Broker credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct SaslAuth {
    pub mechanism: SaslMechanism,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SaslAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslAuth")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Global event bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Broker backend
    pub provider: ProviderKind,

    /// Service identity: consumer group prefix and `origin` header
    pub group_id: String,

    /// Comma-separated broker list
    pub connection_string: Option<String>,

    /// Broker credentials, if the cluster requires them
    pub sasl: Option<SaslAuth>,

    /// Whether to connect over TLS
    pub use_ssl: bool,

    pub environment: AppEnvironment,

    pub server_mode: ServerMode,

    /// HTTP port for health and subscriber endpoints
    pub port: u16,

    /// Liveness signal period while a handler runs
    pub heartbeat_interval: Duration,

    /// Upper bound for disconnecting the bus at shutdown
    pub shutdown_timeout: Duration,

    /// Wait before cleanup starts, so health checks observe the drain
    pub shutdown_grace_period: Duration,
}

/// Raw settings as they come out of the config sources.
///
/// Field names match the lowercased environment variable names.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSettings {
    service_name: Option<String>,
    event_bus_provider: Option<String>,
    kafka_broker_url: Option<String>,
    kafka_authentication_method: Option<String>,
    kafka_broker_username: Option<String>,
    kafka_broker_password: Option<String>,
    kafka_use_ssl: Option<bool>,
    app_env: Option<String>,
    server_mode: Option<String>,
    app_port: Option<u16>,
    heartbeat_interval_ms: Option<u64>,
    shutdown_timeout: Option<u64>,
    shutdown_grace_period: Option<u64>,
}

impl BusConfig {
    /// Create a configuration with defaults for everything but the provider and identity.
    pub fn new(provider: ProviderKind, group_id: impl Into<String>) -> Self {
        Self {
            provider,
            group_id: group_id.into(),
            connection_string: None,
            sasl: None,
            use_ssl: false,
            environment: AppEnvironment::Production,
            server_mode: ServerMode::All,
            port: DEFAULT_PORT,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            shutdown_grace_period: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_PERIOD_MS),
        }
    }

    /// Set the broker list.
    pub fn with_connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    /// Set the environment.
    pub fn with_environment(mut self, environment: AppEnvironment) -> Self {
        self.environment = environment;
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Load configuration from an optional file, then the process environment.
    ///
    /// Environment variables win over file values.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        let cfg = builder
            .add_source(config::Environment::default())
            .build()?;

        Self::from_config(cfg)
    }

    /// Build from already-assembled config sources.
    pub fn from_config(cfg: config::Config) -> Result<Self> {
        let raw: RawSettings = cfg.try_deserialize()?;
        let config = Self::from_raw(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn from_raw(raw: RawSettings) -> Result<Self> {
        let provider = match raw.event_bus_provider.as_deref() {
            Some(name) => name.parse()?,
            None => ProviderKind::Kafka,
        };

        let sasl = match raw.kafka_authentication_method.as_deref() {
            Some(method) if !method.trim().is_empty() => Some(SaslAuth {
                mechanism: method.parse()?,
                username: raw.kafka_broker_username.unwrap_or_default(),
                password: raw.kafka_broker_password.unwrap_or_default(),
            }),
            _ => None,
        };

        let mut config = Self::new(provider, raw.service_name.unwrap_or_default());
        config.connection_string = raw.kafka_broker_url;
        config.sasl = sasl;
        config.use_ssl = raw.kafka_use_ssl.unwrap_or(false);
        if let Some(env) = raw.app_env.as_deref() {
            config.environment = env.parse().unwrap_or(AppEnvironment::Production);
        }
        if let Some(mode) = raw.server_mode.as_deref() {
            config.server_mode = mode.parse().unwrap_or(ServerMode::All);
        }
        if let Some(port) = raw.app_port {
            config.port = port;
        }
        if let Some(ms) = raw.heartbeat_interval_ms {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.shutdown_timeout {
            config.shutdown_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.shutdown_grace_period {
            config.shutdown_grace_period = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Check the invariants every bus needs before it may serve.
    pub fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() {
            return Err(BusError::Configuration(
                "group id is not found for event bus".to_string(),
            ));
        }
        if !self.provider.is_supported() {
            return Err(BusError::UnsupportedProvider(self.provider.to_string()));
        }
        if self.provider == ProviderKind::Kafka && self.brokers().is_empty() {
            return Err(BusError::Configuration(
                "no connection string found for kafka event bus provider".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(BusError::Configuration(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Broker addresses parsed from the connection string.
    pub fn brokers(&self) -> Vec<String> {
        self.connection_string
            .as_deref()
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|b| !b.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
