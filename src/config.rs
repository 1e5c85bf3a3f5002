use crate::core::connection::ConnectionTimeouts;
use crate::core::connection_pool::PoolSettings;
use crate::core::hash_ring::MAX_POINTS_PER_SERVER;
use crate::core::health::HealthPolicy;
use crate::core::key::validate_prefix;
use crate::core::retry::RetryPolicy;
use crate::core::serializer::create_serializer;
use crate::core::server::Server;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub servers: Vec<ServerSpec>,

    // Connection pool
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_pool_timeout_ms")]
    pub pool_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    #[serde(default)]
    pub test_on_checkout: bool,

    // Retry and failure policy
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_dead_timeout_secs")]
    pub dead_timeout_secs: u64,
    #[serde(default = "default_failover")]
    pub failover: bool,

    // Routing and values
    #[serde(default = "default_points_per_server")]
    pub points_per_server: u32,
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default = "default_serializer")]
    pub serializer: String,
}

/// A server entry: either a bare address or an address with a weight
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ServerSpec {
    Address(String),
    Weighted {
        address: String,
        #[serde(default = "default_weight")]
        weight: u32,
    },
}

impl ServerSpec {
    pub fn address(&self) -> &str {
        match self {
            ServerSpec::Address(address) => address,
            ServerSpec::Weighted { address, .. } => address,
        }
    }

    pub fn weight(&self) -> u32 {
        match self {
            ServerSpec::Address(_) => default_weight(),
            ServerSpec::Weighted { weight, .. } => *weight,
        }
    }

    pub fn to_server(&self) -> Result<Server, ConfigError> {
        Server::parse(self.address(), self.weight())
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}

impl From<&str> for ServerSpec {
    fn from(address: &str) -> Self {
        ServerSpec::Address(address.to_string())
    }
}

impl From<(&str, u32)> for ServerSpec {
    fn from((address, weight): (&str, u32)) -> Self {
        ServerSpec::Weighted {
            address: address.to_string(),
            weight,
        }
    }
}

// Default values for client configuration
fn default_weight() -> u32 {
    1
}
fn default_pool_size() -> u32 {
    10
}
fn default_pool_timeout_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    1000
}
fn default_read_timeout_ms() -> u64 {
    1000
}
fn default_idle_timeout_secs() -> u64 {
    300
} // 5 minutes
fn default_max_lifetime_secs() -> u64 {
    3600
} // 1 hour
fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    10
}
fn default_max_backoff_ms() -> u64 {
    500
}
fn default_failure_threshold() -> u32 {
    2
}
fn default_dead_timeout_secs() -> u64 {
    60
}
fn default_failover() -> bool {
    true
}
fn default_points_per_server() -> u32 {
    160
}
fn default_serializer() -> String {
    "json".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            pool_size: default_pool_size(),
            pool_timeout_ms: default_pool_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            operation_timeout_ms: None,
            idle_timeout_secs: default_idle_timeout_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
            test_on_checkout: false,
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            failure_threshold: default_failure_threshold(),
            dead_timeout_secs: default_dead_timeout_secs(),
            failover: default_failover(),
            points_per_server: default_points_per_server(),
            key_prefix: String::new(),
            serializer: default_serializer(),
        }
    }
}

impl ClientConfig {
    /// Default configuration for the given servers
    pub fn with_servers<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ServerSpec>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Load configuration from a YAML file
    pub async fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.to_string())
            } else {
                ConfigError::IoError(e.to_string())
            }
        })?;

        Self::from_yaml_str(&content)
    }

    /// Parse configuration from a YAML string (useful for testing)
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        // Validate the configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for common errors
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one server must be configured".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for spec in &self.servers {
            let server = spec.to_server()?;
            if !seen.insert(server.address().to_string()) {
                return Err(ConfigError::ValidationError(format!(
                    "Server '{}' is listed more than once",
                    server.address()
                )));
            }
        }

        if self.pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.points_per_server == 0 || self.points_per_server > MAX_POINTS_PER_SERVER {
            return Err(ConfigError::ValidationError(format!(
                "points_per_server must be between 1 and {}",
                MAX_POINTS_PER_SERVER
            )));
        }
        for (name, value) in [
            ("pool_timeout_ms", self.pool_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("read_timeout_ms", self.read_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.operation_timeout_ms == Some(0) {
            return Err(ConfigError::ValidationError(
                "operation_timeout_ms must be greater than 0".to_string(),
            ));
        }

        validate_prefix(&self.key_prefix)
            .map_err(|e| ConfigError::ValidationError(format!("Invalid key_prefix: {}", e)))?;

        create_serializer(&self.serializer)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(())
    }

    pub fn parsed_servers(&self) -> Result<Vec<Server>, ConfigError> {
        self.servers.iter().map(ServerSpec::to_server).collect()
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }

    pub fn connection_timeouts(&self) -> ConnectionTimeouts {
        ConnectionTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            io: Duration::from_millis(self.read_timeout_ms),
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_size: self.pool_size,
            checkout_timeout: Duration::from_millis(self.pool_timeout_ms),
            idle_timeout: non_zero_secs(self.idle_timeout_secs),
            max_lifetime: non_zero_secs(self.max_lifetime_secs),
            test_on_checkout: self.test_on_checkout,
            timeouts: self.connection_timeouts(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            failure_threshold: self.failure_threshold,
            dead_timeout: Duration::from_secs(self.dead_timeout_secs),
        }
    }
}

/// Zero disables the limit
fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}
