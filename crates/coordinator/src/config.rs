//! Coordinator configuration

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use throttle_dispatch::{ConfigError, DispatcherConfig};

/// Coordinator configuration
///
/// Every process joining the same `name` shares one schedule. Only the
/// elected leader's `dispatcher` settings take effect; followers validate
/// theirs but never use them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorConfig {
    /// Shared name of the schedule (also the rendezvous key)
    pub name: String,

    /// Interface the leader endpoint binds to
    pub host: String,

    /// Dispatcher settings used if this process becomes leader
    pub dispatcher: DispatcherConfig,

    /// Election rounds before giving up
    pub max_election_attempts: u32,

    /// Pause between election rounds
    #[serde(with = "duration_millis")]
    pub election_backoff: Duration,

    /// Timeout for connecting to a published endpoint
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,

    /// Timeout for the liveness check sent to a published endpoint
    #[serde(with = "duration_millis")]
    pub liveness_timeout: Duration,

    /// How long a leader waits for in-flight work when shutting down
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Maximum length of one protocol frame, in bytes
    pub max_frame_length: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            name: "throttle-queue".to_string(),
            host: "127.0.0.1".to_string(),
            dispatcher: DispatcherConfig::default(),
            max_election_attempts: 10,
            election_backoff: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(2),
            liveness_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(30),
            max_frame_length: 1024 * 1024,
        }
    }
}

impl CoordinatorConfig {
    /// Create a configuration for the schedule called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `THROTTLE_NAME`: shared schedule name (default: "throttle-queue")
    /// - `THROTTLE_HOST`: leader bind address (default: "127.0.0.1")
    /// - plus the dispatcher variables read by [`DispatcherConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            name: env::var("THROTTLE_NAME").unwrap_or(defaults.name),
            host: env::var("THROTTLE_HOST").unwrap_or(defaults.host),
            dispatcher: DispatcherConfig::from_env()?,
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the bind host for the leader endpoint
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the dispatcher configuration
    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Set the election attempts and backoff
    pub fn with_election(mut self, attempts: u32, backoff: Duration) -> Self {
        self.max_election_attempts = attempts.max(1);
        self.election_backoff = backoff;
        self
    }

    /// Set the connect and liveness timeouts
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self.liveness_timeout = timeout;
        self
    }

    /// Set the leader shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("coordinator name is empty".to_string()));
        }
        if let Some(c) = self
            .name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(ConfigError::Invalid(format!(
                "coordinator name {:?} contains {c:?}; allowed: [A-Za-z0-9._-]",
                self.name
            )));
        }
        if self.max_election_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_election_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_frame_length == 0 {
            return Err(ConfigError::Invalid(
                "max_frame_length must be positive".to_string(),
            ));
        }
        self.dispatcher.validate()
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.name, "throttle-queue");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.max_election_attempts, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_names() {
        for name in ["", "a/b", "../escape", "with space"] {
            assert!(
                matches!(
                    CoordinatorConfig::new(name).validate(),
                    Err(ConfigError::Invalid(_))
                ),
                "{name:?} should be rejected"
            );
        }
        assert!(CoordinatorConfig::new("crawler.search-api_v2").validate().is_ok());
    }

    #[test]
    fn test_rejects_invalid_dispatcher_rate() {
        let config = CoordinatorConfig::new("crawler").with_dispatcher(DispatcherConfig::new(-1.0));
        assert_eq!(config.validate(), Err(ConfigError::InvalidRate(-1.0)));
    }

    #[test]
    fn test_builder_clamps_attempts() {
        let config = CoordinatorConfig::new("crawler").with_election(0, Duration::from_millis(5));
        assert_eq!(config.max_election_attempts, 1);
        assert_eq!(config.election_backoff, Duration::from_millis(5));
    }

    #[test]
    fn test_serializes_durations_as_millis() {
        let config = CoordinatorConfig::new("crawler").with_connect_timeout(Duration::from_millis(250));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["connect_timeout"], 250);
        assert_eq!(json["liveness_timeout"], 250);

        let parsed: CoordinatorConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
