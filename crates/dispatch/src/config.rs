//! Dispatcher configuration

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Dispatcher configuration
///
/// The rate is a ceiling on dispatch starts per second. Successive dispatches
/// are spaced by `1 / rate` plus a small safety margin, so the observed rate
/// stays strictly below the ceiling even with timer jitter.
///
/// # Example
///
/// ```
/// use throttle_dispatch::DispatcherConfig;
/// use std::time::Duration;
///
/// let config = DispatcherConfig::new(10.0)
///     .with_name("search-api")
///     .with_safety_margin(Duration::from_millis(5));
///
/// assert_eq!(config.spacing(), Duration::from_millis(105));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    /// Name used for the pacing thread and in log fields
    pub name: String,

    /// Maximum dispatches per second
    pub rate: f64,

    /// Extra delay added on top of `1 / rate` between dispatches
    #[serde(with = "duration_millis")]
    pub safety_margin: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "dispatcher".to_string(),
            rate: 1.0,
            safety_margin: Duration::from_millis(10),
        }
    }
}

impl DispatcherConfig {
    /// Create a new configuration with the given rate (per second)
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `THROTTLE_RATE`: dispatches per second (default: 1)
    /// - `THROTTLE_SAFETY_MARGIN_MS`: extra spacing in milliseconds (default: 10)
    /// - `THROTTLE_DISPATCHER_NAME`: thread/log name (default: "dispatcher")
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let rate = match env::var("THROTTLE_RATE") {
            Ok(value) => value.parse().map_err(|_| ConfigError::InvalidEnv {
                name: "THROTTLE_RATE",
                value,
            })?,
            Err(_) => defaults.rate,
        };

        let safety_margin = match env::var("THROTTLE_SAFETY_MARGIN_MS") {
            Ok(value) => {
                Duration::from_millis(value.parse().map_err(|_| ConfigError::InvalidEnv {
                    name: "THROTTLE_SAFETY_MARGIN_MS",
                    value,
                })?)
            }
            Err(_) => defaults.safety_margin,
        };

        let name = env::var("THROTTLE_DISPATCHER_NAME").unwrap_or(defaults.name);

        let config = Self {
            name,
            rate,
            safety_margin,
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the dispatcher name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the rate (dispatches per second)
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    /// Set the safety margin added to each spacing interval
    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rate.is_finite() || self.rate <= 0.0 || self.try_spacing().is_none() {
            return Err(ConfigError::InvalidRate(self.rate));
        }
        Ok(())
    }

    /// Minimum interval between two dispatches
    ///
    /// Saturates at [`Duration::MAX`] for rates [`validate`](Self::validate)
    /// rejects.
    pub fn spacing(&self) -> Duration {
        self.try_spacing().unwrap_or(Duration::MAX)
    }

    /// `None` when the interval does not fit in a [`Duration`]
    fn try_spacing(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(1.0 / self.rate)
            .ok()?
            .checked_add(self.safety_margin)
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
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
