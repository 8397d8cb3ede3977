use crate::broker::Broker;
use crate::error::BrokerError;

use std::fmt::Debug;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

const DEFAULT_RETRY_MAX_COUNT: u32 = 3;
const DEFAULT_RETRY_DELAY_S: f64 = 10.0;

/// Errors that can occur while loading a broker definition.
#[derive(Debug, Error)]
pub enum Error {
    /// The definition could not be parsed.
    #[error("failed to parse broker definition: {0}")]
    Parse(#[from] toml::de::Error),

    /// The definition parsed but holds invalid values.
    #[error("invalid broker definition `{name}`: {reason}")]
    Invalid {
        /// The broker name.
        name: String,

        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Named configuration a broker is constructed from.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BrokerDefinition {
    /// The broker name, used in logs.
    pub name: String,

    /// How many times to attempt a connection before giving up.
    #[serde(default = "default_retry_max_count")]
    pub retry_max_count: u32,

    /// Seconds to wait between connection attempts.
    #[serde(default = "default_retry_delay_s")]
    pub retry_delay_s: f64,
}

const fn default_retry_max_count() -> u32 {
    DEFAULT_RETRY_MAX_COUNT
}

const fn default_retry_delay_s() -> f64 {
    DEFAULT_RETRY_DELAY_S
}

impl BrokerDefinition {
    /// Creates a definition with default retry settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry_max_count: DEFAULT_RETRY_MAX_COUNT,
            retry_delay_s: DEFAULT_RETRY_DELAY_S,
        }
    }

    /// Overrides the retry settings.
    #[must_use]
    pub fn with_retry(mut self, retry_max_count: u32, retry_delay_s: f64) -> Self {
        self.retry_max_count = retry_max_count;
        self.retry_delay_s = retry_delay_s;
        self
    }

    /// Parses and validates a definition from TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or the values are invalid.
    pub fn from_toml(document: &str) -> Result<Self, Error> {
        let definition: Self = toml::from_str(document)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Checks the definition's values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |reason| Error::Invalid {
            name: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.retry_max_count == 0 {
            return Err(invalid("retry_max_count must be at least 1"));
        }
        if !self.retry_delay_s.is_finite() || self.retry_delay_s < 0.0 {
            return Err(invalid("retry_delay_s must be a non-negative number"));
        }

        Ok(())
    }

    /// The delay between connection attempts.
    pub fn retry_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_delay_s).unwrap_or_default()
    }
}

/// Connects a broker, retrying connection failures as the definition allows.
///
/// Only [`ErrorKind::Connection`](crate::error::ErrorKind::Connection) failures
/// are retried; anything else is returned immediately.
///
/// # Errors
///
/// Returns the last connection error once all attempts are exhausted.
pub async fn connect_with_retry<B, T>(
    broker: &B,
    definition: &BrokerDefinition,
) -> Result<(), B::Error>
where
    B: Broker<T>,
    T: Clone + Debug + Send + Sync + 'static,
{
    let attempts = definition.retry_max_count.max(1);
    let mut attempt = 1;

    loop {
        match broker.connect().await {
            Ok(()) => {
                info!(broker = %definition.name, attempt, "broker connected");
                return Ok(());
            }
            Err(e) if e.kind().is_retryable() && attempt < attempts => {
                warn!(
                    broker = %definition.name,
                    "retry to connect [{attempt}/{attempts}]: {e}"
                );
                tokio::time::sleep(definition.retry_delay()).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(broker = %definition.name, attempt, "unavailable connection: {e}");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_apply() {
        let definition = BrokerDefinition::from_toml(r#"name = "default_broker""#).unwrap();

        assert_eq!(definition, BrokerDefinition::new("default_broker"));
        assert_eq!(definition.retry_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_overrides() {
        let definition = BrokerDefinition::from_toml(
            r#"
            name = "events"
            retry_max_count = 5
            retry_delay_s = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(definition.retry_max_count, 5);
        assert_eq!(definition.retry_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_definitions() {
        assert_matches!(
            BrokerDefinition::from_toml("retry_max_count = 2"),
            Err(Error::Parse(_))
        );
        assert_matches!(
            BrokerDefinition::from_toml(
                r#"
                name = "events"
                retry_max_count = 0
                "#
            ),
            Err(Error::Invalid { .. })
        );
        assert_matches!(
            BrokerDefinition::new("events").with_retry(1, -1.0).validate(),
            Err(Error::Invalid { .. })
        );
        assert_matches!(
            BrokerDefinition::new(" ").validate(),
            Err(Error::Invalid { .. })
        );
    }
}
