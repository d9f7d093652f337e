use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{DbError, Result};
use crate::retry::{
    ExponentialBackoff, FixedInterval, Incremental, NoRetry, RetryStrategy,
    default_command_strategy, default_connection_strategy,
};
use crate::transient::{TransientErrorClassifier, TransientErrorDetectionStrategy};

/// Serializable description of a retry strategy. Intervals are in
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    Incremental {
        retry_count: u32,
        initial_interval_ms: u64,
        increment_ms: u64,
        #[serde(default)]
        max_interval_ms: Option<u64>,
        #[serde(default)]
        fast_first_retry: bool,
    },
    ExponentialBackoff {
        retry_count: u32,
        min_backoff_ms: u64,
        max_backoff_ms: u64,
        delta_backoff_ms: u64,
        #[serde(default)]
        fast_first_retry: bool,
    },
    FixedInterval {
        retry_count: u32,
        interval_ms: u64,
        #[serde(default)]
        fast_first_retry: bool,
    },
    NoRetry,
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Incremental {
                initial_interval_ms,
                max_interval_ms: Some(max),
                ..
            } if max < initial_interval_ms => Err(DbError::Configuration(format!(
                "max_interval_ms ({}) is below initial_interval_ms ({})",
                max, initial_interval_ms
            ))),
            Self::ExponentialBackoff {
                min_backoff_ms,
                max_backoff_ms,
                ..
            } if max_backoff_ms < min_backoff_ms => Err(DbError::Configuration(format!(
                "max_backoff_ms ({}) is below min_backoff_ms ({})",
                max_backoff_ms, min_backoff_ms
            ))),
            _ => Ok(()),
        }
    }

    pub fn build(&self) -> Arc<dyn RetryStrategy> {
        match *self {
            Self::Incremental {
                retry_count,
                initial_interval_ms,
                increment_ms,
                max_interval_ms,
                fast_first_retry,
            } => {
                let mut strategy = Incremental::new(
                    retry_count,
                    Duration::from_millis(initial_interval_ms),
                    Duration::from_millis(increment_ms),
                )
                .with_fast_first_retry(fast_first_retry);
                if let Some(max) = max_interval_ms {
                    strategy = strategy.with_max_interval(Duration::from_millis(max));
                }
                Arc::new(strategy)
            }
            Self::ExponentialBackoff {
                retry_count,
                min_backoff_ms,
                max_backoff_ms,
                delta_backoff_ms,
                fast_first_retry,
            } => Arc::new(
                ExponentialBackoff::new(
                    retry_count,
                    Duration::from_millis(min_backoff_ms),
                    Duration::from_millis(max_backoff_ms),
                    Duration::from_millis(delta_backoff_ms),
                )
                .with_fast_first_retry(fast_first_retry),
            ),
            Self::FixedInterval {
                retry_count,
                interval_ms,
                fast_first_retry,
            } => Arc::new(
                FixedInterval::new(retry_count, Duration::from_millis(interval_ms))
                    .with_fast_first_retry(fast_first_retry),
            ),
            Self::NoRetry => Arc::new(NoRetry),
        }
    }
}

/// Which transient code set to use.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassifierConfig {
    #[default]
    SqlAzure,
    SqlAzureWithTimeouts,
    OnPremises,
    Custom {
        codes: Vec<i32>,
        #[serde(default)]
        timeouts: bool,
    },
}

impl ClassifierConfig {
    pub fn build(&self) -> Arc<dyn TransientErrorDetectionStrategy> {
        Arc::new(self.classifier())
    }

    pub fn classifier(&self) -> TransientErrorClassifier {
        match self {
            Self::SqlAzure => TransientErrorClassifier::sql_azure(),
            Self::SqlAzureWithTimeouts => TransientErrorClassifier::sql_azure_with_timeouts(),
            Self::OnPremises => TransientErrorClassifier::on_premises(),
            Self::Custom { codes, timeouts } => {
                TransientErrorClassifier::with_codes(codes.iter().copied()).with_timeouts(*timeouts)
            }
        }
    }
}

/// Deployment profile for a [`ReliableProvider`](super::ReliableProvider).
///
/// A strategy left as `None` uses the process-wide default: Incremental
/// (10 retries, 1s + 1s per retry) for commands and exponential backoff
/// (10 retries, 1s to 30s, 10s delta) for connections.
///
/// # Examples
///
/// ```
/// use reliabledb::provider::{ClassifierConfig, ProviderConfig};
///
/// let config = ProviderConfig::from_json(r#"{
///     "name": "reporting",
///     "classifier": { "kind": "sql_azure_with_timeouts" },
///     "command_strategy": {
///         "kind": "incremental",
///         "retry_count": 3,
///         "initial_interval_ms": 1000,
///         "increment_ms": 0
///     }
/// }"#).unwrap();
///
/// assert_eq!(config.classifier, ClassifierConfig::SqlAzureWithTimeouts);
/// assert!(config.connection_strategy.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub connection_strategy: Option<StrategyConfig>,
    #[serde(default)]
    pub command_strategy: Option<StrategyConfig>,
}

impl ProviderConfig {
    /// Cloud profile: SQL Azure codes with the default strategies.
    pub fn sql_azure() -> Self {
        Self {
            name: "SqlAzure".into(),
            classifier: ClassifierConfig::SqlAzure,
            connection_strategy: None,
            command_strategy: None,
        }
    }

    /// Cloud profile that also retries client timeouts.
    pub fn sql_azure_with_timeouts() -> Self {
        Self {
            name: "SqlAzureWithTimeouts".into(),
            classifier: ClassifierConfig::SqlAzureWithTimeouts,
            ..Self::sql_azure()
        }
    }

    /// Lenient profile for servers on the local network: fewer, shorter
    /// retries.
    pub fn on_premises() -> Self {
        Self {
            name: "OnPremises".into(),
            classifier: ClassifierConfig::OnPremises,
            connection_strategy: Some(StrategyConfig::ExponentialBackoff {
                retry_count: 5,
                min_backoff_ms: 500,
                max_backoff_ms: 10_000,
                delta_backoff_ms: 2_000,
                fast_first_retry: true,
            }),
            command_strategy: Some(StrategyConfig::Incremental {
                retry_count: 3,
                initial_interval_ms: 500,
                increment_ms: 500,
                max_interval_ms: None,
                fast_first_retry: false,
            }),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DbError::Configuration(format!("Invalid provider config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DbError::Configuration(format!("Cannot serialize provider config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DbError::Configuration("Profile name cannot be empty".into()));
        }
        for strategy in [&self.connection_strategy, &self.command_strategy]
            .into_iter()
            .flatten()
        {
            strategy.validate()?;
        }
        Ok(())
    }

    pub fn connection_strategy(&self) -> Arc<dyn RetryStrategy> {
        match &self.connection_strategy {
            Some(config) => config.build(),
            None => default_connection_strategy(),
        }
    }

    pub fn command_strategy(&self) -> Arc<dyn RetryStrategy> {
        match &self.command_strategy {
            Some(config) => config.build(),
            None => default_command_strategy(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::sql_azure()
    }
}
