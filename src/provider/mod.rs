// ============================================================================
// Provider Factory
// ============================================================================
//
// Assembles reliable connections for one deployment profile: a driver, a
// connection retry policy and a command retry policy. Both policies share
// the profile's transient classifier and are shared by every connection
// the provider creates.
//
// ============================================================================

pub mod config;
pub mod services;

use std::fmt;
use std::sync::Arc;

use tracing::{Level, event};

use crate::connection::{ReliableCommand, ReliableConnection};
use crate::core::{DbError, Result};
use crate::driver::Driver;
use crate::retry::{RetryObserver, RetryPolicy, RetryStrategy, Sleeper};
use crate::transient::TransientErrorDetectionStrategy;

pub use config::{ClassifierConfig, ProviderConfig, StrategyConfig};
pub use services::ReliableProviderServices;

/// Factory capabilities of a driver provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Connection,
    Command,
    ProviderServices,
    DataSourceEnumerator,
    CommandBuilder,
    ConnectionStringBuilder,
    DataAdapter,
    Parameter,
    Permission,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Command => "command",
            Self::ProviderServices => "provider services",
            Self::DataSourceEnumerator => "data source enumerator",
            Self::CommandBuilder => "command builder",
            Self::ConnectionStringBuilder => "connection string builder",
            Self::DataAdapter => "data adapter",
            Self::Parameter => "parameter",
            Self::Permission => "permission",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Creates reliable connections and commands over a native driver.
pub struct ReliableProvider {
    driver: Arc<dyn Driver>,
    config: ProviderConfig,
    connection_policy: Arc<RetryPolicy>,
    command_policy: Arc<RetryPolicy>,
}

impl ReliableProvider {
    pub fn builder(driver: Arc<dyn Driver>) -> ReliableProviderBuilder {
        ReliableProviderBuilder {
            driver,
            config: ProviderConfig::default(),
            classifier: None,
            connection_strategy: None,
            command_strategy: None,
            connection_observers: Vec::new(),
            command_observers: Vec::new(),
            sleeper: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn connection_policy(&self) -> &Arc<RetryPolicy> {
        &self.connection_policy
    }

    pub fn command_policy(&self) -> &Arc<RetryPolicy> {
        &self.command_policy
    }

    /// A new, unopened connection with its own session.
    pub fn create_connection(&self, connection_string: &str) -> ReliableConnection {
        ReliableConnection::new(
            Arc::clone(&self.driver),
            connection_string,
            Arc::clone(&self.connection_policy),
            Arc::clone(&self.command_policy),
        )
    }

    /// A command with no connection assigned.
    pub fn create_command(&self) -> ReliableCommand {
        ReliableCommand::new("")
    }

    pub fn provider_services(&self) -> Result<ReliableProviderServices> {
        ReliableProviderServices::new(Arc::clone(&self.driver))
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Connection | Capability::Command => true,
            Capability::ProviderServices => self.driver.provider_services().is_some(),
            _ => false,
        }
    }

    /// `Err(UnsupportedOperation)` for capabilities this provider does not
    /// offer.
    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(DbError::UnsupportedOperation(format!(
                "The reliable provider does not support creating a {}",
                capability
            )))
        }
    }

    /// Data source enumeration is not offered; asking fails rather than
    /// answering `false`.
    pub fn can_create_data_source_enumerator(&self) -> Result<bool> {
        Err(DbError::UnsupportedOperation(
            "The reliable provider does not support data source enumeration".into(),
        ))
    }
}

impl fmt::Debug for ReliableProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliableProvider")
            .field("name", &self.config.name)
            .field("driver", &self.driver.name())
            .field("connection_policy", &self.connection_policy)
            .field("command_policy", &self.command_policy)
            .finish()
    }
}

/// Builder for [`ReliableProvider`].
pub struct ReliableProviderBuilder {
    driver: Arc<dyn Driver>,
    config: ProviderConfig,
    classifier: Option<Arc<dyn TransientErrorDetectionStrategy>>,
    connection_strategy: Option<Arc<dyn RetryStrategy>>,
    command_strategy: Option<Arc<dyn RetryStrategy>>,
    connection_observers: Vec<Arc<dyn RetryObserver>>,
    command_observers: Vec<Arc<dyn RetryObserver>>,
    sleeper: Option<Arc<dyn Sleeper>>,
}

impl ReliableProviderBuilder {
    pub fn config(mut self, config: ProviderConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the profile's classifier.
    pub fn classifier(mut self, classifier: Arc<dyn TransientErrorDetectionStrategy>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn connection_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.connection_strategy = Some(strategy);
        self
    }

    pub fn command_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.command_strategy = Some(strategy);
        self
    }

    pub fn on_connection_retry(mut self, observer: impl RetryObserver + 'static) -> Self {
        self.connection_observers.push(Arc::new(observer));
        self
    }

    pub fn on_command_retry(mut self, observer: impl RetryObserver + 'static) -> Self {
        self.command_observers.push(Arc::new(observer));
        self
    }

    /// Replace the thread sleeper used between retries.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub fn build(self) -> Result<ReliableProvider> {
        self.config.validate()?;

        let classifier = self.classifier.unwrap_or_else(|| self.config.classifier.build());
        let connection_strategy = self
            .connection_strategy
            .unwrap_or_else(|| self.config.connection_strategy());
        let command_strategy = self
            .command_strategy
            .unwrap_or_else(|| self.config.command_strategy());

        let policy = |strategy: Arc<dyn RetryStrategy>,
                      name: &str,
                      observers: Vec<Arc<dyn RetryObserver>>| {
            let mut policy = RetryPolicy::new(strategy, Arc::clone(&classifier))
                .named(format!("{} {}", self.config.name, name));
            if let Some(sleeper) = &self.sleeper {
                policy = policy.with_sleeper(Arc::clone(sleeper));
            }
            for observer in observers {
                policy.subscribe(observer);
            }
            Arc::new(policy)
        };

        let connection_policy = policy(connection_strategy, "connection", self.connection_observers);
        let command_policy = policy(command_strategy, "command", self.command_observers);

        event!(
            Level::DEBUG,
            profile = %self.config.name,
            driver = self.driver.name(),
            connection_retries = connection_policy.strategy().retry_count(),
            command_retries = command_policy.strategy().retry_count(),
            "Reliable provider configured"
        );

        Ok(ReliableProvider {
            driver: self.driver,
            config: self.config,
            connection_policy,
            command_policy,
        })
    }
}
