/// Provider factory tests
///
/// Profile configuration, unsupported factory members and database
/// services through the reliable provider.
/// Run with: cargo test --test provider_tests
use std::sync::Arc;

use reliabledb::DbError;
use reliabledb::driver::simulated::{Operation, SimulatedDriver};
use reliabledb::provider::{Capability, ClassifierConfig, ProviderConfig, ReliableProvider};
use reliabledb::retry::RecordingSleeper;

const PROFILE: &str = r#"{
    "name": "reporting",
    "classifier": { "kind": "custom", "codes": [40501, 1205], "timeouts": true },
    "connection_strategy": {
        "kind": "exponential_backoff",
        "retry_count": 4,
        "min_backoff_ms": 100,
        "max_backoff_ms": 2000,
        "delta_backoff_ms": 200,
        "fast_first_retry": true
    },
    "command_strategy": {
        "kind": "incremental",
        "retry_count": 2,
        "initial_interval_ms": 50,
        "increment_ms": 50
    }
}"#;

#[test]
fn test_provider_from_json_profile() {
    let config = ProviderConfig::from_json(PROFILE).unwrap();
    assert_eq!(
        config.classifier,
        ClassifierConfig::Custom {
            codes: vec![40501, 1205],
            timeouts: true
        }
    );

    let sleeper = RecordingSleeper::new();
    let driver = SimulatedDriver::new("sim");
    let provider = ReliableProvider::builder(Arc::new(driver.clone()))
        .config(config)
        .sleeper(Arc::new(sleeper.clone()))
        .build()
        .unwrap();

    assert_eq!(provider.name(), "reporting");
    assert_eq!(provider.connection_policy().strategy().retry_count(), 4);
    assert!(provider.connection_policy().strategy().fast_first_retry());

    // Deadlocks are transient in this profile
    driver.server().fail_next(Operation::Execute, 1205, 2);
    let conn = provider.create_connection("Data Source=sim");
    let mut cmd = conn.create_command();
    cmd.set_text("UPDATE stock SET qty = qty - 1");
    cmd.execute_non_query().unwrap();

    assert_eq!(
        sleeper.delays(),
        vec![
            std::time::Duration::from_millis(100),
            std::time::Duration::from_millis(150),
        ]
    );
}

#[test]
fn test_unsupported_factory_members() {
    let provider = ReliableProvider::builder(Arc::new(SimulatedDriver::new("sim")))
        .build()
        .unwrap();

    assert!(matches!(
        provider.can_create_data_source_enumerator(),
        Err(DbError::UnsupportedOperation(_))
    ));
    let err = provider.require(Capability::CommandBuilder).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Unsupported operation: The reliable provider does not support creating a command builder"
    );
}

#[test]
fn test_provider_services_round_trip() {
    let driver = SimulatedDriver::new("sim");
    let provider = ReliableProvider::builder(Arc::new(driver.clone()))
        .sleeper(Arc::new(RecordingSleeper::new()))
        .build()
        .unwrap();
    let services = provider.provider_services().unwrap();
    let conn = provider.create_connection("Data Source=sim");

    assert_eq!(services.manifest_token(&conn).unwrap(), "2019");
    services.create_database(&conn, "archive").unwrap();
    assert!(services.database_exists(&conn, "archive").unwrap());
    services.delete_database(&conn, "archive").unwrap();
    assert!(!driver.server().has_database("archive"));
}

#[test]
fn test_settings_from_connection_string() {
    let provider = ReliableProvider::builder(Arc::new(SimulatedDriver::new("sim")))
        .build()
        .unwrap();
    let conn = provider.create_connection(
        "Server=tcp:db.example.net,1433;Database=orders;User ID=app;Password=secret;Connect Timeout=15",
    );

    assert_eq!(conn.database().unwrap(), "orders");
    assert_eq!(conn.connection_timeout().unwrap(), std::time::Duration::from_secs(15));
    assert!(!format!("{:?}", conn).contains("secret"));
}
