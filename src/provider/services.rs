use std::sync::Arc;

use crate::connection::ReliableConnection;
use crate::core::{DbError, Result};
use crate::driver::{Driver, NativeProviderServices};

/// Database-level services for mapping layers, executed through the
/// connection's command retry policy on its current physical handle.
#[derive(Clone)]
pub struct ReliableProviderServices {
    driver: Arc<dyn Driver>,
}

impl ReliableProviderServices {
    /// Fails with `UnsupportedOperation` if the driver has no services.
    pub fn new(driver: Arc<dyn Driver>) -> Result<Self> {
        if driver.provider_services().is_none() {
            return Err(DbError::UnsupportedOperation(format!(
                "Driver '{}' does not provide database services",
                driver.name()
            )));
        }
        Ok(Self { driver })
    }

    fn services(&self) -> Result<&dyn NativeProviderServices> {
        self.driver.provider_services().ok_or_else(|| {
            DbError::UnsupportedOperation("Database services are unavailable".into())
        })
    }

    /// Token identifying the server version family.
    pub fn manifest_token(&self, connection: &ReliableConnection) -> Result<String> {
        let services = self.services()?;
        connection
            .session()?
            .execute_on_handle(None, |handle| services.manifest_token(handle))
    }

    pub fn database_exists(&self, connection: &ReliableConnection, database: &str) -> Result<bool> {
        let services = self.services()?;
        connection
            .session()?
            .execute_on_handle(None, |handle| services.database_exists(handle, database))
    }

    pub fn create_database(&self, connection: &ReliableConnection, database: &str) -> Result<()> {
        let services = self.services()?;
        connection
            .session()?
            .execute_on_handle(None, |handle| services.create_database(handle, database))
    }

    pub fn delete_database(&self, connection: &ReliableConnection, database: &str) -> Result<()> {
        let services = self.services()?;
        connection
            .session()?
            .execute_on_handle(None, |handle| services.delete_database(handle, database))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::simulated::{Operation, SimulatedDriver};
    use crate::retry::{FixedInterval, RecordingSleeper, RetryPolicy};
    use crate::transient::TransientErrorClassifier;
    use std::time::Duration;

    fn setup() -> (SimulatedDriver, ReliableProviderServices, ReliableConnection) {
        let driver = SimulatedDriver::new("sim");
        let shared: Arc<dyn Driver> = Arc::new(driver.clone());
        let policy = Arc::new(
            RetryPolicy::new(
                Arc::new(FixedInterval::new(3, Duration::from_millis(1))),
                Arc::new(TransientErrorClassifier::sql_azure()),
            )
            .with_sleeper(Arc::new(RecordingSleeper::new())),
        );
        let conn = ReliableConnection::new(
            Arc::clone(&shared),
            "Data Source=sim",
            Arc::clone(&policy),
            policy,
        );
        let services = ReliableProviderServices::new(shared).unwrap();
        (driver, services, conn)
    }

    #[test]
    fn test_manifest_token() {
        let (_driver, services, conn) = setup();
        assert_eq!(services.manifest_token(&conn).unwrap(), "2019");
    }

    #[test]
    fn test_create_and_delete_database() {
        let (driver, services, conn) = setup();
        assert!(!services.database_exists(&conn, "orders").unwrap());

        services.create_database(&conn, "orders").unwrap();
        assert!(driver.server().has_database("orders"));
        assert!(services.database_exists(&conn, "orders").unwrap());

        services.delete_database(&conn, "orders").unwrap();
        assert!(!services.database_exists(&conn, "orders").unwrap());
    }

    #[test]
    fn test_services_are_retried() {
        let (driver, services, conn) = setup();
        driver.server().fail_next(Operation::Execute, 40501, 2);

        services.create_database(&conn, "orders").unwrap();
        assert!(driver.server().has_database("orders"));
    }
}
