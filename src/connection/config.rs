use std::collections::BTreeMap;
use std::time::Duration;

use crate::core::{DbError, Result};

/// Settings carried by an ADO-style connection string
/// (`Data Source=db.example.com;Initial Catalog=app;Connect Timeout=5`).
///
/// Keys are case-insensitive. Keys this type does not model are kept in
/// `extra` so the string round-trips.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    /// Server address
    pub data_source: String,

    /// Database name
    pub database: String,

    pub user_id: Option<String>,

    pub password: Option<String>,

    /// Time allowed for establishing one physical connection
    pub connect_timeout: Duration,

    /// Whether the driver may pool physical connections
    pub pooling: bool,

    /// Unrecognized keys, lowercased
    pub extra: BTreeMap<String, String>,
}

impl ConnectionSettings {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

    pub fn new(data_source: &str) -> Self {
        Self {
            data_source: data_source.to_string(),
            database: String::new(),
            user_id: None,
            password: None,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            pooling: true,
            extra: BTreeMap::new(),
        }
    }

    /// Set the database name
    pub fn database(mut self, database: &str) -> Self {
        self.database = database.to_string();
        self
    }

    /// Set the credentials
    pub fn credentials(mut self, user_id: &str, password: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self.password = Some(password.to_string());
        self
    }

    /// Set connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn pooling(mut self, pooling: bool) -> Self {
        self.pooling = pooling;
        self
    }

    /// Parse a connection string
    ///
    /// An empty string yields settings with an empty data source; use
    /// [`validate`](Self::validate) before connecting.
    ///
    /// # Examples
    ///
    /// ```
    /// use reliabledb::ConnectionSettings;
    ///
    /// let settings = ConnectionSettings::parse(
    ///     "Server=db.example.com;Database=app;Connect Timeout=5",
    /// ).unwrap();
    /// assert_eq!(settings.database, "app");
    /// assert_eq!(settings.connect_timeout.as_secs(), 5);
    /// ```
    pub fn parse(connection_string: &str) -> Result<Self> {
        let mut settings = Self::new("");

        for segment in connection_string.split(';') {
            if segment.trim().is_empty() {
                continue;
            }

            let (key, value) = segment.split_once('=').ok_or_else(|| {
                DbError::Configuration(format!(
                    "Invalid connection string segment '{}': expected key=value",
                    segment.trim()
                ))
            })?;

            let key = key.trim().to_ascii_lowercase();
            let value = unquote(value.trim());

            match key.as_str() {
                "data source" | "server" | "address" | "addr" => {
                    settings.data_source = value.to_string()
                }
                "initial catalog" | "database" => settings.database = value.to_string(),
                "user id" | "uid" | "user" => settings.user_id = Some(value.to_string()),
                "password" | "pwd" => settings.password = Some(value.to_string()),
                "connect timeout" | "connection timeout" | "timeout" => {
                    let secs: u64 = value.parse().map_err(|_| {
                        DbError::Configuration(format!("Invalid connect timeout '{}'", value))
                    })?;
                    settings.connect_timeout = Duration::from_secs(secs);
                }
                "pooling" => settings.pooling = parse_bool(value)?,
                "" => {
                    return Err(DbError::Configuration(
                        "Connection string key cannot be empty".into(),
                    ));
                }
                _ => {
                    settings.extra.insert(key, value.to_string());
                }
            }
        }

        Ok(settings)
    }

    /// Render back into a connection string
    pub fn to_connection_string(&self) -> String {
        self.render(false)
    }

    /// Render with the password masked, for logs and error messages
    pub fn to_redacted(&self) -> String {
        self.render(true)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.data_source.is_empty() {
            return Err(DbError::Configuration("Data Source cannot be empty".into()));
        }

        if self.user_id.is_some() != self.password.is_some() {
            return Err(DbError::Configuration(
                "User ID and Password must be given together".into(),
            ));
        }

        Ok(())
    }

    fn render(&self, redact: bool) -> String {
        let mut parts = vec![format!("Data Source={}", self.data_source)];

        if !self.database.is_empty() {
            parts.push(format!("Initial Catalog={}", self.database));
        }
        if let Some(user) = &self.user_id {
            parts.push(format!("User ID={}", user));
        }
        if let Some(password) = &self.password {
            let shown = if redact { "***" } else { password.as_str() };
            parts.push(format!("Password={}", shown));
        }
        if self.connect_timeout != Self::DEFAULT_CONNECT_TIMEOUT {
            parts.push(format!("Connect Timeout={}", self.connect_timeout.as_secs()));
        }
        if !self.pooling {
            parts.push("Pooling=false".to_string());
        }
        for (key, value) in &self.extra {
            parts.push(format!("{}={}", key, value));
        }

        parts.join(";")
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::new("")
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        other => Err(DbError::Configuration(format!("Invalid boolean '{}'", other))),
    }
}
