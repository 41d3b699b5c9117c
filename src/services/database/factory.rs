// Adapter factory: validates a ConnectionConfig, resolves credentials and
// builds the matching adapter in the Unconnected state
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::adapter::DatabaseAdapter;
use super::mysql::MySqlAdapter;
use super::postgresql::PostgresAdapter;
use super::sqlite::SqliteAdapter;
use super::sqlserver::SqlServerAdapter;
use crate::models::{
    ConnectionConfig, ConnectionSettings, Dialect, FactoryError, SecretResolver,
    DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_POOL_MAX, DEFAULT_POOL_MIN,
};

/// Builds adapters from caller configuration. Injected into the pool cache
/// so tests can substitute fakes.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, config: ConnectionConfig) -> Result<Arc<dyn DatabaseAdapter>, FactoryError>;
}

#[derive(Default)]
pub struct DefaultAdapterFactory {
    secrets: Option<Arc<dyn SecretResolver>>,
}

impl DefaultAdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Needed to accept `passwordEncrypted`
    pub fn with_secret_resolver(mut self, resolver: Arc<dyn SecretResolver>) -> Self {
        self.secrets = Some(resolver);
        self
    }

    /// Check every rule and report all failures together
    pub fn resolve(&self, config: ConnectionConfig) -> Result<ConnectionSettings, FactoryError> {
        let dialect = Dialect::from_str(&config.dialect).map_err(FactoryError::UnsupportedDialect)?;
        let mut errors = Vec::new();

        if config.database.trim().is_empty() {
            let what = if dialect.is_file_based() { "file path" } else { "database name" };
            errors.push(format!("A {} is required", what));
        }

        let mut host = String::new();
        let mut port = 0u16;
        let mut username = String::new();
        let mut password = String::new();

        if !dialect.is_file_based() {
            match config.host.as_deref().map(str::trim) {
                Some(h) if !h.is_empty() => host = h.to_string(),
                _ => errors.push(format!("host is required for {}", dialect)),
            }

            match config.port.or(dialect.default_port().map(u32::from)) {
                Some(p) if (1..=65535).contains(&p) => port = p as u16,
                Some(p) => errors.push(format!("port must be between 1 and 65535 (got {})", p)),
                None => errors.push("port is required".to_string()),
            }

            match config.username.as_deref() {
                Some(u) if !u.trim().is_empty() => username = u.to_string(),
                _ => errors.push(format!("username is required for {}", dialect)),
            }

            match (&config.password, &config.password_encrypted) {
                (Some(plain), _) => password = plain.clone(),
                (None, Some(ciphertext)) => match &self.secrets {
                    Some(resolver) => match resolver.decrypt(ciphertext) {
                        Ok(plain) => password = plain,
                        Err(e) => errors.push(format!("encrypted password could not be decrypted: {}", e)),
                    },
                    None => errors.push("an encrypted password was supplied but no secret resolver is configured".to_string()),
                },
                (None, None) => errors.push(format!("a password is required for {}", dialect)),
            }
        }

        let pool_min = config.pool_min.unwrap_or(DEFAULT_POOL_MIN);
        let pool_max = config.pool_max.unwrap_or(DEFAULT_POOL_MAX);
        if pool_max < 1 {
            errors.push("poolMax must be at least 1".to_string());
        }
        if pool_min > pool_max {
            errors.push(format!("poolMin ({}) must not exceed poolMax ({})", pool_min, pool_max));
        }

        let connect_timeout = config.connection_timeout.unwrap_or(DEFAULT_CONNECTION_TIMEOUT_SECS);
        if connect_timeout == 0 {
            errors.push("connectionTimeout must be greater than zero".to_string());
        }
        let idle_timeout = config.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);
        if idle_timeout == 0 {
            errors.push("idleTimeout must be greater than zero".to_string());
        }

        if !errors.is_empty() {
            return Err(FactoryError::InvalidConfig(errors));
        }

        Ok(ConnectionSettings {
            dialect,
            name: config.name,
            host,
            port,
            database: config.database,
            username,
            password,
            ssl: config.ssl.unwrap_or_default(),
            pool_min,
            pool_max,
            connect_timeout: Duration::from_secs(connect_timeout),
            idle_timeout: Duration::from_secs(idle_timeout),
        })
    }
}

impl AdapterFactory for DefaultAdapterFactory {
    fn create(&self, config: ConnectionConfig) -> Result<Arc<dyn DatabaseAdapter>, FactoryError> {
        let settings = self.resolve(config)?;
        debug!("Creating {} adapter for {:?}", settings.dialect, settings);

        let adapter: Arc<dyn DatabaseAdapter> = match settings.dialect {
            Dialect::PostgreSql => Arc::new(PostgresAdapter::new(settings)),
            Dialect::MySql => Arc::new(MySqlAdapter::new(settings)),
            Dialect::Sqlite => Arc::new(SqliteAdapter::new(settings)),
            Dialect::SqlServer => Arc::new(SqlServerAdapter::new(settings)),
        };
        Ok(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::database::AdapterState;

    struct Reverse;

    impl SecretResolver for Reverse {
        fn decrypt(&self, ciphertext: &str) -> Result<String, String> {
            if ciphertext.is_empty() {
                return Err("empty ciphertext".to_string());
            }
            Ok(ciphertext.chars().rev().collect())
        }
    }

    fn postgres() -> ConnectionConfig {
        let mut config = ConnectionConfig::new("postgres", "app");
        config.host = Some("localhost".into());
        config.username = Some("reader".into());
        config.password = Some("secret".into());
        config
    }

    #[tokio::test]
    async fn test_creates_unconnected_adapters() {
        let factory = DefaultAdapterFactory::new();

        let adapter = factory.create(postgres()).unwrap();
        assert_eq!(adapter.dialect(), Dialect::PostgreSql);
        assert_eq!(adapter.settings().port, 5432);
        assert_eq!(adapter.state().await, AdapterState::Unconnected);

        let adapter = factory.create(ConnectionConfig::new("sqlite3", "/tmp/app.db")).unwrap();
        assert_eq!(adapter.dialect(), Dialect::Sqlite);

        let mut mssql = postgres();
        mssql.dialect = "mssql".into();
        let adapter = factory.create(mssql).unwrap();
        assert_eq!(adapter.settings().port, 1433);
        assert_eq!(adapter.quote_identifier("x"), "[x]");
    }

    #[test]
    fn test_unsupported_dialect_is_distinct() {
        let factory = DefaultAdapterFactory::new();
        let err = factory.resolve(ConnectionConfig::new("oracle", "")).unwrap_err();
        assert!(matches!(err, FactoryError::UnsupportedDialect(ref d) if d == "oracle"));
    }

    #[test]
    fn test_collects_every_failure() {
        let factory = DefaultAdapterFactory::new();
        let mut config = ConnectionConfig::new("mysql", "");
        config.port = Some(70000);
        config.pool_min = Some(5);
        config.pool_max = Some(2);
        config.connection_timeout = Some(0);

        let err = factory.resolve(config).unwrap_err();
        let errors = err.errors();
        assert_eq!(errors.len(), 7, "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("database name")));
        assert!(errors.iter().any(|e| e.contains("host")));
        assert!(errors.iter().any(|e| e.contains("70000")));
        assert!(errors.iter().any(|e| e.contains("username")));
        assert!(errors.iter().any(|e| e.contains("password")));
        assert!(errors.iter().any(|e| e.contains("poolMin")));
        assert!(errors.iter().any(|e| e.contains("connectionTimeout")));
    }

    #[test]
    fn test_file_dialect_needs_only_a_path() {
        let factory = DefaultAdapterFactory::new();
        let settings = factory.resolve(ConnectionConfig::new("sqlite", "data/app.db")).unwrap();
        assert_eq!(settings.database, "data/app.db");
        assert!(settings.host.is_empty());

        let err = factory.resolve(ConnectionConfig::new("sqlite", " ")).unwrap_err();
        assert_eq!(err.errors(), vec!["A file path is required".to_string()]);
    }

    #[test]
    fn test_encrypted_password() {
        let mut config = postgres();
        config.password = None;
        config.password_encrypted = Some("terces".into());

        let err = DefaultAdapterFactory::new().resolve(config.clone()).unwrap_err();
        assert!(err.errors()[0].contains("secret resolver"));

        let factory = DefaultAdapterFactory::new().with_secret_resolver(Arc::new(Reverse));
        let settings = factory.resolve(config.clone()).unwrap();
        assert_eq!(settings.password, "secret");

        config.password_encrypted = Some(String::new());
        let err = factory.resolve(config).unwrap_err();
        assert!(err.errors()[0].contains("could not be decrypted"));
    }
}
