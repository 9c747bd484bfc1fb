use crate::domain::{DomainError, DomainResult};
use crate::postgres::PostgresConfig;
use anyhow::{Context, Result};
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::debug;

/// PostgreSQL identifiers longer than this are silently truncated by the server.
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// PostgreSQL client wrapper with connection pooling.
///
/// Cloning shares the underlying pool, so every repository built from one
/// client uses the same connections.
#[derive(Clone)]
pub struct PostgresClient {
    pool: Pool,
}

impl PostgresClient {
    /// Creates a new PostgreSQL client with connection pooling
    ///
    /// # Arguments
    /// * `host` - Database host (e.g., "localhost")
    /// * `port` - Database port (e.g., 5432)
    /// * `database` - Database name
    /// * `username` - Database username
    /// * `password` - Database password
    /// * `max_pool_size` - Maximum number of connections in the pool
    pub fn new(
        host: &str,
        port: u16,
        database: &str,
        username: &str,
        password: &str,
        max_pool_size: usize,
    ) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.host = Some(host.to_string());
        cfg.port = Some(port);
        cfg.dbname = Some(database.to_string());
        cfg.user = Some(username.to_string());
        cfg.password = Some(password.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .context("failed to create postgres pool")?;
        pool.resize(max_pool_size);

        Ok(Self { pool })
    }

    pub fn from_config(config: &PostgresConfig) -> Result<Self> {
        Self::new(
            &config.host,
            config.port,
            &config.database,
            &config.username,
            &config.password,
            config.max_pool_size,
        )
    }

    /// Pings the database to verify connectivity
    pub async fn ping(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.execute("SELECT 1", &[]).await?;
        debug!("postgreSQL connection successful");
        Ok(())
    }

    /// Gets a connection from the pool
    pub async fn get_connection(&self) -> Result<deadpool_postgres::Client> {
        Ok(self.pool.get().await?)
    }

    /// Gets a connection from the pool, reporting failure as a storage error
    pub async fn connection(&self) -> DomainResult<deadpool_postgres::Client> {
        self.get_connection()
            .await
            .map_err(DomainError::StorageUnavailable)
    }

    /// Stop handing out connections and drop idle ones
    pub fn close(&self) {
        self.pool.close();
    }
}

/// Quote a partition (schema) name for interpolation into SQL.
///
/// Rejects names the server would truncate, since two long tenant ids could
/// otherwise land in the same schema.
pub fn quote_partition(partition: &str) -> DomainResult<String> {
    quote_identifier("partition", partition)
}

/// Quote any other identifier (table, column) for interpolation into SQL.
pub fn quote_identifier(kind: &str, name: &str) -> DomainResult<String> {
    if name.is_empty() || name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(DomainError::ValidationError(format!(
            "{} name must be 1 to {} bytes: {:?}",
            kind, MAX_IDENTIFIER_LENGTH, name
        )));
    }
    if name.contains('\0') {
        return Err(DomainError::ValidationError(format!(
            "{} name contains a NUL byte",
            kind
        )));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Map a unique-constraint violation (SQLSTATE 23505) to `on_conflict`,
/// anything else to a storage error.
pub fn map_write_error(
    e: tokio_postgres::Error,
    on_conflict: impl FnOnce() -> DomainError,
) -> DomainError {
    if let Some(db_err) = e.as_db_error() {
        if db_err.code().code() == "23505" {
            return on_conflict();
        }
    }
    DomainError::StorageUnavailable(e.into())
}
