use crate::domain::DEFAULT_PARTITION_BASE;
use serde::{Deserialize, Serialize};

/// PostgreSQL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_pool_size: usize,
    /// Schema name of the default partition; tenant partitions append `-<tenant>`
    pub partition_base: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "deviceconfig".to_string(),
            username: "deviceconfig".to_string(),
            password: "deviceconfig".to_string(),
            max_pool_size: 10,
            partition_base: DEFAULT_PARTITION_BASE.to_string(),
        }
    }
}
