use common::domain::DEFAULT_PARTITION_BASE;
use common::postgres::{PostgresConfig, DB_VERSION};
use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of plain text
    #[serde(default = "default_json_logs")]
    pub json_logs: bool,

    // PostgreSQL configuration
    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    #[serde(default = "default_postgres_username")]
    pub postgres_username: String,

    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    #[serde(default = "default_postgres_max_pool_size")]
    pub postgres_max_pool_size: usize,

    /// Schema name of the default partition; tenants get `<base>-<tenant>`
    #[serde(default = "default_partition_base")]
    pub partition_base: String,

    // Migration configuration
    /// Schema version every partition is brought to
    #[serde(default = "default_target_version")]
    pub target_version: String,

    /// Apply pending steps instead of failing with "migration required"
    #[serde(default)]
    pub auto_migrate: bool,

    /// Limit the run to this tenant's partition
    #[serde(default)]
    pub migrate_tenant_id: Option<String>,

    /// Startup timeout for initialization operations in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    // OpenTelemetry configuration
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default)]
    pub otel_enabled: bool,

    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json_logs() -> bool {
    true
}

// PostgreSQL defaults
fn default_postgres_host() -> String {
    PostgresConfig::default().host
}

fn default_postgres_port() -> u16 {
    PostgresConfig::default().port
}

fn default_postgres_database() -> String {
    PostgresConfig::default().database
}

fn default_postgres_username() -> String {
    PostgresConfig::default().username
}

fn default_postgres_password() -> String {
    PostgresConfig::default().password
}

fn default_postgres_max_pool_size() -> usize {
    PostgresConfig::default().max_pool_size
}

fn default_partition_base() -> String {
    DEFAULT_PARTITION_BASE.to_string()
}

fn default_target_version() -> String {
    DB_VERSION.to_string()
}

fn default_startup_timeout_secs() -> u64 {
    30
}

// OpenTelemetry defaults
fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "deviceconfig".to_string()
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("DEVICECONFIG"))
            .build()?
            .try_deserialize()
    }

    pub fn postgres(&self) -> PostgresConfig {
        PostgresConfig {
            host: self.postgres_host.clone(),
            port: self.postgres_port,
            database: self.postgres_database.clone(),
            username: self.postgres_username.clone(),
            password: self.postgres_password.clone(),
            max_pool_size: self.postgres_max_pool_size,
            partition_base: self.partition_base.clone(),
        }
    }

    /// Tenant to migrate, with an empty value meaning every partition
    pub fn migrate_tenant(&self) -> Option<&str> {
        self.migrate_tenant_id
            .as_deref()
            .filter(|tenant| !tenant.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-wide; serialize every test that touches them
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "DEVICECONFIG_LOG_LEVEL",
        "DEVICECONFIG_AUTO_MIGRATE",
        "DEVICECONFIG_MIGRATE_TENANT_ID",
        "DEVICECONFIG_POSTGRES_PORT",
        "DEVICECONFIG_PARTITION_BASE",
    ];

    fn clear_env() {
        for var in VARS {
            // SAFETY: callers hold TEST_LOCK
            unsafe {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.target_version, DB_VERSION);
        assert!(!config.auto_migrate);
        assert_eq!(config.migrate_tenant(), None);
        assert_eq!(config.partition_base, "deviceconfig");
        assert_eq!(config.postgres().port, 5432);
    }

    #[test]
    fn test_custom_config() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();
        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("DEVICECONFIG_LOG_LEVEL", "debug");
            std::env::set_var("DEVICECONFIG_AUTO_MIGRATE", "true");
            std::env::set_var("DEVICECONFIG_MIGRATE_TENANT_ID", "acme");
            std::env::set_var("DEVICECONFIG_POSTGRES_PORT", "15432");
            std::env::set_var("DEVICECONFIG_PARTITION_BASE", "cfg");
        }

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.auto_migrate);
        assert_eq!(config.migrate_tenant(), Some("acme"));
        assert_eq!(config.postgres().port, 15432);
        assert_eq!(config.postgres().partition_base, "cfg");

        clear_env();
    }

    #[test]
    fn test_empty_tenant_means_all_partitions() {
        let _lock = TEST_LOCK.lock().unwrap();
        clear_env();
        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("DEVICECONFIG_MIGRATE_TENANT_ID", "");
        }

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.migrate_tenant(), None);

        clear_env();
    }
}
