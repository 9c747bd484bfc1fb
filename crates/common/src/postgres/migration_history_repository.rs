use crate::domain::{
    DomainError, DomainResult, MigrationHistoryRepository, MigrationRecord, SchemaVersion,
    TenantContext,
};
use crate::postgres::{quote_partition, PostgresClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

/// Name of the append-only history table inside every partition
pub const MIGRATION_INFO_TABLE: &str = "migration_info";

/// PostgreSQL implementation of MigrationHistoryRepository
#[derive(Clone)]
pub struct PostgresMigrationHistoryRepository {
    client: PostgresClient,
}

impl PostgresMigrationHistoryRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }

    async fn read_history(&self, partition: &str) -> DomainResult<Vec<MigrationRecord>> {
        let schema = quote_partition(partition)?;
        let conn = self.client.connection().await?;

        let exists: bool = conn
            .query_one(
                "SELECT to_regclass($1) IS NOT NULL",
                &[&format!("{}.{}", schema, MIGRATION_INFO_TABLE)],
            )
            .await?
            .get(0);
        if !exists {
            debug!("partition has no migration history");
            return Ok(Vec::new());
        }

        let rows = conn
            .query(
                &format!(
                    "SELECT version, applied_at FROM {}.{} ORDER BY applied_at",
                    schema, MIGRATION_INFO_TABLE
                ),
                &[],
            )
            .await?;

        rows.iter()
            .map(|row| {
                let version: String = row.get(0);
                let applied_at: DateTime<Utc> = row.get(1);
                let version = version.parse::<SchemaVersion>().map_err(|_| {
                    DomainError::StorageUnavailable(anyhow::anyhow!(
                        "corrupt migration history entry {:?} in {}",
                        version,
                        partition
                    ))
                })?;
                Ok(MigrationRecord {
                    partition: partition.to_string(),
                    version,
                    applied_at,
                })
            })
            .collect()
    }

    async fn append_history(&self, partition: &str, version: SchemaVersion) -> DomainResult<()> {
        let schema = quote_partition(partition)?;
        let conn = self.client.connection().await?;

        conn.batch_execute(&format!(
            "CREATE SCHEMA IF NOT EXISTS {schema};
             CREATE TABLE IF NOT EXISTS {schema}.{table} (
                 version TEXT PRIMARY KEY,
                 applied_at TIMESTAMPTZ NOT NULL
             );",
            schema = schema,
            table = MIGRATION_INFO_TABLE
        ))
        .await?;

        let inserted = conn
            .execute(
                &format!(
                    "INSERT INTO {}.{} (version, applied_at) VALUES ($1, $2)
                     ON CONFLICT (version) DO NOTHING",
                    schema, MIGRATION_INFO_TABLE
                ),
                &[&version.to_string(), &Utc::now()],
            )
            .await?;

        debug!(inserted, "recorded migration");
        Ok(())
    }
}

#[async_trait]
impl MigrationHistoryRepository for PostgresMigrationHistoryRepository {
    #[instrument(skip(self, ctx))]
    async fn applied_migrations(
        &self,
        ctx: &TenantContext,
        partition: &str,
    ) -> DomainResult<Vec<MigrationRecord>> {
        ctx.run(self.read_history(partition)).await
    }

    #[instrument(skip(self, ctx), fields(version = %version))]
    async fn record_migration(
        &self,
        ctx: &TenantContext,
        partition: &str,
        version: SchemaVersion,
    ) -> DomainResult<()> {
        ctx.run(self.append_history(partition, version)).await
    }
}
