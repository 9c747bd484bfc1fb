use crate::domain::{
    DomainResult, MigrationStep, PartitionNaming, SchemaVersion, TenantContext,
};
use crate::postgres::{quote_partition, PostgresClient};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Latest schema version known to this build.
pub const DB_VERSION: &str = "1.1.0";

/// Name of the device table inside every partition
pub const DEVICES_TABLE: &str = "devices";

/// Every PostgreSQL migration step, in ascending version order
pub fn migration_steps(client: PostgresClient, naming: PartitionNaming) -> Vec<Arc<dyn MigrationStep>> {
    vec![
        Arc::new(CreateDevicesTable {
            client: client.clone(),
        }),
        Arc::new(BackfillTenantId {
            client: client.clone(),
            naming,
        }),
        Arc::new(AddDeploymentId { client }),
    ]
}

/// 1.0.0: partition schema and the device table keyed by `(tenant_id, id)`
pub struct CreateDevicesTable {
    client: PostgresClient,
}

#[async_trait]
impl MigrationStep for CreateDevicesTable {
    fn version(&self) -> SchemaVersion {
        SchemaVersion::new(1, 0, 0)
    }

    #[instrument(skip(self, ctx), fields(from = %from))]
    async fn up(&self, ctx: &TenantContext, partition: &str, from: SchemaVersion) -> DomainResult<()> {
        if from >= self.version() {
            return Ok(());
        }
        ctx.run(self.apply(partition)).await
    }
}

impl CreateDevicesTable {
    async fn apply(&self, partition: &str) -> DomainResult<()> {
        let schema = quote_partition(partition)?;
        let conn = self.client.connection().await?;
        conn.batch_execute(&format!(
            "CREATE SCHEMA IF NOT EXISTS {schema};
             CREATE TABLE IF NOT EXISTS {schema}.{table} (
                 tenant_id TEXT NOT NULL DEFAULT '',
                 id TEXT NOT NULL,
                 configured JSONB NOT NULL DEFAULT '[]'::jsonb,
                 reported JSONB NOT NULL DEFAULT '[]'::jsonb,
                 updated_ts TIMESTAMPTZ,
                 reported_ts TIMESTAMPTZ,
                 PRIMARY KEY (tenant_id, id)
             );",
            schema = schema,
            table = DEVICES_TABLE
        ))
        .await?;
        info!("created device table");
        Ok(())
    }
}

/// 1.0.1: stamp `tenant_id` on rows of a tenant partition that predate it
pub struct BackfillTenantId {
    client: PostgresClient,
    naming: PartitionNaming,
}

#[async_trait]
impl MigrationStep for BackfillTenantId {
    fn version(&self) -> SchemaVersion {
        SchemaVersion::new(1, 0, 1)
    }

    #[instrument(skip(self, ctx), fields(from = %from))]
    async fn up(&self, ctx: &TenantContext, partition: &str, from: SchemaVersion) -> DomainResult<()> {
        if from >= self.version() {
            return Ok(());
        }
        let Some(tenant_id) = self.naming.tenant_id_of(partition) else {
            debug!("default partition, nothing to backfill");
            return Ok(());
        };
        ctx.run(self.apply(partition, &tenant_id)).await
    }
}

impl BackfillTenantId {
    async fn apply(&self, partition: &str, tenant_id: &str) -> DomainResult<()> {
        let schema = quote_partition(partition)?;
        let conn = self.client.connection().await?;
        let updated = conn
            .execute(
                &format!(
                    "UPDATE {}.{} SET tenant_id = $1 WHERE tenant_id = ''",
                    schema, DEVICES_TABLE
                ),
                &[&tenant_id],
            )
            .await?;
        info!(updated, "backfilled tenant_id");
        Ok(())
    }
}

/// 1.1.0: deployment correlation id
pub struct AddDeploymentId {
    client: PostgresClient,
}

#[async_trait]
impl MigrationStep for AddDeploymentId {
    fn version(&self) -> SchemaVersion {
        SchemaVersion::new(1, 1, 0)
    }

    #[instrument(skip(self, ctx), fields(from = %from))]
    async fn up(&self, ctx: &TenantContext, partition: &str, from: SchemaVersion) -> DomainResult<()> {
        if from >= self.version() {
            return Ok(());
        }
        ctx.run(self.apply(partition)).await
    }
}

impl AddDeploymentId {
    async fn apply(&self, partition: &str) -> DomainResult<()> {
        let schema = quote_partition(partition)?;
        let conn = self.client.connection().await?;
        conn.batch_execute(&format!(
            "ALTER TABLE {}.{} ADD COLUMN IF NOT EXISTS deployment_id UUID",
            schema, DEVICES_TABLE
        ))
        .await?;
        info!("added deployment_id column");
        Ok(())
    }
}
