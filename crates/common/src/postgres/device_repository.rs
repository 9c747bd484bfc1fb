use crate::domain::{
    Attribute, AttributeSet, Device, DeviceRepository, DomainError, DomainResult,
    PartitionNaming, PushAttributesRepoInput, ReplaceAttributesRepoInput, TenantContext,
};
use crate::postgres::{
    map_write_error, quote_identifier, quote_partition, PostgresClient, DEVICES_TABLE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;
use tracing::{debug, instrument};
use uuid::Uuid;

const DEVICE_COLUMNS: &str =
    "tenant_id, id, configured, reported, deployment_id, updated_ts, reported_ts";

/// Device row as stored in a partition's device table
#[derive(Debug, Clone)]
pub struct DeviceRow {
    pub tenant_id: String,
    pub id: String,
    pub configured: serde_json::Value,
    pub reported: serde_json::Value,
    pub deployment_id: Option<Uuid>,
    pub updated_ts: Option<DateTime<Utc>>,
    pub reported_ts: Option<DateTime<Utc>>,
}

impl DeviceRow {
    fn from_row(row: &Row) -> Self {
        Self {
            tenant_id: row.get(0),
            id: row.get(1),
            configured: row.get(2),
            reported: row.get(3),
            deployment_id: row.get(4),
            updated_ts: row.get(5),
            reported_ts: row.get(6),
        }
    }
}

impl TryFrom<DeviceRow> for Device {
    type Error = DomainError;

    fn try_from(row: DeviceRow) -> DomainResult<Self> {
        Ok(Device {
            configured: decode_attributes(&row.id, row.configured)?,
            reported: decode_attributes(&row.id, row.reported)?,
            id: row.id,
            tenant_id: row.tenant_id,
            deployment_id: row.deployment_id,
            updated_ts: row.updated_ts,
            reported_ts: row.reported_ts,
        })
    }
}

/// Attribute sets are stored as a JSONB array of `{key, value}` objects so
/// that entry order survives the round trip.
fn encode_attributes(attributes: &AttributeSet) -> DomainResult<serde_json::Value> {
    serde_json::to_value(attributes.as_slice())
        .map_err(|e| DomainError::StorageUnavailable(e.into()))
}

fn decode_attributes(device_id: &str, value: serde_json::Value) -> DomainResult<AttributeSet> {
    let attributes: Vec<Attribute> = serde_json::from_value(value).map_err(|e| {
        DomainError::StorageUnavailable(anyhow::anyhow!(
            "corrupt attributes for device {}: {}",
            device_id,
            e
        ))
    })?;
    Ok(AttributeSet::new(attributes))
}

/// PostgreSQL implementation of DeviceRepository trait
#[derive(Clone)]
pub struct PostgresDeviceRepository {
    client: PostgresClient,
    naming: PartitionNaming,
}

impl PostgresDeviceRepository {
    pub fn new(client: PostgresClient, naming: PartitionNaming) -> Self {
        Self { client, naming }
    }

    /// Quoted `<partition>.devices` for the caller's tenant
    fn table_for(&self, ctx: &TenantContext) -> DomainResult<String> {
        let schema = quote_partition(&self.naming.partition_for(ctx))?;
        Ok(format!("{}.{}", schema, DEVICES_TABLE))
    }

    async fn insert(&self, table: String, device: Device) -> DomainResult<Device> {
        let conn = self.client.connection().await?;

        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                table, DEVICE_COLUMNS
            ),
            &[
                &device.tenant_id,
                &device.id,
                &encode_attributes(&device.configured)?,
                &encode_attributes(&device.reported)?,
                &device.deployment_id,
                &device.updated_ts,
                &device.reported_ts,
            ],
        )
        .await
        .map_err(|e| map_write_error(e, || DomainError::DeviceAlreadyExists(device.id.clone())))?;

        debug!("inserted device: {}", device.id);
        Ok(device)
    }

    async fn select(
        &self,
        table: String,
        tenant_id: &str,
        device_id: &str,
    ) -> DomainResult<Option<Device>> {
        let conn = self.client.connection().await?;

        let row = conn
            .query_opt(
                &format!(
                    "SELECT {} FROM {} WHERE tenant_id = $1 AND id = $2",
                    DEVICE_COLUMNS, table
                ),
                &[&tenant_id, &device_id],
            )
            .await?;

        row.map(|row| Device::try_from(DeviceRow::from_row(&row)))
            .transpose()
    }

    async fn delete(&self, table: String, tenant_id: &str, device_id: &str) -> DomainResult<()> {
        let conn = self.client.connection().await?;

        let deleted = conn
            .execute(
                &format!("DELETE FROM {} WHERE tenant_id = $1 AND id = $2", table),
                &[&tenant_id, &device_id],
            )
            .await?;

        if deleted == 0 {
            return Err(DomainError::DeviceNotFound(device_id.to_string()));
        }

        debug!("deleted device: {}", device_id);
        Ok(())
    }

    /// Shared body of both full-replace writes; `column` and `ts_column` are
    /// compile-time constants.
    async fn upsert_attributes(
        &self,
        table: String,
        tenant_id: &str,
        input: ReplaceAttributesRepoInput,
        column: &'static str,
        ts_column: &'static str,
    ) -> DomainResult<()> {
        let conn = self.client.connection().await?;
        let now = Utc::now();

        conn.execute(
            &format!(
                "INSERT INTO {table} (tenant_id, id, {column}, {ts_column})
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (tenant_id, id)
                 DO UPDATE SET {column} = EXCLUDED.{column}, {ts_column} = EXCLUDED.{ts_column}",
                table = table,
                column = column,
                ts_column = ts_column
            ),
            &[
                &tenant_id,
                &input.device_id,
                &encode_attributes(&input.attributes)?,
                &now,
            ],
        )
        .await?;

        debug!("replaced {} for device: {}", column, input.device_id);
        Ok(())
    }

    async fn pull_keys(
        &self,
        table: String,
        tenant_id: &str,
        device_id: &str,
        keys: Vec<String>,
    ) -> DomainResult<()> {
        let conn = self.client.connection().await?;

        let updated = conn
            .execute(
                &format!(
                    "UPDATE {} SET configured = COALESCE((
                         SELECT jsonb_agg(elem ORDER BY ord)
                         FROM jsonb_array_elements(configured) WITH ORDINALITY AS t(elem, ord)
                         WHERE NOT (elem->>'key' = ANY($3))
                     ), '[]'::jsonb)
                     WHERE tenant_id = $1 AND id = $2",
                    table
                ),
                &[&tenant_id, &device_id, &keys],
            )
            .await?;

        if updated == 0 {
            return Err(DomainError::DeviceNotFound(device_id.to_string()));
        }

        debug!("pulled {} keys from device: {}", keys.len(), device_id);
        Ok(())
    }

    async fn push_bounded(
        &self,
        table: String,
        tenant_id: &str,
        input: PushAttributesRepoInput,
    ) -> DomainResult<()> {
        let conn = self.client.connection().await?;
        let now = Utc::now();
        let max_length = i64::try_from(input.max_length).unwrap_or(i64::MAX);

        // Newest entries sit at the end of the array; keep the last
        // `max_length` of them in their original order.
        let updated = conn
            .execute(
                &format!(
                    "UPDATE {} SET configured = COALESCE((
                         SELECT jsonb_agg(elem ORDER BY ord)
                         FROM (
                             SELECT elem, ord
                             FROM jsonb_array_elements(configured || $3::jsonb)
                                  WITH ORDINALITY AS t(elem, ord)
                             ORDER BY ord DESC
                             LIMIT $4
                         ) kept
                     ), '[]'::jsonb),
                     updated_ts = $5
                     WHERE tenant_id = $1 AND id = $2",
                    table
                ),
                &[
                    &tenant_id,
                    &input.device_id,
                    &encode_attributes(&input.attributes)?,
                    &max_length,
                    &now,
                ],
            )
            .await?;

        if updated == 0 {
            return Err(DomainError::DeviceNotFound(input.device_id));
        }

        debug!(
            "pushed {} attributes to device: {}",
            input.attributes.len(),
            input.device_id
        );
        Ok(())
    }

    async fn stamp_deployment(
        &self,
        table: String,
        tenant_id: &str,
        device_id: &str,
        deployment_id: Uuid,
    ) -> DomainResult<()> {
        let conn = self.client.connection().await?;

        let updated = conn
            .execute(
                &format!(
                    "UPDATE {} SET deployment_id = $3 WHERE tenant_id = $1 AND id = $2",
                    table
                ),
                &[&tenant_id, &device_id, &deployment_id],
            )
            .await?;

        if updated == 0 {
            return Err(DomainError::DeviceNotFound(device_id.to_string()));
        }
        Ok(())
    }

    async fn delete_tenant_rows(&self, partition: String, tenant_id: &str) -> DomainResult<u64> {
        let schema = quote_partition(&partition)?;
        let mut conn = self.client.connection().await?;
        let tx = conn.transaction().await?;

        let tables: Vec<String> = tx
            .query(
                "SELECT DISTINCT table_name::text FROM information_schema.columns
                 WHERE table_schema = $1 AND column_name = 'tenant_id'",
                &[&partition],
            )
            .await?
            .iter()
            .map(|row| row.get(0))
            .collect();

        let mut removed = 0;
        for table in &tables {
            removed += tx
                .execute(
                    &format!(
                        "DELETE FROM {}.{} WHERE tenant_id = $1",
                        schema,
                        quote_identifier("table", table)?
                    ),
                    &[&tenant_id],
                )
                .await?;
        }

        tx.commit().await?;
        debug!(tables = tables.len(), removed, "deleted tenant rows");
        Ok(removed)
    }
}

#[async_trait]
impl DeviceRepository for PostgresDeviceRepository {
    #[instrument(skip(self, ctx, device), fields(device_id = %device.id, tenant_id = ctx.tenant_id_or_default()))]
    async fn insert_device(&self, ctx: &TenantContext, mut device: Device) -> DomainResult<Device> {
        let table = self.table_for(ctx)?;
        device.tenant_id = ctx.tenant_id_or_default().to_string();
        ctx.run(self.insert(table, device)).await
    }

    #[instrument(skip(self, ctx), fields(tenant_id = ctx.tenant_id_or_default()))]
    async fn get_device(
        &self,
        ctx: &TenantContext,
        device_id: &str,
    ) -> DomainResult<Option<Device>> {
        let table = self.table_for(ctx)?;
        ctx.run(self.select(table, ctx.tenant_id_or_default(), device_id))
            .await
    }

    #[instrument(skip(self, ctx), fields(tenant_id = ctx.tenant_id_or_default()))]
    async fn delete_device(&self, ctx: &TenantContext, device_id: &str) -> DomainResult<()> {
        let table = self.table_for(ctx)?;
        ctx.run(self.delete(table, ctx.tenant_id_or_default(), device_id))
            .await
    }

    #[instrument(skip(self, ctx, input), fields(device_id = %input.device_id, tenant_id = ctx.tenant_id_or_default()))]
    async fn upsert_configuration(
        &self,
        ctx: &TenantContext,
        input: ReplaceAttributesRepoInput,
    ) -> DomainResult<()> {
        let table = self.table_for(ctx)?;
        ctx.run(self.upsert_attributes(
            table,
            ctx.tenant_id_or_default(),
            input,
            "configured",
            "updated_ts",
        ))
        .await
    }

    #[instrument(skip(self, ctx, input), fields(device_id = %input.device_id, tenant_id = ctx.tenant_id_or_default()))]
    async fn upsert_reported_configuration(
        &self,
        ctx: &TenantContext,
        input: ReplaceAttributesRepoInput,
    ) -> DomainResult<()> {
        let table = self.table_for(ctx)?;
        ctx.run(self.upsert_attributes(
            table,
            ctx.tenant_id_or_default(),
            input,
            "reported",
            "reported_ts",
        ))
        .await
    }

    #[instrument(skip(self, ctx, keys), fields(tenant_id = ctx.tenant_id_or_default()))]
    async fn pull_configuration_keys(
        &self,
        ctx: &TenantContext,
        device_id: &str,
        keys: Vec<String>,
    ) -> DomainResult<()> {
        let table = self.table_for(ctx)?;
        ctx.run(self.pull_keys(table, ctx.tenant_id_or_default(), device_id, keys))
            .await
    }

    #[instrument(skip(self, ctx, input), fields(device_id = %input.device_id, tenant_id = ctx.tenant_id_or_default()))]
    async fn push_configuration(
        &self,
        ctx: &TenantContext,
        input: PushAttributesRepoInput,
    ) -> DomainResult<()> {
        let table = self.table_for(ctx)?;
        ctx.run(self.push_bounded(table, ctx.tenant_id_or_default(), input))
            .await
    }

    #[instrument(skip(self, ctx), fields(deployment_id = %deployment_id, tenant_id = ctx.tenant_id_or_default()))]
    async fn set_deployment_id(
        &self,
        ctx: &TenantContext,
        device_id: &str,
        deployment_id: Uuid,
    ) -> DomainResult<()> {
        let table = self.table_for(ctx)?;
        ctx.run(self.stamp_deployment(table, ctx.tenant_id_or_default(), device_id, deployment_id))
            .await
    }

    #[instrument(skip(self, ctx))]
    async fn delete_tenant(&self, ctx: &TenantContext, tenant_id: &str) -> DomainResult<u64> {
        let partition = self.naming.partition_for(ctx);
        ctx.run(self.delete_tenant_rows(partition, tenant_id)).await
    }

    async fn ping(&self) -> DomainResult<()> {
        self.client
            .ping()
            .await
            .map_err(DomainError::StorageUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributes_keep_order_through_storage_encoding() {
        let attributes: AttributeSet = vec![("z", "1"), ("a", "2"), ("m", "3")]
            .into_iter()
            .collect();

        let encoded = encode_attributes(&attributes).unwrap();
        assert_eq!(
            encoded,
            serde_json::json!([
                {"key": "z", "value": "1"},
                {"key": "a", "value": "2"},
                {"key": "m", "value": "3"}
            ])
        );

        let decoded = decode_attributes("dev-1", encoded).unwrap();
        assert_eq!(decoded, attributes);
    }

    #[test]
    fn test_decode_rejects_corrupt_column() {
        let result = decode_attributes("dev-1", serde_json::json!({"not": "an array"}));
        assert!(matches!(result, Err(DomainError::StorageUnavailable(_))));
    }
}
