use crate::domain::{DomainError, DomainResult, PartitionNaming, PartitionResolver};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use tracing::{debug, instrument};

/// Resolves tenant partitions to PostgreSQL schemas.
#[derive(Clone)]
pub struct PostgresPartitionResolver {
    client: PostgresClient,
    naming: PartitionNaming,
}

impl PostgresPartitionResolver {
    pub fn new(client: PostgresClient, naming: PartitionNaming) -> Self {
        Self { client, naming }
    }

    pub fn naming(&self) -> &PartitionNaming {
        &self.naming
    }
}

#[async_trait]
impl PartitionResolver for PostgresPartitionResolver {
    fn partition_name(&self, tenant_id: &str) -> String {
        self.naming.partition_name(tenant_id)
    }

    #[instrument(skip(self), fields(base = %self.naming.default_partition()))]
    async fn discover_tenant_partitions(&self) -> DomainResult<Vec<String>> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(|e| DomainError::PartitionDiscoveryFailed(format!("{:#}", e)))?;

        let rows = conn
            .query(
                "SELECT schema_name::text FROM information_schema.schemata
                 WHERE starts_with(schema_name::text, $1)",
                &[&format!("{}-", self.naming.default_partition())],
            )
            .await
            .map_err(|e| DomainError::PartitionDiscoveryFailed(e.to_string()))?;

        let partitions: Vec<String> = rows
            .iter()
            .map(|row| row.get::<_, String>(0))
            .filter(|name| self.naming.is_tenant_partition(name))
            .collect();

        debug!("discovered {} tenant partitions", partitions.len());
        Ok(partitions)
    }
}
