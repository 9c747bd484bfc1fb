use async_trait::async_trait;
use common::domain::{DomainResult, PartitionNaming, PartitionResolver};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Partition resolver over a fixed, mutable set of known partitions
pub struct InMemoryPartitionResolver {
    naming: PartitionNaming,
    partitions: Arc<RwLock<BTreeSet<String>>>,
}

impl InMemoryPartitionResolver {
    pub fn new(naming: PartitionNaming) -> Self {
        Self {
            naming,
            partitions: Arc::new(RwLock::new(BTreeSet::new())),
        }
    }

    /// Make a tenant's partition discoverable
    pub async fn add_tenant(&self, tenant_id: &str) {
        let partition = self.naming.partition_name(tenant_id);
        self.partitions.write().await.insert(partition);
    }
}

impl Default for InMemoryPartitionResolver {
    fn default() -> Self {
        Self::new(PartitionNaming::default())
    }
}

#[async_trait]
impl PartitionResolver for InMemoryPartitionResolver {
    fn partition_name(&self, tenant_id: &str) -> String {
        self.naming.partition_name(tenant_id)
    }

    async fn discover_tenant_partitions(&self) -> DomainResult<Vec<String>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .iter()
            .filter(|p| self.naming.is_tenant_partition(p))
            .cloned()
            .collect())
    }
}
