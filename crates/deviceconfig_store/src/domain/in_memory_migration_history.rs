use async_trait::async_trait;
use chrono::Utc;
use common::domain::{
    DomainResult, MigrationHistoryRepository, MigrationRecord, SchemaVersion, TenantContext,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory migration log, one append-only list per partition
#[derive(Default)]
pub struct InMemoryMigrationHistory {
    records: Arc<RwLock<HashMap<String, Vec<MigrationRecord>>>>,
}

impl InMemoryMigrationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a partition's log, oldest first
    pub async fn records(&self, partition: &str) -> Vec<MigrationRecord> {
        let records = self.records.read().await;
        records.get(partition).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl MigrationHistoryRepository for InMemoryMigrationHistory {
    async fn applied_migrations(
        &self,
        ctx: &TenantContext,
        partition: &str,
    ) -> DomainResult<Vec<MigrationRecord>> {
        ctx.run(async { Ok(self.records(partition).await) }).await
    }

    async fn record_migration(
        &self,
        ctx: &TenantContext,
        partition: &str,
        version: SchemaVersion,
    ) -> DomainResult<()> {
        ctx.run(async {
            let mut records = self.records.write().await;
            let log = records.entry(partition.to_string()).or_default();
            if !log.iter().any(|r| r.version == version) {
                log.push(MigrationRecord {
                    partition: partition.to_string(),
                    version,
                    applied_at: Utc::now(),
                });
            }
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_migration_is_append_only_and_deduplicated() {
        let history = InMemoryMigrationHistory::new();
        let ctx = TenantContext::new();

        history
            .record_migration(&ctx, "deviceconfig", SchemaVersion::new(1, 0, 0))
            .await
            .unwrap();
        history
            .record_migration(&ctx, "deviceconfig", SchemaVersion::new(1, 0, 0))
            .await
            .unwrap();

        let records = history.applied_migrations(&ctx, "deviceconfig").await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(history
            .applied_migrations(&ctx, "deviceconfig-t1")
            .await
            .unwrap()
            .is_empty());
    }
}
