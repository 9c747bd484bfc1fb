use common::domain::{
    current_version, DomainError, DomainResult, MigrationHistoryRepository, MigrationStep,
    PartitionResolver, SchemaVersion, TenantContext,
};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Outcome of one `migrate` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    /// Partitions that were brought up to the target in this call
    pub migrated: Vec<String>,
    /// Partitions that were already at or above the target
    pub up_to_date: Vec<String>,
}

/// Brings one or every partition to a target schema version.
///
/// The partition history is read fresh on every call and no lock is taken;
/// callers run this from a single controlled entry point (startup, a one-shot
/// command or tenant provisioning).
pub struct MigrationOrchestrator {
    resolver: Arc<dyn PartitionResolver>,
    history: Arc<dyn MigrationHistoryRepository>,
    steps: Vec<Arc<dyn MigrationStep>>,
}

impl MigrationOrchestrator {
    pub fn new(
        resolver: Arc<dyn PartitionResolver>,
        history: Arc<dyn MigrationHistoryRepository>,
        mut steps: Vec<Arc<dyn MigrationStep>>,
    ) -> Self {
        steps.sort_by_key(|step| step.version());
        Self {
            resolver,
            history,
            steps,
        }
    }

    /// Version of the newest registered step
    pub fn latest_version(&self) -> SchemaVersion {
        self.steps
            .last()
            .map(|step| step.version())
            .unwrap_or(SchemaVersion::ZERO)
    }

    /// Migrate to the newest registered step, creating the schema as needed.
    pub async fn migrate_latest(&self, ctx: &TenantContext) -> DomainResult<MigrationSummary> {
        let target = self.latest_version().to_string();
        self.migrate(ctx, &target, true).await
    }

    /// Bring the tenant's partition, or every partition when `ctx` carries no
    /// tenant, to `target_version`.
    ///
    /// Partitions are processed one at a time and the first failure aborts the
    /// call. Partitions finished before the failure stay migrated.
    #[instrument(skip(self, ctx), fields(tenant_id = ctx.tenant_id_or_default()))]
    pub async fn migrate(
        &self,
        ctx: &TenantContext,
        target_version: &str,
        auto_migrate: bool,
    ) -> DomainResult<MigrationSummary> {
        let target: SchemaVersion = target_version.parse()?;
        let partitions = self.partitions_for(ctx).await?;
        debug!(count = partitions.len(), target = %target, "resolved partitions");

        let mut summary = MigrationSummary::default();
        for partition in partitions {
            let migrated = self
                .migrate_partition(ctx, &partition, target, auto_migrate)
                .await
                .map_err(|e| match e {
                    DomainError::MigrationRequired { .. } => e,
                    other => DomainError::MigrationFailed {
                        partition: partition.clone(),
                        source: Box::new(other),
                    },
                })?;

            if migrated {
                summary.migrated.push(partition);
            } else {
                summary.up_to_date.push(partition);
            }
        }

        info!(
            migrated = summary.migrated.len(),
            up_to_date = summary.up_to_date.len(),
            target = %target,
            "migration finished"
        );
        Ok(summary)
    }

    /// The tenant's own partition, or the default partition followed by every
    /// discovered tenant partition.
    async fn partitions_for(&self, ctx: &TenantContext) -> DomainResult<Vec<String>> {
        if let Some(tenant_id) = ctx.tenant_id() {
            return Ok(vec![self.resolver.partition_name(tenant_id)]);
        }

        let default_partition = self.resolver.partition_name("");
        let mut discovered = self.resolver.discover_tenant_partitions().await?;
        discovered.sort();
        discovered.dedup();
        discovered.retain(|p| *p != default_partition);

        let mut partitions = Vec::with_capacity(discovered.len() + 1);
        partitions.push(default_partition);
        partitions.extend(discovered);
        Ok(partitions)
    }

    /// Returns whether any change was made to the partition.
    #[instrument(skip(self, ctx, target, auto_migrate))]
    async fn migrate_partition(
        &self,
        ctx: &TenantContext,
        partition: &str,
        target: SchemaVersion,
        auto_migrate: bool,
    ) -> DomainResult<bool> {
        let history = self.history.applied_migrations(ctx, partition).await?;
        let current = current_version(&history);

        if current >= target {
            debug!(current = %current, "partition is up to date");
            return Ok(false);
        }

        if !auto_migrate {
            return Err(DomainError::MigrationRequired {
                partition: partition.to_string(),
                current: current.to_string(),
                target: target.to_string(),
            });
        }

        let mut version = current;
        for step in &self.steps {
            let step_version = step.version();
            if step_version <= current || step_version > target {
                continue;
            }

            step.up(ctx, partition, version).await?;
            self.history
                .record_migration(ctx, partition, step_version)
                .await?;
            info!(from = %version, to = %step_version, "applied migration step");
            version = step_version;
        }

        if version < target {
            self.history.record_migration(ctx, partition, target).await?;
            version = target;
        }

        info!(from = %current, to = %version, "partition migrated");
        Ok(true)
    }
}
