use crate::domain::{ConfigurationService, MigrationOrchestrator, MigrationSummary};
use common::domain::{DomainError, DomainResult, TenantContext};
use std::sync::Arc;
use tracing::{info, instrument};

/// Tenant onboarding and offboarding
pub struct TenantService {
    orchestrator: Arc<MigrationOrchestrator>,
    configuration: Arc<ConfigurationService>,
}

impl TenantService {
    pub fn new(
        orchestrator: Arc<MigrationOrchestrator>,
        configuration: Arc<ConfigurationService>,
    ) -> Self {
        Self {
            orchestrator,
            configuration,
        }
    }

    /// Create and fully migrate a new tenant's partition. A fresh partition
    /// has no data, so it is always auto-migrated.
    #[instrument(skip(self, ctx))]
    pub async fn provision_tenant(
        &self,
        ctx: &TenantContext,
        tenant_id: &str,
    ) -> DomainResult<MigrationSummary> {
        let scoped = tenant_scope(ctx, tenant_id)?;
        let summary = self.orchestrator.migrate_latest(&scoped).await?;
        info!("tenant provisioned");
        Ok(summary)
    }

    /// Purge every record of the tenant from its own partition. Returns the
    /// number of removed rows.
    #[instrument(skip(self, ctx))]
    pub async fn delete_tenant(&self, ctx: &TenantContext, tenant_id: &str) -> DomainResult<u64> {
        let scoped = tenant_scope(ctx, tenant_id)?;
        self.configuration.delete_tenant(&scoped, tenant_id).await
    }
}

/// Keep the caller's cancellation and deadline, swap in the tenant.
fn tenant_scope(ctx: &TenantContext, tenant_id: &str) -> DomainResult<TenantContext> {
    if tenant_id.is_empty() {
        return Err(DomainError::ValidationError(
            "tenant id cannot be empty".to_string(),
        ));
    }
    Ok(ctx.clone().with_tenant(tenant_id))
}
