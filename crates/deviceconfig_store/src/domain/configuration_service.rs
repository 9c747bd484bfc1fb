use chrono::Utc;
use common::domain::{
    AttributeSet, Device, DeviceRepository, DomainError, DomainResult, PushAttributesRepoInput,
    ReplaceAttributesRepoInput, TenantContext, ATTRIBUTES_MAX_LENGTH,
};
use common::garde::validate;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Device configuration operations, scoped per tenant.
///
/// Holds no state of its own; every call goes straight to the repository and
/// nothing is retried.
pub struct ConfigurationService {
    device_repository: Arc<dyn DeviceRepository>,
}

impl ConfigurationService {
    pub fn new(device_repository: Arc<dyn DeviceRepository>) -> Self {
        Self { device_repository }
    }

    /// Insert a fully formed device record.
    #[instrument(skip(self, ctx, device), fields(device_id = %device.id, tenant_id = ctx.tenant_id_or_default()))]
    pub async fn insert_device(&self, ctx: &TenantContext, device: Device) -> DomainResult<Device> {
        validate(&device)?;
        device.configured.ensure_unique_keys()?;
        device.reported.ensure_unique_keys()?;

        let device = self.device_repository.insert_device(ctx, device).await?;

        info!("device inserted");
        Ok(device)
    }

    /// Create a device with empty configured and reported sets.
    pub async fn provision_device(&self, ctx: &TenantContext, device_id: &str) -> DomainResult<Device> {
        let mut device = Device::new(device_id);
        device.updated_ts = Some(Utc::now());
        self.insert_device(ctx, device).await
    }

    #[instrument(skip(self, ctx), fields(tenant_id = ctx.tenant_id_or_default()))]
    pub async fn get_device(&self, ctx: &TenantContext, device_id: &str) -> DomainResult<Device> {
        ensure_device_id(device_id)?;

        self.device_repository
            .get_device(ctx, device_id)
            .await?
            .ok_or_else(|| DomainError::DeviceNotFound(device_id.to_string()))
    }

    /// Same lookup as `get_device`, named for the management and device
    /// surfaces that read configuration.
    pub async fn get_configuration(&self, ctx: &TenantContext, device_id: &str) -> DomainResult<Device> {
        self.get_device(ctx, device_id).await
    }

    /// Hard delete. Not idempotent: a second call fails with `DeviceNotFound`.
    #[instrument(skip(self, ctx), fields(tenant_id = ctx.tenant_id_or_default()))]
    pub async fn delete_device(&self, ctx: &TenantContext, device_id: &str) -> DomainResult<()> {
        ensure_device_id(device_id)?;
        self.device_repository.delete_device(ctx, device_id).await?;
        info!("device deleted");
        Ok(())
    }

    pub async fn decommission_device(&self, ctx: &TenantContext, device_id: &str) -> DomainResult<()> {
        self.delete_device(ctx, device_id).await
    }

    /// Replace the desired configuration, creating the device if absent.
    #[instrument(skip(self, ctx, attributes), fields(count = attributes.len(), tenant_id = ctx.tenant_id_or_default()))]
    pub async fn set_configuration(
        &self,
        ctx: &TenantContext,
        device_id: &str,
        attributes: AttributeSet,
    ) -> DomainResult<()> {
        ensure_device_id(device_id)?;
        ensure_attributes(&attributes)?;

        self.device_repository
            .upsert_configuration(
                ctx,
                ReplaceAttributesRepoInput {
                    device_id: device_id.to_string(),
                    attributes,
                },
            )
            .await?;

        debug!("configuration replaced");
        Ok(())
    }

    /// Replace the reported configuration, creating the device if absent.
    #[instrument(skip(self, ctx, attributes), fields(count = attributes.len(), tenant_id = ctx.tenant_id_or_default()))]
    pub async fn set_reported_configuration(
        &self,
        ctx: &TenantContext,
        device_id: &str,
        attributes: AttributeSet,
    ) -> DomainResult<()> {
        ensure_device_id(device_id)?;
        ensure_attributes(&attributes)?;

        self.device_repository
            .upsert_reported_configuration(
                ctx,
                ReplaceAttributesRepoInput {
                    device_id: device_id.to_string(),
                    attributes,
                },
            )
            .await?;

        debug!("reported configuration replaced");
        Ok(())
    }

    /// Merge `attributes` into the desired configuration.
    ///
    /// Runs as two ordered writes: the listed keys are pulled from the stored
    /// set, then the new entries are pushed and the set is cut back to
    /// [`ATTRIBUTES_MAX_LENGTH`], dropping the oldest entries first. The pair is
    /// not atomic. If the push fails, the device is left with the listed keys
    /// removed; calling again with the same attributes completes the merge.
    #[instrument(skip(self, ctx, attributes), fields(count = attributes.len(), tenant_id = ctx.tenant_id_or_default()))]
    pub async fn update_configuration(
        &self,
        ctx: &TenantContext,
        device_id: &str,
        attributes: AttributeSet,
    ) -> DomainResult<()> {
        ensure_device_id(device_id)?;
        ensure_attributes(&attributes)?;

        if attributes.is_empty() {
            debug!("empty update, nothing to merge");
            return Ok(());
        }

        self.device_repository
            .pull_configuration_keys(ctx, device_id, attributes.keys())
            .await?;

        let pushed = self
            .device_repository
            .push_configuration(
                ctx,
                PushAttributesRepoInput {
                    device_id: device_id.to_string(),
                    attributes,
                    max_length: ATTRIBUTES_MAX_LENGTH,
                },
            )
            .await;

        if let Err(e) = &pushed {
            warn!(error = %e, "configuration merge interrupted after pull; retry the update");
        }
        pushed?;

        debug!("configuration merged");
        Ok(())
    }

    /// Stamp the deployment correlation id. Never creates a device.
    #[instrument(skip(self, ctx), fields(tenant_id = ctx.tenant_id_or_default()))]
    pub async fn set_deployment_id(
        &self,
        ctx: &TenantContext,
        device_id: &str,
        deployment_id: Uuid,
    ) -> DomainResult<()> {
        ensure_device_id(device_id)?;
        self.device_repository
            .set_deployment_id(ctx, device_id, deployment_id)
            .await
    }

    /// Assign a fresh deployment id to the device and return it, so the caller
    /// can dispatch the configuration under that id.
    pub async fn deploy_configuration(&self, ctx: &TenantContext, device_id: &str) -> DomainResult<Uuid> {
        let deployment_id = Uuid::new_v4();
        self.set_deployment_id(ctx, device_id, deployment_id).await?;
        info!(device_id, deployment_id = %deployment_id, "deployment id assigned");
        Ok(deployment_id)
    }

    /// Remove every record of `tenant_id` from the partition resolved by `ctx`.
    #[instrument(skip(self, ctx), fields(partition_tenant = ctx.tenant_id_or_default()))]
    pub async fn delete_tenant(&self, ctx: &TenantContext, tenant_id: &str) -> DomainResult<u64> {
        let removed = self.device_repository.delete_tenant(ctx, tenant_id).await?;
        info!(removed, "tenant records removed");
        Ok(removed)
    }

    pub async fn health_check(&self) -> DomainResult<()> {
        self.device_repository.ping().await
    }
}

fn ensure_device_id(device_id: &str) -> DomainResult<()> {
    if device_id.is_empty() {
        return Err(DomainError::ValidationError(
            "device id cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn ensure_attributes(attributes: &AttributeSet) -> DomainResult<()> {
    validate(attributes)?;
    attributes.ensure_unique_keys()
}
