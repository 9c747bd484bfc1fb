use async_trait::async_trait;
use chrono::Utc;
use common::domain::{
    Device, DeviceRepository, DomainError, DomainResult, PartitionNaming,
    PushAttributesRepoInput, ReplaceAttributesRepoInput, TenantContext,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// (partition, tenant_id, device id)
type DeviceKey = (String, String, String);

/// In-memory implementation of DeviceRepository using HashMap.
///
/// Rows are keyed the same way as the PostgreSQL table, so partition and
/// tenant filtering behave identically. Each method takes the lock once, which
/// gives the same single-row atomicity as the database and no more.
pub struct InMemoryDeviceRepository {
    naming: PartitionNaming,
    devices: Arc<RwLock<HashMap<DeviceKey, Device>>>,
}

impl InMemoryDeviceRepository {
    pub fn new(naming: PartitionNaming) -> Self {
        Self {
            naming,
            devices: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn key(&self, ctx: &TenantContext, device_id: &str) -> DeviceKey {
        (
            self.naming.partition_for(ctx),
            ctx.tenant_id_or_default().to_string(),
            device_id.to_string(),
        )
    }

    /// Number of stored rows across every partition
    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}

impl Default for InMemoryDeviceRepository {
    fn default() -> Self {
        Self::new(PartitionNaming::default())
    }
}

#[async_trait]
impl DeviceRepository for InMemoryDeviceRepository {
    async fn insert_device(&self, ctx: &TenantContext, mut device: Device) -> DomainResult<Device> {
        ctx.run(async move {
            device.tenant_id = ctx.tenant_id_or_default().to_string();
            let key = self.key(ctx, &device.id);

            let mut devices = self.devices.write().await;
            if devices.contains_key(&key) {
                return Err(DomainError::DeviceAlreadyExists(device.id));
            }
            devices.insert(key, device.clone());
            Ok(device)
        })
        .await
    }

    async fn get_device(
        &self,
        ctx: &TenantContext,
        device_id: &str,
    ) -> DomainResult<Option<Device>> {
        let key = self.key(ctx, device_id);
        ctx.run(async {
            let devices = self.devices.read().await;
            Ok(devices.get(&key).cloned())
        })
        .await
    }

    async fn delete_device(&self, ctx: &TenantContext, device_id: &str) -> DomainResult<()> {
        let key = self.key(ctx, device_id);
        ctx.run(async {
            let mut devices = self.devices.write().await;
            match devices.remove(&key) {
                Some(_) => Ok(()),
                None => Err(DomainError::DeviceNotFound(device_id.to_string())),
            }
        })
        .await
    }

    async fn upsert_configuration(
        &self,
        ctx: &TenantContext,
        input: ReplaceAttributesRepoInput,
    ) -> DomainResult<()> {
        let key = self.key(ctx, &input.device_id);
        ctx.run(async {
            let mut devices = self.devices.write().await;
            let device = devices.entry(key).or_insert_with(|| {
                let mut device = Device::new(input.device_id.clone());
                device.tenant_id = ctx.tenant_id_or_default().to_string();
                device
            });
            device.configured = input.attributes;
            device.updated_ts = Some(Utc::now());
            Ok(())
        })
        .await
    }

    async fn upsert_reported_configuration(
        &self,
        ctx: &TenantContext,
        input: ReplaceAttributesRepoInput,
    ) -> DomainResult<()> {
        let key = self.key(ctx, &input.device_id);
        ctx.run(async {
            let mut devices = self.devices.write().await;
            let device = devices.entry(key).or_insert_with(|| {
                let mut device = Device::new(input.device_id.clone());
                device.tenant_id = ctx.tenant_id_or_default().to_string();
                device
            });
            device.reported = input.attributes;
            device.reported_ts = Some(Utc::now());
            Ok(())
        })
        .await
    }

    async fn pull_configuration_keys(
        &self,
        ctx: &TenantContext,
        device_id: &str,
        keys: Vec<String>,
    ) -> DomainResult<()> {
        let key = self.key(ctx, device_id);
        ctx.run(async {
            let mut devices = self.devices.write().await;
            let device = devices
                .get_mut(&key)
                .ok_or_else(|| DomainError::DeviceNotFound(device_id.to_string()))?;
            device.configured = device.configured.without_keys(&keys);
            Ok(())
        })
        .await
    }

    async fn push_configuration(
        &self,
        ctx: &TenantContext,
        input: PushAttributesRepoInput,
    ) -> DomainResult<()> {
        let key = self.key(ctx, &input.device_id);
        ctx.run(async {
            let mut devices = self.devices.write().await;
            let device = devices
                .get_mut(&key)
                .ok_or_else(|| DomainError::DeviceNotFound(input.device_id.clone()))?;
            device.configured = device
                .configured
                .push_bounded(&input.attributes, input.max_length);
            device.updated_ts = Some(Utc::now());
            Ok(())
        })
        .await
    }

    async fn set_deployment_id(
        &self,
        ctx: &TenantContext,
        device_id: &str,
        deployment_id: Uuid,
    ) -> DomainResult<()> {
        let key = self.key(ctx, device_id);
        ctx.run(async {
            let mut devices = self.devices.write().await;
            let device = devices
                .get_mut(&key)
                .ok_or_else(|| DomainError::DeviceNotFound(device_id.to_string()))?;
            device.deployment_id = Some(deployment_id);
            Ok(())
        })
        .await
    }

    async fn delete_tenant(&self, ctx: &TenantContext, tenant_id: &str) -> DomainResult<u64> {
        let partition = self.naming.partition_for(ctx);
        ctx.run(async {
            let mut devices = self.devices.write().await;
            let before = devices.len();
            devices.retain(|(p, t, _), _| !(*p == partition && t == tenant_id));
            Ok((before - devices.len()) as u64)
        })
        .await
    }

    async fn ping(&self) -> DomainResult<()> {
        Ok(())
    }
}
