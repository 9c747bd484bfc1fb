use crate::domain::attribute::AttributeSet;
use crate::domain::result::DomainResult;
use crate::domain::tenant::TenantContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Domain representation of a device's configuration record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Device {
    /// Assigned by the device identity system; unique within a partition.
    #[garde(length(min = 1))]
    pub id: String,
    #[garde(skip)]
    #[serde(default)]
    pub tenant_id: String,
    /// Desired configuration, written by management operations only.
    #[garde(dive)]
    #[serde(default)]
    pub configured: AttributeSet,
    /// Last configuration reported by the device itself.
    #[garde(dive)]
    #[serde(default)]
    pub reported: AttributeSet,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<Uuid>,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_ts: Option<DateTime<Utc>>,
    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_ts: Option<DateTime<Utc>>,
}

impl Device {
    /// A freshly provisioned device with empty attribute sets.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: String::new(),
            configured: AttributeSet::default(),
            reported: AttributeSet::default(),
            deployment_id: None,
            updated_ts: None,
            reported_ts: None,
        }
    }
}

/// Repository input for a full replace of one attribute set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceAttributesRepoInput {
    pub device_id: String,
    pub attributes: AttributeSet,
}

/// Repository input for the push-and-bound step of an update merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushAttributesRepoInput {
    pub device_id: String,
    pub attributes: AttributeSet,
    pub max_length: usize,
}

/// Repository trait for device configuration persistence.
///
/// Every method resolves the tenant partition from `ctx` and filters rows by
/// both partition and `tenant_id`. Single-row writes are atomic; nothing here
/// spans more than one statement except `delete_tenant`.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Insert a new device. Fails with `DeviceAlreadyExists` on a duplicate id.
    async fn insert_device(&self, ctx: &TenantContext, device: Device) -> DomainResult<Device>;

    /// Point lookup by id
    async fn get_device(&self, ctx: &TenantContext, device_id: &str)
        -> DomainResult<Option<Device>>;

    /// Hard delete. Fails with `DeviceNotFound` when nothing matched.
    async fn delete_device(&self, ctx: &TenantContext, device_id: &str) -> DomainResult<()>;

    /// Replace `configured` and stamp `updated_ts`, creating the row if absent
    async fn upsert_configuration(
        &self,
        ctx: &TenantContext,
        input: ReplaceAttributesRepoInput,
    ) -> DomainResult<()>;

    /// Replace `reported` and stamp `reported_ts`, creating the row if absent
    async fn upsert_reported_configuration(
        &self,
        ctx: &TenantContext,
        input: ReplaceAttributesRepoInput,
    ) -> DomainResult<()>;

    /// Merge step 1: remove the listed keys from `configured`.
    /// Fails with `DeviceNotFound` when the device does not exist.
    async fn pull_configuration_keys(
        &self,
        ctx: &TenantContext,
        device_id: &str,
        keys: Vec<String>,
    ) -> DomainResult<()>;

    /// Merge step 2: append to `configured`, keep the newest `max_length`
    /// entries and stamp `updated_ts`.
    async fn push_configuration(
        &self,
        ctx: &TenantContext,
        input: PushAttributesRepoInput,
    ) -> DomainResult<()>;

    /// Stamp the deployment correlation id. Never creates a device.
    async fn set_deployment_id(
        &self,
        ctx: &TenantContext,
        device_id: &str,
        deployment_id: Uuid,
    ) -> DomainResult<()>;

    /// Remove every row tagged with `tenant_id` from every table of the
    /// resolved partition. Returns the number of removed rows.
    async fn delete_tenant(&self, ctx: &TenantContext, tenant_id: &str) -> DomainResult<u64>;

    /// Verify the storage engine is reachable
    async fn ping(&self) -> DomainResult<()>;
}
