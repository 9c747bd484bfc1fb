use crate::domain::result::{DomainError, DomainResult};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default base name for configuration partitions.
pub const DEFAULT_PARTITION_BASE: &str = "deviceconfig";

/// Explicit request scope threaded through every store call.
///
/// Carries the optional tenant identity plus the caller's cancellation token
/// and deadline. An absent tenant means the default (non-tenant) partition for
/// device operations, and "every partition" for migrations.
#[derive(Debug, Clone, Default)]
pub struct TenantContext {
    tenant_id: Option<String>,
    ctx: CancellationToken,
    deadline: Option<Instant>,
}

impl TenantContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope to a tenant. An empty id is treated as no tenant.
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self::new().with_tenant(tenant_id)
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        let tenant_id = tenant_id.into();
        self.tenant_id = if tenant_id.is_empty() {
            None
        } else {
            Some(tenant_id)
        };
        self
    }

    pub fn with_cancellation(mut self, ctx: CancellationToken) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Tenant id as stored in the `tenant_id` column ("" for no tenant).
    pub fn tenant_id_or_default(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or_default()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.ctx
    }

    pub fn is_cancelled(&self) -> bool {
        self.ctx.is_cancelled()
    }

    /// Drive `fut` unless the caller cancels or the deadline passes first.
    pub async fn run<F, T>(&self, fut: F) -> DomainResult<T>
    where
        F: Future<Output = DomainResult<T>>,
    {
        if self.ctx.is_cancelled() {
            return Err(cancelled());
        }

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.ctx.cancelled() => Err(cancelled()),
            _ = deadline => Err(DomainError::StorageUnavailable(anyhow::anyhow!(
                "deadline exceeded"
            ))),
            result = fut => result,
        }
    }
}

fn cancelled() -> DomainError {
    DomainError::StorageUnavailable(anyhow::anyhow!("operation cancelled"))
}

/// Naming convention shared by every partition-aware component.
///
/// The default partition is `<base>`; tenant partitions are `<base>-<tenant>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNaming {
    base: String,
}

impl PartitionNaming {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    pub fn default_partition(&self) -> &str {
        &self.base
    }

    pub fn partition_name(&self, tenant_id: &str) -> String {
        if tenant_id.is_empty() {
            self.base.clone()
        } else {
            format!("{}-{}", self.base, tenant_id)
        }
    }

    pub fn partition_for(&self, ctx: &TenantContext) -> String {
        self.partition_name(ctx.tenant_id_or_default())
    }

    /// Tenant id encoded in a partition name, if it follows the convention.
    pub fn tenant_id_of(&self, partition: &str) -> Option<String> {
        partition
            .strip_prefix(self.base.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .filter(|tenant| !tenant.is_empty())
            .map(str::to_string)
    }

    pub fn is_tenant_partition(&self, partition: &str) -> bool {
        self.tenant_id_of(partition).is_some()
    }
}

impl Default for PartitionNaming {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITION_BASE)
    }
}

/// Maps tenants to storage partitions and enumerates existing tenant partitions.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PartitionResolver: Send + Sync {
    /// Partition holding the given tenant's data ("" maps to the default)
    fn partition_name(&self, tenant_id: &str) -> String;

    /// Every tenant partition currently on the server, excluding the default
    /// partition. Order is unspecified. Fails with `PartitionDiscoveryFailed`
    /// instead of returning a partial list.
    async fn discover_tenant_partitions(&self) -> DomainResult<Vec<String>>;
}
