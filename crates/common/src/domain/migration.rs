use crate::domain::result::{DomainError, DomainResult};
use crate::domain::tenant::TenantContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Schema version of a partition, `major.minor.patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SchemaVersion {
    /// Version of a partition with no applied migrations.
    pub const ZERO: SchemaVersion = SchemaVersion::new(0, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for SchemaVersion {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DomainError::InvalidVersion(format!("{:?}", s));

        let mut parts = s.trim().split('.');
        let mut next = || -> DomainResult<u32> {
            parts
                .next()
                .filter(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
                .ok_or_else(invalid)?
                .parse()
                .map_err(|_| invalid())
        };

        let version = SchemaVersion::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// One row of a partition's append-only migration log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    pub partition: String,
    pub version: SchemaVersion,
    pub applied_at: DateTime<Utc>,
}

/// Highest version recorded in a history, `0.0.0` when empty.
pub fn current_version(history: &[MigrationRecord]) -> SchemaVersion {
    history
        .iter()
        .map(|r| r.version)
        .max()
        .unwrap_or(SchemaVersion::ZERO)
}

/// Persistence of the per-partition migration log.
///
/// Read fresh on every `Migrate` call; nothing is cached across calls.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MigrationHistoryRepository: Send + Sync {
    /// Applied versions for a partition. A partition that was never migrated
    /// has an empty history, and reading it creates nothing.
    async fn applied_migrations(
        &self,
        ctx: &TenantContext,
        partition: &str,
    ) -> DomainResult<Vec<MigrationRecord>>;

    /// Append a history entry. Recording an already recorded version is a no-op.
    async fn record_migration(
        &self,
        ctx: &TenantContext,
        partition: &str,
        version: SchemaVersion,
    ) -> DomainResult<()>;
}

/// A versioned, idempotent schema transition for one partition.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MigrationStep: Send + Sync {
    /// Version the partition is at once this step has run
    fn version(&self) -> SchemaVersion;

    /// Apply the step. Must be a no-op when `from >= self.version()` and safe
    /// to re-run after a partial failure.
    async fn up(
        &self,
        ctx: &TenantContext,
        partition: &str,
        from: SchemaVersion,
    ) -> DomainResult<()>;
}
