use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device already exists: {0}")]
    DeviceAlreadyExists(String),

    #[error("Invalid schema version: {0}")]
    InvalidVersion(String),

    #[error("Partition {partition} needs migration from {current} to {target}")]
    MigrationRequired {
        partition: String,
        current: String,
        target: String,
    },

    #[error("Failed to migrate partition {partition}: {source}")]
    MigrationFailed {
        partition: String,
        #[source]
        source: Box<DomainError>,
    },

    #[error("Failed to resolve tenant partitions: {0}")]
    PartitionDiscoveryFailed(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] anyhow::Error),
}

impl DomainError {
    /// Status code the request layer reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            DomainError::DeviceNotFound(_) => 404,
            DomainError::DeviceAlreadyExists(_) => 409,
            DomainError::ValidationError(_) => 400,
            _ => 500,
        }
    }

    /// True when the error came out of the `Migrate` gate for a partition,
    /// looking through the per-partition wrapper.
    pub fn is_migration_required(&self) -> bool {
        match self {
            DomainError::MigrationRequired { .. } => true,
            DomainError::MigrationFailed { source, .. } => source.is_migration_required(),
            _ => false,
        }
    }
}

impl From<tokio_postgres::Error> for DomainError {
    fn from(e: tokio_postgres::Error) -> Self {
        DomainError::StorageUnavailable(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(DomainError::DeviceNotFound("d".into()).status_code(), 404);
        assert_eq!(DomainError::DeviceAlreadyExists("d".into()).status_code(), 409);
        assert_eq!(DomainError::ValidationError("bad".into()).status_code(), 400);
        assert_eq!(
            DomainError::InvalidVersion("x".into()).status_code(),
            500
        );
        assert_eq!(
            DomainError::StorageUnavailable(anyhow::anyhow!("down")).status_code(),
            500
        );
    }

    #[test]
    fn test_migration_required_through_wrapper() {
        let err = DomainError::MigrationFailed {
            partition: "deviceconfig-t1".to_string(),
            source: Box::new(DomainError::MigrationRequired {
                partition: "deviceconfig-t1".to_string(),
                current: "0.0.0".to_string(),
                target: "1.1.0".to_string(),
            }),
        };
        assert!(err.is_migration_required());
        assert!(err.to_string().contains("deviceconfig-t1"));
    }
}
