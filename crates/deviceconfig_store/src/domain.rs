mod configuration_service;
mod in_memory_device_repository;
mod in_memory_migration_history;
mod in_memory_partition_resolver;
mod migration_orchestrator;
mod tenant_service;

pub use configuration_service::*;
pub use in_memory_device_repository::*;
pub use in_memory_migration_history::*;
pub use in_memory_partition_resolver::*;
pub use migration_orchestrator::*;
pub use tenant_service::*;
