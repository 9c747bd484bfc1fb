mod client;
mod config;
mod device_repository;
mod migration_history_repository;
mod migrations;
mod partition_resolver;

pub use client::*;
pub use config::*;
pub use device_repository::*;
pub use migration_history_repository::*;
pub use migrations::*;
pub use partition_resolver::*;
