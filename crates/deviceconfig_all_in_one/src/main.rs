mod config;

use anyhow::Context;
use common::domain::{PartitionNaming, TenantContext};
use common::postgres::{
    migration_steps, PostgresClient, PostgresDeviceRepository, PostgresMigrationHistoryRepository,
    PostgresPartitionResolver,
};
use common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig, TelemetryProviders};
use crate::config::ServiceConfig;
use deviceconfig_runner::Runner;
use deviceconfig_store::{ConfigurationService, MigrationOrchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let telemetry_providers: Option<TelemetryProviders> = match init_telemetry(&TelemetryConfig {
        service_name: config.otel_service_name.clone(),
        otel_endpoint: config.otel_endpoint.clone(),
        otel_enabled: config.otel_enabled,
        log_level: config.log_level.clone(),
        json_logs: config.json_logs,
    }) {
        Ok(providers) => providers,
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {:#}", e);
            std::process::exit(1);
        }
    };

    info!(
        target_version = %config.target_version,
        auto_migrate = config.auto_migrate,
        tenant = config.migrate_tenant().unwrap_or("<all>"),
        "starting deviceconfig migration"
    );
    debug!(
        postgres_host = %config.postgres_host,
        postgres_database = %config.postgres_database,
        partition_base = %config.partition_base,
        "configuration loaded"
    );

    let postgres_client = match connect(&config).await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to initialize PostgreSQL: {:#}", e);
            shutdown_telemetry(telemetry_providers);
            std::process::exit(1);
        }
    };

    let naming = PartitionNaming::new(config.partition_base.clone());
    let orchestrator = MigrationOrchestrator::new(
        Arc::new(PostgresPartitionResolver::new(
            postgres_client.clone(),
            naming.clone(),
        )),
        Arc::new(PostgresMigrationHistoryRepository::new(
            postgres_client.clone(),
        )),
        migration_steps(postgres_client.clone(), naming),
    );

    let target_version = config.target_version.clone();
    let auto_migrate = config.auto_migrate;
    let tenant = config.migrate_tenant().map(str::to_string);

    Runner::new()
        .with_process("migrate", move |ctx| {
            run_migration(orchestrator, ctx, tenant, target_version, auto_migrate)
        })
        .with_closer("postgres", move || async move {
            postgres_client.close();
            Ok(())
        })
        .with_closer("telemetry", move || async move {
            shutdown_telemetry(telemetry_providers);
            Ok(())
        })
        .with_closer_timeout(Duration::from_secs(10))
        .run()
        .await;
}

/// Build the pool and check it answers, bounded by the startup timeout.
async fn connect(config: &ServiceConfig) -> anyhow::Result<PostgresClient> {
    let client = PostgresClient::from_config(&config.postgres())?;

    let health = ConfigurationService::new(Arc::new(PostgresDeviceRepository::new(
        client.clone(),
        PartitionNaming::new(config.partition_base.clone()),
    )));
    tokio::time::timeout(
        Duration::from_secs(config.startup_timeout_secs),
        health.health_check(),
    )
    .await
    .context("timed out waiting for PostgreSQL")?
    .context("PostgreSQL health check failed")?;

    info!("PostgreSQL is reachable");
    Ok(client)
}

async fn run_migration(
    orchestrator: MigrationOrchestrator,
    ctx: CancellationToken,
    tenant: Option<String>,
    target_version: String,
    auto_migrate: bool,
) -> anyhow::Result<()> {
    let mut tenant_ctx = TenantContext::new().with_cancellation(ctx);
    if let Some(tenant) = tenant {
        tenant_ctx = tenant_ctx.with_tenant(tenant);
    }

    let summary = orchestrator
        .migrate(&tenant_ctx, &target_version, auto_migrate)
        .await
        .with_context(|| format!("migration to {} failed", target_version))?;

    info!(
        migrated = ?summary.migrated,
        up_to_date = summary.up_to_date.len(),
        "all partitions at {}",
        target_version
    );
    Ok(())
}
