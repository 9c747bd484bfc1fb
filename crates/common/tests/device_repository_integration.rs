#![cfg(feature = "integration-tests")]

use common::domain::{
    AttributeSet, Device, DeviceRepository, DomainError, MigrationStep, PartitionNaming,
    PushAttributesRepoInput, ReplaceAttributesRepoInput, SchemaVersion, TenantContext,
    ATTRIBUTES_MAX_LENGTH,
};
use common::postgres::{migration_steps, PostgresClient, PostgresDeviceRepository};
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

async fn setup_test_db() -> (ContainerAsync<Postgres>, PostgresDeviceRepository, PostgresClient) {
    let postgres = Postgres::default().start().await.unwrap();
    let host = postgres.get_host().await.unwrap();
    let port = postgres.get_host_port_ipv4(5432).await.unwrap();

    let client = PostgresClient::new(
        &host.to_string(),
        port,
        "postgres",
        "postgres",
        "postgres",
        5,
    )
    .expect("Failed to create client");

    let repo = PostgresDeviceRepository::new(client.clone(), PartitionNaming::default());
    (postgres, repo, client)
}

/// Apply every step to the tenant's partition
async fn migrate(client: &PostgresClient, ctx: &TenantContext) {
    let naming = PartitionNaming::default();
    let partition = naming.partition_for(ctx);
    let mut from = SchemaVersion::ZERO;
    for step in migration_steps(client.clone(), naming) {
        step.up(ctx, &partition, from).await.expect("migration step failed");
        from = step.version();
    }
}

fn attrs(pairs: &[(&str, &str)]) -> AttributeSet {
    pairs.iter().copied().collect()
}

#[tokio::test]
async fn test_insert_get_delete_device() {
    let (_container, repo, client) = setup_test_db().await;
    let ctx = TenantContext::for_tenant("t1");
    migrate(&client, &ctx).await;

    let inserted = repo.insert_device(&ctx, Device::new("d1")).await.unwrap();
    assert_eq!(inserted.tenant_id, "t1");

    let duplicate = repo.insert_device(&ctx, Device::new("d1")).await;
    assert!(matches!(duplicate, Err(DomainError::DeviceAlreadyExists(_))));

    let fetched = repo.get_device(&ctx, "d1").await.unwrap().unwrap();
    assert_eq!(fetched.id, "d1");
    assert!(fetched.configured.is_empty());

    repo.delete_device(&ctx, "d1").await.unwrap();
    assert!(repo.get_device(&ctx, "d1").await.unwrap().is_none());
    assert!(matches!(
        repo.delete_device(&ctx, "d1").await,
        Err(DomainError::DeviceNotFound(_))
    ));
}

#[tokio::test]
async fn test_tenants_with_same_device_id_are_isolated() {
    let (_container, repo, client) = setup_test_db().await;
    let a = TenantContext::for_tenant("a");
    let b = TenantContext::for_tenant("b");
    migrate(&client, &a).await;
    migrate(&client, &b).await;

    repo.insert_device(&a, Device::new("same")).await.unwrap();
    repo.insert_device(&b, Device::new("same")).await.unwrap();
    repo.upsert_configuration(
        &a,
        ReplaceAttributesRepoInput {
            device_id: "same".to_string(),
            attributes: attrs(&[("owner", "a")]),
        },
    )
    .await
    .unwrap();

    let from_b = repo.get_device(&b, "same").await.unwrap().unwrap();
    assert_eq!(from_b.tenant_id, "b");
    assert!(from_b.configured.is_empty());
}

#[tokio::test]
async fn test_upsert_creates_and_stamps_timestamps() {
    let (_container, repo, client) = setup_test_db().await;
    let ctx = TenantContext::new();
    migrate(&client, &ctx).await;

    repo.upsert_configuration(
        &ctx,
        ReplaceAttributesRepoInput {
            device_id: "d1".to_string(),
            attributes: attrs(&[("host", "a")]),
        },
    )
    .await
    .unwrap();
    repo.upsert_reported_configuration(
        &ctx,
        ReplaceAttributesRepoInput {
            device_id: "d1".to_string(),
            attributes: attrs(&[("host", "b")]),
        },
    )
    .await
    .unwrap();

    let device = repo.get_device(&ctx, "d1").await.unwrap().unwrap();
    assert_eq!(device.configured.get("host"), Some("a"));
    assert_eq!(device.reported.get("host"), Some("b"));
    assert!(device.updated_ts.is_some());
    assert!(device.reported_ts.is_some());
}

#[tokio::test]
async fn test_pull_then_push_merges_and_bounds() {
    let (_container, repo, client) = setup_test_db().await;
    let ctx = TenantContext::for_tenant("t1");
    migrate(&client, &ctx).await;

    let full: AttributeSet = (0..ATTRIBUTES_MAX_LENGTH)
        .map(|i| (format!("k{}", i), "old".to_string()))
        .collect();
    repo.upsert_configuration(
        &ctx,
        ReplaceAttributesRepoInput {
            device_id: "d1".to_string(),
            attributes: full,
        },
    )
    .await
    .unwrap();

    let update = attrs(&[("k5", "new"), ("extra", "1")]);
    repo.pull_configuration_keys(&ctx, "d1", update.keys())
        .await
        .unwrap();
    repo.push_configuration(
        &ctx,
        PushAttributesRepoInput {
            device_id: "d1".to_string(),
            attributes: update,
            max_length: ATTRIBUTES_MAX_LENGTH,
        },
    )
    .await
    .unwrap();

    let configured = repo.get_device(&ctx, "d1").await.unwrap().unwrap().configured;
    assert_eq!(configured.len(), ATTRIBUTES_MAX_LENGTH);
    assert!(configured.ensure_unique_keys().is_ok());
    assert_eq!(configured.get("k5"), Some("new"));
    assert_eq!(configured.get("extra"), Some("1"));
    // 99 old entries + 2 new = 101, so the oldest survivor is dropped
    assert_eq!(configured.get("k0"), None);
    assert_eq!(configured.get("k1"), Some("old"));
    assert_eq!(configured.keys().last().map(String::as_str), Some("extra"));
}

/// Both merge statements, in order
async fn merge(repo: &PostgresDeviceRepository, ctx: &TenantContext, device_id: &str, update: AttributeSet) {
    repo.pull_configuration_keys(ctx, device_id, update.keys())
        .await
        .unwrap();
    repo.push_configuration(
        ctx,
        PushAttributesRepoInput {
            device_id: device_id.to_string(),
            attributes: update,
            max_length: ATTRIBUTES_MAX_LENGTH,
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_concurrent_merges_with_disjoint_keys_commute() {
    let (_container, repo, client) = setup_test_db().await;
    let ctx = TenantContext::for_tenant("t1");
    migrate(&client, &ctx).await;

    repo.upsert_configuration(
        &ctx,
        ReplaceAttributesRepoInput {
            device_id: "d1".to_string(),
            attributes: attrs(&[("base", "0")]),
        },
    )
    .await
    .unwrap();

    for round in 0..10 {
        let value = round.to_string();
        tokio::join!(
            merge(&repo, &ctx, "d1", attrs(&[("a", value.as_str())])),
            merge(&repo, &ctx, "d1", attrs(&[("b", value.as_str())])),
        );

        let configured = repo.get_device(&ctx, "d1").await.unwrap().unwrap().configured;
        assert_eq!(configured.len(), 3);
        assert_eq!(configured.get("base"), Some("0"));
        assert_eq!(configured.get("a"), Some(value.as_str()));
        assert_eq!(configured.get("b"), Some(value.as_str()));
    }
}

#[tokio::test]
async fn test_repeating_merge_after_lost_push_completes_it() {
    let (_container, repo, client) = setup_test_db().await;
    let ctx = TenantContext::new();
    migrate(&client, &ctx).await;

    repo.upsert_configuration(
        &ctx,
        ReplaceAttributesRepoInput {
            device_id: "d1".to_string(),
            attributes: attrs(&[("a", "1"), ("b", "2")]),
        },
    )
    .await
    .unwrap();

    let update = attrs(&[("b", "3"), ("c", "4")]);
    repo.pull_configuration_keys(&ctx, "d1", update.keys())
        .await
        .unwrap();
    merge(&repo, &ctx, "d1", update).await;

    let configured = repo.get_device(&ctx, "d1").await.unwrap().unwrap().configured;
    assert_eq!(configured, attrs(&[("a", "1"), ("b", "3"), ("c", "4")]));
}

#[tokio::test]
async fn test_merge_steps_fail_for_missing_device() {
    let (_container, repo, client) = setup_test_db().await;
    let ctx = TenantContext::new();
    migrate(&client, &ctx).await;

    let pulled = repo
        .pull_configuration_keys(&ctx, "ghost", vec!["a".to_string()])
        .await;
    assert!(matches!(pulled, Err(DomainError::DeviceNotFound(_))));
    assert!(repo.get_device(&ctx, "ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn test_set_deployment_id() {
    let (_container, repo, client) = setup_test_db().await;
    let ctx = TenantContext::new();
    migrate(&client, &ctx).await;

    let missing = repo.set_deployment_id(&ctx, "ghost", Uuid::new_v4()).await;
    assert!(matches!(missing, Err(DomainError::DeviceNotFound(_))));

    repo.insert_device(&ctx, Device::new("d1")).await.unwrap();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    repo.set_deployment_id(&ctx, "d1", first).await.unwrap();
    repo.set_deployment_id(&ctx, "d1", second).await.unwrap();

    let device = repo.get_device(&ctx, "d1").await.unwrap().unwrap();
    assert_eq!(device.deployment_id, Some(second));
}

#[tokio::test]
async fn test_delete_tenant_removes_only_that_tenant() {
    let (_container, repo, client) = setup_test_db().await;
    let ctx = TenantContext::for_tenant("t1");
    migrate(&client, &ctx).await;

    repo.insert_device(&ctx, Device::new("d1")).await.unwrap();
    repo.insert_device(&ctx, Device::new("d2")).await.unwrap();

    // A stray row under another tenant id in the same partition survives
    let conn = client.get_connection().await.unwrap();
    conn.execute(
        "INSERT INTO \"deviceconfig-t1\".devices (tenant_id, id) VALUES ('other', 'd3')",
        &[],
    )
    .await
    .unwrap();

    let removed = repo.delete_tenant(&ctx, "t1").await.unwrap();
    assert_eq!(removed, 2);

    let left: i64 = conn
        .query_one("SELECT count(*) FROM \"deviceconfig-t1\".devices", &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(left, 1);
}
