// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deploy flow tests: version allocation, activation and build failures.

mod common;

use std::time::Duration;

use common::{TestContext, function_archive};
use funcbox_engine::deployments::{DeploymentStatus, FunctionSettings, FunctionStatus};
use funcbox_engine::executor::ExecutionRequest;
use funcbox_engine::handlers::handle_list_deployments;
use funcbox_engine::pipeline::{BUILD_LOG_FILE, version_dir};
use serde_json::json;

#[tokio::test]
async fn test_sequential_deploys_allocate_versions_with_gaps_at_failures() {
    let ctx = TestContext::new().await;

    for revision in 1..=5u32 {
        if revision == 2 || revision == 4 {
            ctx.runtime.fail_next_builds(1);
        }
        let response = ctx.deploy("orders", function_archive(revision)).await;
        assert_eq!(response.version, Some(i64::from(revision)));
        assert_eq!(response.success, revision != 2 && revision != 4);
    }

    let listing = handle_list_deployments(&ctx.state, "orders").await.unwrap();
    let versions: Vec<i64> = listing.iter().map(|d| d.version).collect();
    assert_eq!(versions, vec![5, 4, 3, 2, 1]);

    let failed: Vec<i64> = listing
        .iter()
        .filter(|d| d.status == DeploymentStatus::Failed)
        .map(|d| d.version)
        .collect();
    assert_eq!(failed, vec![4, 2]);

    let active: Vec<i64> = listing
        .iter()
        .filter(|d| d.is_active)
        .map(|d| d.version)
        .collect();
    assert_eq!(active, vec![5]);
}

#[tokio::test]
async fn test_exactly_one_active_after_successful_deploys() {
    let ctx = TestContext::new().await;

    for revision in 1..=3 {
        let response = ctx.deploy("orders", function_archive(revision)).await;
        assert!(response.success, "deploy failed: {:?}", response.error);
        assert_eq!(response.status, Some(DeploymentStatus::Active));

        let deployments = ctx.state.repo.list_versions("orders").await.unwrap();
        assert_eq!(deployments.iter().filter(|d| d.is_active).count(), 1);
        assert!(
            deployments
                .iter()
                .filter(|d| !d.is_active)
                .all(|d| d.status == DeploymentStatus::Inactive)
        );
    }

    let function = ctx.state.repo.get_function("orders").await.unwrap().unwrap();
    let active = ctx.state.repo.get_active("orders").await.unwrap().unwrap();
    assert_eq!(function.active_deployment_id, Some(active.deployment_id));
    assert_eq!(active.version, 3);
}

#[tokio::test]
async fn test_failed_build_keeps_previous_active_and_consumes_version() {
    let ctx = TestContext::new().await;

    assert!(ctx.deploy("orders", function_archive(1)).await.success);

    ctx.runtime.fail_next_builds(1);
    let failed = ctx.deploy("orders", function_archive(2)).await;
    assert!(!failed.success);
    assert_eq!(failed.version, Some(2));
    assert_eq!(failed.status, Some(DeploymentStatus::Failed));
    assert_eq!(failed.error_code, Some("BUILD_ERROR"));
    assert!(failed.error.unwrap().contains("mock build failure"));

    let active = ctx.state.repo.get_active("orders").await.unwrap().unwrap();
    assert_eq!(active.version, 1);
    let function = ctx.state.repo.get_function("orders").await.unwrap().unwrap();
    assert_eq!(function.status, FunctionStatus::Active);

    let v2 = ctx
        .state
        .repo
        .get_by_version("orders", 2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(v2.status, DeploymentStatus::Failed);
    assert!(!v2.is_active);

    let next = ctx.deploy("orders", function_archive(3)).await;
    assert!(next.success);
    assert_eq!(next.version, Some(3));
}

#[tokio::test]
async fn test_first_failed_deploy_marks_function_failed() {
    let ctx = TestContext::new().await;
    ctx.runtime.fail_next_builds(1);

    let response = ctx.deploy("orders", function_archive(1)).await;

    assert!(!response.success);
    let function = ctx.state.repo.get_function("orders").await.unwrap().unwrap();
    assert_eq!(function.status, FunctionStatus::Failed);
    assert!(function.active_deployment_id.is_none());
}

#[tokio::test]
async fn test_build_log_written_per_build() {
    let ctx = TestContext::new().await;

    ctx.deploy("orders", function_archive(1)).await;
    ctx.runtime.fail_next_builds(1);
    ctx.deploy("orders", function_archive(2)).await;

    let ok_log = std::fs::read_to_string(
        version_dir(&ctx.data_dir, "orders", 1).join(BUILD_LOG_FILE),
    )
    .unwrap();
    assert!(ok_log.contains("COMMIT orders-v1"));

    let failed_log = std::fs::read_to_string(
        version_dir(&ctx.data_dir, "orders", 2).join(BUILD_LOG_FILE),
    )
    .unwrap();
    assert!(failed_log.contains("mock build failure"));
}

#[tokio::test]
async fn test_invalid_deploy_requests_do_not_touch_state() {
    let ctx = TestContext::new().await;

    let response = ctx.deploy("orders", Vec::new()).await;
    assert!(!response.success);
    assert_eq!(response.error_code, Some("VALIDATION_ERROR"));
    assert!(ctx.state.repo.get_function("orders").await.unwrap().is_none());

    let response = ctx.deploy("", function_archive(1)).await;
    assert_eq!(response.error_code, Some("VALIDATION_ERROR"));
    assert_eq!(ctx.runtime.build_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_deploys_of_one_function_get_distinct_versions() {
    let ctx = TestContext::new().await;

    let (a, b, c) = tokio::join!(
        ctx.deploy("orders", function_archive(1)),
        ctx.deploy("orders", function_archive(2)),
        ctx.deploy("orders", function_archive(3)),
    );

    let mut versions = vec![
        a.version.unwrap(),
        b.version.unwrap(),
        c.version.unwrap(),
    ];
    versions.sort();
    assert_eq!(versions, vec![1, 2, 3]);

    let active = ctx.state.repo.get_active("orders").await.unwrap().unwrap();
    assert_eq!(active.version, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deploys_of_distinct_functions_on_file_store() {
    let ctx = TestContext::with_file_store().await;
    let ids: Vec<String> = (0..40).map(|i| format!("fn-{}", i)).collect();

    let responses = futures::future::join_all(
        ids.iter()
            .map(|id| ctx.deploy(id, function_archive(1))),
    )
    .await;

    for (id, response) in ids.iter().zip(&responses) {
        assert!(response.success, "{} failed: {:?}", id, response.error);
        assert_eq!(response.version, Some(1));
    }
    for id in &ids {
        let deployments = ctx.state.repo.list_versions(id).await.unwrap();
        assert_eq!(deployments.len(), 1);
        assert_eq!(deployments[0].status, DeploymentStatus::Active);
    }
}

#[tokio::test]
async fn test_failed_deploy_leaves_active_settings_unchanged() {
    let ctx = TestContext::with_config(|c| {
        c.function_database_url = Some("postgres://functions@db/fn".to_string())
    })
    .await;
    assert!(ctx.deploy("orders", function_archive(1)).await.success);
    let before = ctx.state.repo.get_function("orders").await.unwrap().unwrap();

    let with_database = FunctionSettings {
        timeout: Duration::from_secs(30),
        requires_database: true,
        ..FunctionSettings::default()
    };
    ctx.runtime.fail_next_builds(1);
    let failed = ctx
        .deploy_with("orders", function_archive(2), Some(with_database))
        .await;
    assert!(!failed.success);

    let after = ctx.state.repo.get_function("orders").await.unwrap().unwrap();
    assert_eq!(after.settings, before.settings);
    let result = ctx
        .state
        .executor
        .invoke("orders", ExecutionRequest::with_body(json!({})))
        .await
        .unwrap();
    assert!(result.result.unwrap()["database_url"].is_null());

    assert!(
        ctx.deploy_with("orders", function_archive(3), Some(with_database))
            .await
            .success
    );
    let result = ctx
        .state
        .executor
        .invoke("orders", ExecutionRequest::with_body(json!({})))
        .await
        .unwrap();
    assert_eq!(
        result.result.unwrap()["database_url"],
        "postgres://functions@db/fn"
    );
}

#[tokio::test]
async fn test_failure_before_version_allocation_reports_no_version() {
    let ctx = TestContext::new().await;
    ctx.runtime.fail_next_builds(1);
    assert!(!ctx.deploy("orders", function_archive(1)).await.success);

    // The artifact store cannot create its directory.
    std::fs::remove_dir_all(ctx.data_dir.join("artifacts")).unwrap();
    std::fs::write(ctx.data_dir.join("artifacts"), b"not a directory").unwrap();

    let response = ctx.deploy("orders", function_archive(2)).await;

    assert!(!response.success);
    assert_eq!(response.error_code, Some("STORAGE_ERROR"));
    assert_eq!(response.version, None);
    assert_eq!(response.status, None);
    let versions = ctx.state.repo.list_versions("orders").await.unwrap();
    assert_eq!(versions.len(), 1);
}
