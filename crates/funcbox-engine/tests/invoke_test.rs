// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invocation tests: validation, admission, timeouts and output decoding.

mod common;

use std::time::{Duration, Instant};

use common::{TestContext, function_archive};
use funcbox_engine::Error;
use funcbox_engine::admission::AdmissionControl;
use funcbox_engine::deployments::{DeploymentRepository, FunctionSettings};
use funcbox_engine::executor::{ExecutionEngine, ExecutionRequest, INVOCATIONS_DIR};
use funcbox_engine::handlers::handle_invoke;
use funcbox_engine::runner::MockRunBehavior;
use serde_json::json;

fn invocation_dir_count(ctx: &TestContext) -> usize {
    std::fs::read_dir(ctx.data_dir.join(INVOCATIONS_DIR))
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_invoke_passes_normalized_envelope() {
    let ctx = TestContext::new().await;
    assert!(ctx.deploy("greeter", function_archive(1)).await.success);

    let response = handle_invoke(
        &ctx.state,
        "greeter",
        ExecutionRequest::with_body(json!({"name": "Ada"})),
    )
    .await
    .unwrap();

    assert!(response.success, "invoke failed: {:?}", response.error);
    let result = response.result.unwrap();
    assert_eq!(result["image"], "greeter-v1");
    assert_eq!(
        result["request"],
        json!({
            "method": "POST",
            "path": "/",
            "headers": {},
            "query": {},
            "body": {"name": "Ada"}
        })
    );
    assert_eq!(invocation_dir_count(&ctx), 0);

    let run = ctx.runtime.last_run().unwrap();
    assert_eq!(run.mounts.len(), 1);
    assert!(run.mounts[0].read_only);
    assert!(!run.env.contains_key("DATABASE_URL"));
}

#[tokio::test]
async fn test_invalid_request_never_reaches_runtime() {
    let ctx = TestContext::new().await;
    assert!(ctx.deploy("greeter", function_archive(1)).await.success);

    let response = handle_invoke(&ctx.state, "greeter", ExecutionRequest::default())
        .await
        .unwrap();

    assert!(!response.success);
    assert_eq!(response.error_code, Some("VALIDATION_ERROR"));
    assert_eq!(ctx.runtime.run_calls(), 0);
    assert_eq!(ctx.state.executor.admission().in_flight(), 0);
}

#[tokio::test]
async fn test_unknown_function_is_not_found() {
    let ctx = TestContext::new().await;

    let response = handle_invoke(
        &ctx.state,
        "ghost",
        ExecutionRequest::with_body(json!({})),
    )
    .await
    .unwrap();

    assert_eq!(response.error_code, Some("NOT_FOUND"));
    assert_eq!(ctx.runtime.run_calls(), 0);
}

#[tokio::test]
async fn test_missing_function_directory_is_reported() {
    let ctx = TestContext::new().await;
    assert!(ctx.deploy("greeter", function_archive(1)).await.success);
    std::fs::remove_dir_all(ctx.data_dir.join("functions")).unwrap();

    let err = ctx
        .state
        .executor
        .invoke("greeter", ExecutionRequest::with_body(json!({})))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::FunctionDirMissing(_)));
    assert_eq!(ctx.runtime.run_calls(), 0);
}

#[tokio::test]
async fn test_function_without_active_deployment() {
    let ctx = TestContext::new().await;
    ctx.runtime.fail_next_builds(1);
    assert!(!ctx.deploy("greeter", function_archive(1)).await.success);

    let err = ctx
        .state
        .executor
        .invoke("greeter", ExecutionRequest::with_body(json!({})))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoActiveDeployment(_)));
    assert_eq!(ctx.runtime.run_calls(), 0);
}

#[tokio::test]
async fn test_excess_invocations_rejected_at_capacity() {
    let ctx = TestContext::with_config(|c| c.max_concurrent_executions = 2).await;
    assert!(ctx.deploy("greeter", function_archive(1)).await.success);
    ctx.runtime
        .set_run_behavior(MockRunBehavior::Delay(Duration::from_millis(500)));

    let slow = |n: i64| {
        ctx.state
            .executor
            .invoke("greeter", ExecutionRequest::with_body(json!({"n": n})))
    };
    let third_call = async {
        while ctx.state.executor.admission().in_flight() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let started = Instant::now();
        let result = ctx
            .state
            .executor
            .invoke("greeter", ExecutionRequest::with_body(json!({"n": 3})))
            .await;
        (result, started.elapsed())
    };

    let (first, second, (third, rejected_after)) = tokio::join!(slow(1), slow(2), third_call);

    assert!(first.unwrap().success);
    assert!(second.unwrap().success);
    assert!(matches!(third, Err(Error::Capacity { limit: 2 })));
    assert!(rejected_after < Duration::from_millis(400));
    assert_eq!(ctx.runtime.run_calls(), 2);
    assert_eq!(ctx.state.executor.admission().in_flight(), 0);
}

#[tokio::test]
async fn test_hanging_function_times_out_and_releases_slot() {
    let ctx = TestContext::new().await;
    let settings = FunctionSettings {
        timeout: Duration::from_millis(200),
        ..FunctionSettings::default()
    };
    assert!(
        ctx.deploy_with("sleeper", function_archive(1), Some(settings))
            .await
            .success
    );
    ctx.runtime.set_run_behavior(MockRunBehavior::Hang);

    let started = Instant::now();
    let response = handle_invoke(
        &ctx.state,
        "sleeper",
        ExecutionRequest::with_body(json!({})),
    )
    .await
    .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!response.success);
    assert_eq!(response.error_code, Some("TIMEOUT"));
    assert!(response.error.unwrap().contains("timed out"));
    assert_eq!(ctx.runtime.kill_calls(), 1);
    assert_eq!(ctx.state.executor.admission().in_flight(), 0);
    assert_eq!(invocation_dir_count(&ctx), 0);
}

#[tokio::test]
async fn test_wedged_kill_does_not_hold_the_slot() {
    let ctx = TestContext::new().await;
    let settings = FunctionSettings {
        timeout: Duration::from_millis(200),
        ..FunctionSettings::default()
    };
    assert!(
        ctx.deploy_with("sleeper", function_archive(1), Some(settings))
            .await
            .success
    );
    let engine = ExecutionEngine::new(
        DeploymentRepository::new(ctx.pool.clone()),
        ctx.runtime.clone(),
        AdmissionControl::new(4),
        &ctx.data_dir,
    )
    .with_cleanup_check_delay(Duration::from_millis(50))
    .with_kill_timeout(Duration::from_millis(100));
    ctx.runtime.set_run_behavior(MockRunBehavior::Hang);
    ctx.runtime.hang_kills(true);

    let started = Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        engine.invoke("sleeper", ExecutionRequest::with_body(json!({}))),
    )
    .await
    .expect("invoke blocked on the kill")
    .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!result.success);
    assert_eq!(result.error_code, Some("TIMEOUT"));
    assert_eq!(ctx.runtime.kill_calls(), 1);
    assert_eq!(engine.admission().in_flight(), 0);
    assert_eq!(invocation_dir_count(&ctx), 0);
}

#[tokio::test]
async fn test_runtime_failure_is_an_unsuccessful_result() {
    let ctx = TestContext::new().await;
    assert!(ctx.deploy("greeter", function_archive(1)).await.success);
    ctx.runtime.set_run_behavior(MockRunBehavior::Unavailable);

    let response = handle_invoke(
        &ctx.state,
        "greeter",
        ExecutionRequest::with_body(json!({})),
    )
    .await
    .unwrap();

    assert!(!response.success);
    assert_eq!(response.error_code, Some("INTERNAL_ERROR"));
    assert!(response.error.unwrap().contains("mock runtime unavailable"));
    assert!(response.result.is_none());
    assert_eq!(ctx.runtime.run_calls(), 1);
    assert_eq!(ctx.state.executor.admission().in_flight(), 0);
    assert_eq!(invocation_dir_count(&ctx), 0);
}

#[tokio::test]
async fn test_non_zero_exit_reports_stderr() {
    let ctx = TestContext::new().await;
    assert!(ctx.deploy("greeter", function_archive(1)).await.success);
    ctx.runtime.set_run_behavior(MockRunBehavior::Fail {
        exit_code: 3,
        stderr: "Unhandled exception: boom\n".to_string(),
    });

    let result = ctx
        .state
        .executor
        .invoke("greeter", ExecutionRequest::with_body(json!({})))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.error_code, Some("RUN_ERROR"));
    assert!(result.error.unwrap().contains("exit code 3"));
    assert!(result.stderr.unwrap().contains("boom"));
    assert!(result.result.is_none());
}

#[tokio::test]
async fn test_raw_output_is_returned_as_text() {
    let ctx = TestContext::new().await;
    assert!(ctx.deploy("greeter", function_archive(1)).await.success);
    ctx.runtime
        .set_run_behavior(MockRunBehavior::Raw("hello world\n".to_string()));

    let response = handle_invoke(
        &ctx.state,
        "greeter",
        ExecutionRequest::with_body(json!({})),
    )
    .await
    .unwrap();

    assert!(response.success);
    assert_eq!(response.result, Some(json!("hello world")));
    assert_eq!(response.status_code, None);
}

#[tokio::test]
async fn test_status_code_lifted_from_output() {
    let ctx = TestContext::new().await;
    assert!(ctx.deploy("greeter", function_archive(1)).await.success);
    ctx.runtime.set_run_behavior(MockRunBehavior::Raw(
        r#"{"statusCode": 201, "body": "created"}"#.to_string(),
    ));

    let response = handle_invoke(
        &ctx.state,
        "greeter",
        ExecutionRequest::with_body(json!({})),
    )
    .await
    .unwrap();

    assert_eq!(response.status_code, Some(201));
    assert_eq!(response.result.unwrap()["body"], "created");
}

#[tokio::test]
async fn test_database_url_injected_only_when_required() {
    let ctx = TestContext::with_config(|c| {
        c.function_database_url = Some("postgres://functions@db/fn".to_string())
    })
    .await;
    let needs_db = FunctionSettings {
        requires_database: true,
        ..FunctionSettings::default()
    };
    assert!(
        ctx.deploy_with("reports", function_archive(1), Some(needs_db))
            .await
            .success
    );
    assert!(ctx.deploy("greeter", function_archive(1)).await.success);

    let reports = ctx
        .state
        .executor
        .invoke("reports", ExecutionRequest::with_body(json!({})))
        .await
        .unwrap();
    assert_eq!(
        reports.result.unwrap()["database_url"],
        "postgres://functions@db/fn"
    );

    let greeter = ctx
        .state
        .executor
        .invoke("greeter", ExecutionRequest::with_body(json!({})))
        .await
        .unwrap();
    assert!(greeter.result.unwrap()["database_url"].is_null());
}

#[tokio::test]
async fn test_invocation_uses_latest_active_version() {
    let ctx = TestContext::new().await;
    assert!(ctx.deploy("greeter", function_archive(1)).await.success);
    ctx.runtime.fail_next_builds(1);
    assert!(!ctx.deploy("greeter", function_archive(2)).await.success);

    let result = ctx
        .state
        .executor
        .invoke("greeter", ExecutionRequest::with_body(json!({})))
        .await
        .unwrap();
    assert_eq!(result.result.unwrap()["image"], "greeter-v1");

    assert!(ctx.deploy("greeter", function_archive(3)).await.success);
    let result = ctx
        .state
        .executor
        .invoke("greeter", ExecutionRequest::with_body(json!({})))
        .await
        .unwrap();
    assert_eq!(result.result.unwrap()["image"], "greeter-v3");
}
