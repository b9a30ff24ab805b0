// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine operation handlers.
//!
//! The surface an outer layer (HTTP API, CLI, queue consumer) calls into.
//! Handlers turn engine errors into response structs carrying a stable
//! error code; only infrastructure failures surface as `Err`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::admission::AdmissionControl;
use crate::artifact_store::ArtifactStore;
use crate::config::{Config, ExecutionDefaults};
use crate::deployments::{DeploymentRepository, DeploymentStatus, FunctionSettings};
use crate::error::{Error, Result};
use crate::executor::{ExecutionEngine, ExecutionRequest};
use crate::locks::FunctionLocks;
use crate::pipeline::{BuildPipeline, DeployError, function_dir};
use crate::rollback::{self, RollbackController, RollbackStage};
use crate::runner::ContainerRuntime;

/// Convert a path to absolute if it's relative.
///
/// Working directories are bind-mounted into containers, and the runtime
/// resolves mount sources against its own working directory, not ours.
fn ensure_absolute_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }
}

/// Shared state for engine handlers.
pub struct EngineState {
    /// Deployment store
    pub repo: DeploymentRepository,
    /// Build pipeline (owns the runtime, artifact store and per-function locks)
    pub pipeline: Arc<BuildPipeline>,
    /// Execution engine
    pub executor: Arc<ExecutionEngine>,
    /// Rollback controller
    pub rollback: RollbackController,
    /// Settings applied to functions deployed without explicit ones
    pub defaults: ExecutionDefaults,
    /// When the engine started (for uptime calculation)
    pub start_time: std::time::Instant,
    /// Engine version string
    pub version: String,
}

impl EngineState {
    /// Wire the engine components together from configuration.
    pub fn new(
        config: &Config,
        pool: SqlitePool,
        runtime: Arc<dyn ContainerRuntime>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let data_dir = ensure_absolute_path(config.data_dir.clone());
        let repo = DeploymentRepository::new(pool);

        let pipeline = Arc::new(BuildPipeline::new(
            repo.clone(),
            artifacts,
            runtime.clone(),
            FunctionLocks::new(),
            &data_dir,
            config.build_timeout,
        ));

        let executor = Arc::new(
            ExecutionEngine::new(
                repo.clone(),
                runtime,
                AdmissionControl::new(config.max_concurrent_executions),
                &data_dir,
            )
            .with_function_database_url(config.function_database_url.clone())
            .with_cleanup_check_delay(config.cleanup_check_delay),
        );

        Self {
            repo,
            rollback: RollbackController::new(pipeline.clone()),
            pipeline,
            executor,
            defaults: config.defaults,
            start_time: std::time::Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Get the engine uptime in milliseconds.
    pub fn uptime_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }

    fn data_dir(&self) -> &Path {
        self.pipeline.data_dir()
    }
}

// ============================================================================
// Health Check
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResponse {
    /// Whether the deployment store answers
    pub healthy: bool,
    /// Engine version
    pub version: String,
    /// Engine uptime in milliseconds
    pub uptime_ms: i64,
    /// Invocations currently running
    pub in_flight: usize,
}

/// Handle health check request.
pub async fn handle_health_check(state: &EngineState) -> Result<HealthCheckResponse> {
    let healthy = state.repo.health_check().await.is_ok();

    Ok(HealthCheckResponse {
        healthy,
        version: state.version.clone(),
        uptime_ms: state.uptime_ms(),
        in_flight: state.executor.admission().in_flight(),
    })
}

// ============================================================================
// Deploy
// ============================================================================

/// Request to deploy a new version of a function.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    /// Function to deploy (created on first deploy)
    pub function_id: String,
    /// Human-readable name
    pub name: String,
    /// Owning user
    pub owner: String,
    /// ZIP archive of the function sources
    pub archive: Vec<u8>,
    /// Execution settings; engine defaults when absent
    pub settings: Option<FunctionSettings>,
}

/// Response from a deploy.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResponse {
    /// Whether the new version is now active
    pub success: bool,
    /// Version allocated to this deploy, if one was
    pub version: Option<i64>,
    /// Status of that version
    pub status: Option<DeploymentStatus>,
    /// Error message if failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error code if failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
}

/// Handle deploy request.
pub async fn handle_deploy(state: &EngineState, request: DeployRequest) -> Result<DeployResponse> {
    info!(
        function_id = %request.function_id,
        owner = %request.owner,
        archive_size = request.archive.len(),
        "Deploy request received"
    );

    let rejected = |message: &str| DeployResponse {
        success: false,
        version: None,
        status: None,
        error: Some(message.to_string()),
        error_code: Some("VALIDATION_ERROR"),
    };
    if request.function_id.is_empty() {
        return Ok(rejected("function_id is required"));
    }
    if request.archive.is_empty() {
        return Ok(rejected("archive is required"));
    }

    // Seeds a new function only; redeploys apply their settings on activation.
    let initial_settings = request
        .settings
        .unwrap_or_else(|| FunctionSettings::from(state.defaults));
    state
        .repo
        .ensure_function(
            &request.function_id,
            &request.name,
            &request.owner,
            &initial_settings,
        )
        .await?;

    match state
        .pipeline
        .deploy_new_version(&request.function_id, request.archive, request.settings)
        .await
    {
        Ok(deployment) => Ok(DeployResponse {
            success: true,
            version: Some(deployment.version),
            status: Some(deployment.status),
            error: None,
            error_code: None,
        }),
        Err(DeployError {
            version: None,
            source: e @ (Error::Database(_) | Error::Migration(_)),
        }) => Err(e),
        Err(e) => Ok(DeployResponse {
            success: false,
            version: e.version,
            status: e.version.map(|_| DeploymentStatus::Failed),
            error: Some(e.source.to_string()),
            error_code: Some(e.source.error_code()),
        }),
    }
}

// ============================================================================
// Invoke
// ============================================================================

/// Response from an invocation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
    /// Whether the function ran and exited cleanly
    pub success: bool,
    /// Status code reported by the function
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Function output
    pub result: Option<Value>,
    /// Error message if failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error code if failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
}

/// Handle invoke request.
pub async fn handle_invoke(
    state: &EngineState,
    function_id: &str,
    request: ExecutionRequest,
) -> Result<InvokeResponse> {
    match state.executor.invoke(function_id, request).await {
        Ok(result) => Ok(InvokeResponse {
            success: result.success,
            status_code: result.status_code,
            result: result.result,
            error: result.error,
            error_code: result.error_code,
        }),
        Err(e) if e.is_client_error() => Ok(InvokeResponse {
            success: false,
            status_code: None,
            result: None,
            error: Some(e.to_string()),
            error_code: Some(e.error_code()),
        }),
        Err(e) => {
            error!(function_id = %function_id, error = %e, "Invocation failed to start");
            Err(e)
        }
    }
}

// ============================================================================
// Rollback
// ============================================================================

/// Response from a rollback.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResponse {
    /// Whether the target version is now active
    pub success: bool,
    /// Requested version
    pub version: i64,
    /// Stage that failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<RollbackStage>,
    /// Error message if failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error code if failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
}

/// Handle rollback request.
pub async fn handle_rollback(
    state: &EngineState,
    function_id: &str,
    version: i64,
) -> Result<RollbackResponse> {
    info!(function_id = %function_id, version, "Rollback request received");

    match state.rollback.rollback(function_id, version).await {
        Ok(deployment) => Ok(RollbackResponse {
            success: true,
            version: deployment.version,
            stage: None,
            error: None,
            error_code: None,
        }),
        Err(e) => {
            rollback::log_failure(function_id, version, &e);
            Ok(RollbackResponse {
                success: false,
                version,
                stage: Some(e.stage),
                error_code: Some(e.error_code()),
                error: Some(e.to_string()),
            })
        }
    }
}

// ============================================================================
// List Deployments
// ============================================================================

/// One row of a deployment listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSummary {
    /// Version number
    pub version: i64,
    /// Lifecycle status
    pub status: DeploymentStatus,
    /// Whether this version serves invocations
    pub is_active: bool,
    /// When the version was created
    pub created_at: DateTime<Utc>,
}

/// Handle list deployments request. Newest version first.
pub async fn handle_list_deployments(
    state: &EngineState,
    function_id: &str,
) -> Result<Vec<DeploymentSummary>> {
    let deployments = state.repo.list_versions(function_id).await?;
    Ok(deployments
        .into_iter()
        .map(|d| DeploymentSummary {
            version: d.version,
            status: d.status,
            is_active: d.is_active,
            created_at: d.created_at,
        })
        .collect())
}

// ============================================================================
// Delete Function
// ============================================================================

/// Response from deleting a function.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFunctionResponse {
    /// Whether the function existed and was removed
    pub success: bool,
    /// Images that were removed from the runtime
    pub images_removed: usize,
    /// Error message if failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Handle delete function request.
///
/// Removes the function's rows (deployments cascade), its images and its
/// working directories. Archives stay in the artifact store: keys are
/// content hashes and may be shared with other functions.
pub async fn handle_delete_function(
    state: &EngineState,
    function_id: &str,
) -> Result<DeleteFunctionResponse> {
    let _guard = state.pipeline.locks().acquire(function_id).await;

    let deployments = state.repo.list_versions(function_id).await?;
    if !state.repo.delete_function(function_id).await? {
        return Ok(DeleteFunctionResponse {
            success: false,
            images_removed: 0,
            error: Some(Error::FunctionNotFound(function_id.to_string()).to_string()),
        });
    }

    let runtime = state.pipeline.runtime();
    let mut images_removed = 0;
    for deployment in deployments.iter().filter(|d| d.status.was_built()) {
        match runtime.remove_image(&deployment.image_tag).await {
            Ok(()) => images_removed += 1,
            Err(e) => warn!(tag = %deployment.image_tag, error = %e, "Failed to remove image"),
        }
    }

    let dir = function_dir(state.data_dir(), function_id);
    if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %dir.display(), error = %e, "Failed to remove function directory");
        }
    }

    info!(function_id = %function_id, images_removed, "Function deleted");

    Ok(DeleteFunctionResponse {
        success: true,
        images_removed,
        error: None,
    })
}
