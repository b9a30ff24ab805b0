// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rollback Controller
//!
//! Re-materializes a previously built version and makes it active again.
//! The target's artifact is fetched and extracted even when its working
//! directory survives, so a host that lost its local state rolls back the
//! same way as one that kept it. The image is rebuilt only when the runtime
//! no longer has it. Nothing changes the active deployment before the final
//! `activate` transaction.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::deployments::Deployment;
use crate::error::Error;
use crate::pipeline::{BuildPipeline, function_dir};

/// Progress of a rollback, reported with failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackStage {
    /// Looking up the target and downloading its archive
    FetchingArtifact,
    /// Extracting the archive into the version directory
    Extracting,
    /// Rebuilding the image
    RebuildingImage,
    /// Flipping the active pointer
    Activating,
    /// Finished
    Done,
}

impl std::fmt::Display for RollbackStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RollbackStage::FetchingArtifact => "fetching-artifact",
            RollbackStage::Extracting => "extracting",
            RollbackStage::RebuildingImage => "rebuilding-image",
            RollbackStage::Activating => "activating",
            RollbackStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// A rollback that stopped at `stage`. The active deployment is unchanged.
#[derive(Debug, Error)]
#[error("Rollback failed while {stage}: {source}")]
pub struct RollbackError {
    /// Stage that failed
    pub stage: RollbackStage,
    /// Underlying error
    #[source]
    pub source: Error,
}

impl RollbackError {
    fn at(stage: RollbackStage) -> impl FnOnce(Error) -> Self {
        move |source| Self { stage, source }
    }

    /// Error code of the underlying failure.
    pub fn error_code(&self) -> &'static str {
        self.source.error_code()
    }
}

/// Rolls functions back to earlier versions.
pub struct RollbackController {
    pipeline: Arc<BuildPipeline>,
}

impl RollbackController {
    /// Create a controller sharing the pipeline's stores, runtime and locks.
    pub fn new(pipeline: Arc<BuildPipeline>) -> Self {
        Self { pipeline }
    }

    /// Make `target_version` the function's active deployment.
    pub async fn rollback(
        &self,
        function_id: &str,
        target_version: i64,
    ) -> std::result::Result<Deployment, RollbackError> {
        let _guard = self.pipeline.locks().acquire(function_id).await;
        let repo = self.pipeline.repo();

        // Stage: fetching-artifact
        let stage = RollbackStage::FetchingArtifact;
        let target = repo
            .get_by_version(function_id, target_version)
            .await
            .map_err(RollbackError::at(stage))?
            .ok_or_else(|| RollbackError {
                stage,
                source: Error::VersionNotFound {
                    function_id: function_id.to_string(),
                    version: target_version,
                },
            })?;
        if !target.status.was_built() {
            return Err(RollbackError {
                stage,
                source: Error::InvalidState(format!(
                    "version {} of function {} is {} and cannot be activated",
                    target_version, function_id, target.status
                )),
            });
        }
        if target.is_active {
            info!(function_id = %function_id, version = target_version, "Rollback target already active");
            return Ok(target);
        }

        info!(
            function_id = %function_id,
            version = target_version,
            artifact_key = %target.artifact_key,
            "Rolling back"
        );

        let staging = tempfile::Builder::new()
            .prefix("rollback-")
            .tempdir_in(self.staging_root(function_id).await.map_err(RollbackError::at(stage))?)
            .map_err(|e| RollbackError::at(stage)(e.into()))?;
        let archive_path = staging.path().join("archive.zip");
        self.pipeline
            .artifacts()
            .download(&target.artifact_key, &archive_path)
            .await
            .map_err(RollbackError::at(stage))?;

        // Stage: extracting
        let stage = RollbackStage::Extracting;
        let archive = tokio::fs::read(&archive_path)
            .await
            .map_err(|e| RollbackError::at(stage)(e.into()))?;
        let context_dir = self
            .pipeline
            .materialize(&target, archive)
            .await
            .map_err(RollbackError::at(stage))?;

        // Stage: rebuilding-image
        let stage = RollbackStage::RebuildingImage;
        if self.pipeline.runtime().image_exists(&target.image_tag).await {
            info!(tag = %target.image_tag, "Image present, skipping rebuild");
        } else {
            self.pipeline
                .build_image(&target, &context_dir)
                .await
                .map_err(RollbackError::at(stage))?;
        }

        // Stage: activating
        let stage = RollbackStage::Activating;
        let active = repo
            .activate(function_id, &target.deployment_id)
            .await
            .map_err(RollbackError::at(stage))?;

        info!(
            function_id = %function_id,
            version = active.version,
            stage = %RollbackStage::Done,
            "Rollback complete"
        );
        Ok(active)
    }

    async fn staging_root(&self, function_id: &str) -> crate::error::Result<std::path::PathBuf> {
        let root = function_dir(self.pipeline.data_dir(), function_id);
        tokio::fs::create_dir_all(&root).await?;
        Ok(root)
    }
}

/// Log a failed rollback with its stage.
pub(crate) fn log_failure(function_id: &str, version: i64, err: &RollbackError) {
    warn!(
        function_id = %function_id,
        version,
        stage = %err.stage,
        error = %err.source,
        "Rollback failed"
    );
}
