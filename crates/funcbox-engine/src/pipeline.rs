// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build Pipeline
//!
//! Turns an uploaded archive into a tagged image and, only after a clean
//! build exit, makes it the function's active deployment.
//!
//! ```text
//! upload archive ─► building row (v = max+1) ─► extract ─► build ─┬─► activate
//!                                                                  └─► failed
//! ```
//!
//! Each version gets its own working directory,
//! `<data_dir>/functions/<function-identity>/v<version>`, which doubles as
//! the build context and receives the `build.log`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::archive::extract_zip;
use crate::artifact_store::ArtifactStore;
use crate::deployments::{
    Deployment, DeploymentRepository, Function, FunctionSettings, FunctionStatus, function_identity,
};
use crate::error::{Error, Result};
use crate::locks::FunctionLocks;
use crate::runner::{BuildSpec, ContainerRuntime};

/// Dockerfile written into build contexts that do not ship their own.
///
/// Expects the generated entry point at `bin/server.dart`.
pub const DEFAULT_DOCKERFILE: &str = r#"FROM dart:stable AS build
WORKDIR /app
COPY pubspec.* ./
RUN dart pub get
COPY . .
RUN dart pub get --offline
RUN dart compile exe bin/server.dart -o bin/server

FROM scratch
COPY --from=build /runtime/ /
COPY --from=build /app/bin/server /app/bin/server
ENTRYPOINT ["/app/bin/server"]
"#;

/// Name of the build log written next to the sources.
pub const BUILD_LOG_FILE: &str = "build.log";

/// Longest build output tail kept in a failed deployment's error.
const MAX_ERROR_LINES: usize = 40;

/// Working directory of a function on this host.
pub fn function_dir(data_dir: &Path, function_id: &str) -> PathBuf {
    data_dir
        .join("functions")
        .join(function_identity(function_id))
}

/// Working directory of one version of a function.
pub fn version_dir(data_dir: &Path, function_id: &str, version: i64) -> PathBuf {
    function_dir(data_dir, function_id).join(format!("v{}", version))
}

/// A deploy that did not activate.
#[derive(Debug, Error)]
#[error("{source}")]
pub struct DeployError {
    /// Version consumed by the failed deploy; `None` when it failed before allocation
    pub version: Option<i64>,
    /// Underlying error
    #[source]
    pub source: Error,
}

impl DeployError {
    fn before_allocation(source: Error) -> Self {
        Self {
            version: None,
            source,
        }
    }
}

/// Builds images and drives the deployment state machine.
pub struct BuildPipeline {
    repo: DeploymentRepository,
    artifacts: Arc<dyn ArtifactStore>,
    runtime: Arc<dyn ContainerRuntime>,
    locks: FunctionLocks,
    data_dir: PathBuf,
    build_timeout: Duration,
    dockerfile_template: String,
}

impl BuildPipeline {
    /// Create a pipeline with the default Dockerfile template.
    pub fn new(
        repo: DeploymentRepository,
        artifacts: Arc<dyn ArtifactStore>,
        runtime: Arc<dyn ContainerRuntime>,
        locks: FunctionLocks,
        data_dir: impl Into<PathBuf>,
        build_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            artifacts,
            runtime,
            locks,
            data_dir: data_dir.into(),
            build_timeout,
            dockerfile_template: DEFAULT_DOCKERFILE.to_string(),
        }
    }

    /// Replace the Dockerfile written into contexts that lack one.
    pub fn with_dockerfile_template(mut self, template: impl Into<String>) -> Self {
        self.dockerfile_template = template.into();
        self
    }

    /// Deployment repository
    pub fn repo(&self) -> &DeploymentRepository {
        &self.repo
    }

    /// Artifact store
    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Container runtime
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Per-function locks shared with rollback
    pub fn locks(&self) -> &FunctionLocks {
        &self.locks
    }

    /// Data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Deploy a new version of an existing function from a ZIP archive.
    ///
    /// Returns the activated deployment. `settings`, when given, become the
    /// function's execution settings in the same transaction that activates
    /// the version. On failure the new version, if one was allocated, is
    /// consumed and recorded as `failed`, the previously active deployment
    /// keeps serving with its settings, and [`DeployError::version`] names
    /// the consumed version.
    pub async fn deploy_new_version(
        &self,
        function_id: &str,
        archive: Vec<u8>,
        settings: Option<FunctionSettings>,
    ) -> std::result::Result<Deployment, DeployError> {
        let _guard = self.locks.acquire(function_id).await;

        let function = self
            .repo
            .get_function(function_id)
            .await
            .map_err(DeployError::before_allocation)?
            .ok_or_else(|| {
                DeployError::before_allocation(Error::FunctionNotFound(function_id.to_string()))
            })?;

        let artifact_key = self
            .artifacts
            .upload(&archive)
            .await
            .map_err(DeployError::before_allocation)?;
        let deployment = self
            .repo
            .create_building_deployment(function_id, &artifact_key)
            .await
            .map_err(DeployError::before_allocation)?;

        info!(
            function_id = %function_id,
            version = deployment.version,
            artifact_key = %artifact_key,
            "Deploying new version"
        );

        let started = Instant::now();
        let built = match self.materialize(&deployment, archive).await {
            Ok(context_dir) => self.build_image(&deployment, &context_dir).await,
            Err(e) => Err(e),
        };
        let build_duration_ms = started.elapsed().as_millis() as i64;

        // Every allocated version ends up active or failed.
        let outcome = match built {
            Ok(()) => {
                self.repo
                    .activate_build(
                        function_id,
                        &deployment.deployment_id,
                        build_duration_ms,
                        settings.as_ref(),
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(active) => Ok(active),
            Err(e) => {
                error!(
                    function_id = %function_id,
                    version = deployment.version,
                    error = %e,
                    "Deployment failed"
                );
                self.record_failure(&function, &deployment, &e, build_duration_ms)
                    .await;
                Err(DeployError {
                    version: Some(deployment.version),
                    source: e,
                })
            }
        }
    }

    /// Mark a deployment failed and, if nothing serves, the function too.
    ///
    /// Errors are logged: the deploy is already failing with the original one.
    async fn record_failure(
        &self,
        function: &Function,
        deployment: &Deployment,
        cause: &Error,
        build_duration_ms: i64,
    ) {
        if let Err(e) = self
            .repo
            .mark_failed(
                &deployment.deployment_id,
                &cause.to_string(),
                Some(build_duration_ms),
            )
            .await
        {
            error!(
                deployment_id = %deployment.deployment_id,
                error = %e,
                "Failed to mark deployment failed"
            );
        }
        if function.active_deployment_id.is_none() {
            if let Err(e) = self
                .repo
                .set_function_status(&function.function_id, FunctionStatus::Failed)
                .await
            {
                error!(function_id = %function.function_id, error = %e, "Failed to update function status");
            }
        }
    }

    /// Extract a deployment's archive into its version directory and make
    /// sure it has a Dockerfile. Safe to repeat.
    pub(crate) async fn materialize(&self, deployment: &Deployment, archive: Vec<u8>) -> Result<PathBuf> {
        let dir = version_dir(&self.data_dir, &deployment.function_id, deployment.version);
        extract_zip(archive, &dir).await?;

        let dockerfile = dir.join("Dockerfile");
        if !tokio::fs::try_exists(&dockerfile).await? {
            tokio::fs::write(&dockerfile, &self.dockerfile_template).await?;
        }
        Ok(dir)
    }

    /// Build the deployment's image from `context_dir` under the build timeout.
    ///
    /// Writes `build.log` into the context whatever the outcome. A timed-out
    /// build is abandoned, which kills the build process.
    pub(crate) async fn build_image(&self, deployment: &Deployment, context_dir: &Path) -> Result<()> {
        let spec = BuildSpec {
            context_dir: context_dir.to_path_buf(),
            tag: deployment.image_tag.clone(),
            dockerfile: "Dockerfile".to_string(),
        };

        let output = match tokio::time::timeout(self.build_timeout, self.runtime.build(&spec)).await {
            Ok(result) => result?,
            Err(_) => {
                let message = format!(
                    "build timed out after {}s",
                    self.build_timeout.as_secs_f64()
                );
                self.write_build_log(context_dir, &message).await;
                warn!(
                    function_id = %deployment.function_id,
                    version = deployment.version,
                    timeout_secs = self.build_timeout.as_secs_f64(),
                    "Image build timed out"
                );
                return Err(Error::Build(message));
            }
        };

        self.write_build_log(context_dir, &output.logs).await;
        for line in output.logs.lines() {
            tracing::debug!(tag = %deployment.image_tag, "{}", line);
        }

        if !output.success() {
            return Err(Error::Build(format!(
                "exit code {}: {}",
                output.exit_code,
                tail(&output.logs, MAX_ERROR_LINES)
            )));
        }

        info!(
            function_id = %deployment.function_id,
            version = deployment.version,
            tag = %deployment.image_tag,
            "Image built"
        );
        Ok(())
    }

    async fn write_build_log(&self, context_dir: &Path, logs: &str) {
        let path = context_dir.join(BUILD_LOG_FILE);
        if let Err(e) = tokio::fs::write(&path, logs).await {
            warn!(path = %path.display(), error = %e, "Failed to write build log");
        }
    }
}

/// Last `max_lines` lines of `text`, trimmed.
fn tail(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
