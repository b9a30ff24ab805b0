// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution Engine
//!
//! Runs one invocation of a function's active deployment in a sandboxed
//! container. Checks happen in a fixed order and the cheap ones never touch
//! the runtime:
//!
//! 1. request shape (body or query required)
//! 2. function working directory present on this host
//! 3. admission (global in-flight limit, no queueing)
//! 4. active deployment resolution
//!
//! The request envelope is handed to the container as a JSON file in an
//! invocation-scoped temp directory, mounted read-only. The directory and
//! the admission slot are released on every exit path by their guards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::admission::AdmissionControl;
use crate::deployments::{DeploymentRepository, function_identity};
use crate::error::{Error, Result};
use crate::pipeline::function_dir;
use crate::runner::{ContainerRuntime, Mount, NetworkMode, RunSpec};

/// Directory under the data dir holding per-invocation temp directories.
pub const INVOCATIONS_DIR: &str = "invocations";

/// Mount point of the invocation directory inside the container.
pub const INVOCATION_MOUNT: &str = "/invocation";

/// Env var telling the container where the request envelope is.
pub const REQUEST_PATH_ENV: &str = "FUNCBOX_REQUEST_PATH";

const REQUEST_FILE: &str = "request.json";

/// An invocation as received from the caller. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// HTTP method
    pub method: Option<String>,
    /// Request path
    pub path: Option<String>,
    /// Request headers
    pub headers: Option<HashMap<String, String>>,
    /// Query parameters
    pub query: Option<HashMap<String, String>>,
    /// Request body
    pub body: Option<Value>,
}

impl ExecutionRequest {
    /// Request carrying only a body.
    pub fn with_body(body: Value) -> Self {
        Self {
            body: Some(body),
            ..Default::default()
        }
    }

    /// Fill in defaults: `POST`, `/`, empty header and query maps, null body.
    pub fn normalize(self) -> InvocationEnvelope {
        InvocationEnvelope {
            method: self
                .method
                .filter(|m| !m.is_empty())
                .map(|m| m.to_uppercase())
                .unwrap_or_else(|| "POST".to_string()),
            path: self
                .path
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "/".to_string()),
            headers: self.headers.unwrap_or_default(),
            query: self.query.unwrap_or_default(),
            body: self.body.unwrap_or(Value::Null),
        }
    }
}

/// The envelope written to `request.json` for the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationEnvelope {
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// Request headers
    pub headers: HashMap<String, String>,
    /// Query parameters
    pub query: HashMap<String, String>,
    /// Request body
    pub body: Value,
}

/// Outcome of an invocation that reached the runtime.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Whether the container exited cleanly within its deadline
    pub success: bool,
    /// `statusCode` reported by the function, if its output is an object carrying one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Decoded stdout (JSON, or the trimmed raw text); null on failure
    pub result: Option<Value>,
    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable failure code (`RUN_ERROR`, `TIMEOUT`, or `INTERNAL_ERROR`
    /// when the runtime could not run the container)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    /// Container stderr, kept on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Wall-clock duration of the run
    pub duration_ms: u64,
}

impl ExecutionResult {
    fn completed(stdout: &str, duration: Duration) -> Self {
        let result = decode_output(stdout);
        let status_code = result
            .get("statusCode")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok());
        Self {
            success: true,
            status_code,
            result: Some(result),
            error: None,
            error_code: None,
            stderr: None,
            duration_ms: duration.as_millis() as u64,
        }
    }

    fn failed(error: &Error, stderr: Option<String>, duration: Duration) -> Self {
        Self {
            success: false,
            status_code: None,
            result: None,
            error: Some(error.to_string()),
            error_code: Some(error.error_code()),
            stderr: stderr.filter(|s| !s.trim().is_empty()),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Decode container stdout: JSON when it parses, otherwise the trimmed text.
pub fn decode_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

/// How long a timed-out container's kill may take before the engine moves on.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs invocations against active deployments.
pub struct ExecutionEngine {
    repo: DeploymentRepository,
    runtime: Arc<dyn ContainerRuntime>,
    admission: AdmissionControl,
    data_dir: PathBuf,
    function_database_url: Option<String>,
    cleanup_check_delay: Duration,
    kill_timeout: Duration,
}

impl ExecutionEngine {
    /// Create an engine.
    pub fn new(
        repo: DeploymentRepository,
        runtime: Arc<dyn ContainerRuntime>,
        admission: AdmissionControl,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repo,
            runtime,
            admission,
            data_dir: data_dir.into(),
            function_database_url: None,
            cleanup_check_delay: Duration::from_secs(5),
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }

    /// Connection string injected into functions that require a database.
    pub fn with_function_database_url(mut self, url: Option<String>) -> Self {
        self.function_database_url = url;
        self
    }

    /// Delay before the post-timeout leaked-container check.
    pub fn with_cleanup_check_delay(mut self, delay: Duration) -> Self {
        self.cleanup_check_delay = delay;
        self
    }

    /// Upper bound on killing a timed-out container.
    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    /// Admission gate
    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    /// Invoke the function's active deployment.
    ///
    /// Validation, capacity and resolution failures are returned as errors
    /// without running anything. Once the run has been handed to the runtime,
    /// a non-zero exit, a timeout or a runtime failure is reported as an
    /// unsuccessful [`ExecutionResult`].
    pub async fn invoke(&self, function_id: &str, request: ExecutionRequest) -> Result<ExecutionResult> {
        if request.body.is_none() && request.query.is_none() {
            return Err(Error::Validation(
                "request must carry a body or a query".to_string(),
            ));
        }

        if !tokio::fs::try_exists(function_dir(&self.data_dir, function_id)).await? {
            return Err(Error::FunctionDirMissing(function_id.to_string()));
        }

        let _permit = self.admission.try_acquire().ok_or(Error::Capacity {
            limit: self.admission.limit(),
        })?;

        let function = self
            .repo
            .get_function(function_id)
            .await?
            .ok_or_else(|| Error::FunctionNotFound(function_id.to_string()))?;
        let deployment = self
            .repo
            .get_active(function_id)
            .await?
            .ok_or_else(|| Error::NoActiveDeployment(function_id.to_string()))?;

        let invocation_dir = self.prepare_invocation_dir(request.normalize()).await?;

        let mut env = HashMap::new();
        env.insert(
            REQUEST_PATH_ENV.to_string(),
            format!("{}/{}", INVOCATION_MOUNT, REQUEST_FILE),
        );
        if function.settings.requires_database {
            match &self.function_database_url {
                Some(url) => {
                    env.insert("DATABASE_URL".to_string(), url.clone());
                }
                None => warn!(
                    function_id = %function_id,
                    "Function requires a database but none is configured"
                ),
            }
        }

        let timeout = function.settings.timeout;
        let spec = RunSpec {
            image_tag: deployment.image_tag.clone(),
            container_name: container_name(function_id),
            env,
            mounts: vec![Mount {
                source: invocation_dir.path().to_path_buf(),
                destination: INVOCATION_MOUNT.to_string(),
                read_only: true,
            }],
            limits: function.settings.limits,
            network: NetworkMode::None,
            timeout,
        };

        debug!(
            function_id = %function_id,
            version = deployment.version,
            container = %spec.container_name,
            "Starting invocation"
        );

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.runtime.run(&spec)).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Err(_) => {
                let kill = self.runtime.kill(&spec.container_name);
                match tokio::time::timeout(self.kill_timeout, kill).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        container = %spec.container_name,
                        error = %e,
                        "Failed to kill timed-out container"
                    ),
                    Err(_) => warn!(
                        container = %spec.container_name,
                        kill_timeout_ms = self.kill_timeout.as_millis() as u64,
                        "Kill of timed-out container did not finish"
                    ),
                }
                self.schedule_leak_check(spec.container_name.clone());
                warn!(
                    function_id = %function_id,
                    version = deployment.version,
                    timeout_ms = timeout.as_millis() as u64,
                    "Invocation timed out"
                );
                ExecutionResult::failed(&Error::Timeout(timeout), None, elapsed)
            }
            Ok(Err(e)) => {
                let error = Error::from(e);
                warn!(
                    function_id = %function_id,
                    version = deployment.version,
                    error = %error,
                    "Container runtime failed to run invocation"
                );
                ExecutionResult::failed(&error, None, elapsed)
            }
            Ok(Ok(output)) if output.exit_code != 0 => {
                let error = Error::Run {
                    exit_code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                };
                warn!(
                    function_id = %function_id,
                    version = deployment.version,
                    exit_code = output.exit_code,
                    "Invocation failed"
                );
                ExecutionResult::failed(&error, Some(output.stderr), elapsed)
            }
            Ok(Ok(output)) => ExecutionResult::completed(&output.stdout, elapsed),
        };

        info!(
            function_id = %function_id,
            version = deployment.version,
            success = result.success,
            duration_ms = result.duration_ms,
            "Invocation finished"
        );

        Ok(result)
    }

    async fn prepare_invocation_dir(&self, envelope: InvocationEnvelope) -> Result<tempfile::TempDir> {
        let root = self.data_dir.join(INVOCATIONS_DIR);
        tokio::fs::create_dir_all(&root).await?;

        let dir = tempfile::Builder::new().prefix("inv-").tempdir_in(&root)?;
        // The container user is not the engine user.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).await?;
        }

        let body = serde_json::to_vec(&envelope)?;
        tokio::fs::write(dir.path().join(REQUEST_FILE), body).await?;
        Ok(dir)
    }

    /// Auto-removal owns container cleanup; this only reports leaks.
    fn schedule_leak_check(&self, container_name: String) {
        let runtime = self.runtime.clone();
        let delay = self.cleanup_check_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if runtime.container_exists(&container_name).await {
                warn!(container = %container_name, "Container still present after timeout kill");
            } else {
                debug!(container = %container_name, "Timed-out container is gone");
            }
        });
    }
}

fn container_name(function_id: &str) -> String {
    format!(
        "funcbox-{}-{}",
        function_identity(function_id),
        &uuid::Uuid::new_v4().simple().to_string()[..12]
    )
}

/// Whether `dir` is an invocation temp directory created by the engine.
pub(crate) fn is_invocation_dir(dir: &Path) -> bool {
    dir.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("inv-"))
}
