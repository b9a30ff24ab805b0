// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime trait definitions.
//!
//! Defines the abstract interface for building and running function images.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors from runtime operations.
///
/// A non-zero exit code is not an error at this level: it is reported in
/// [`BuildOutput`] / [`RunOutput`] and interpreted by the caller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The runtime binary could not be started.
    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        /// Runtime binary name.
        binary: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Build context directory does not exist.
    #[error("Build context not found: {0}")]
    ContextNotFound(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Memory and CPU ceilings for one container.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in megabytes (swap is capped at the same value)
    pub memory_mb: u32,
    /// CPU share ceiling in cores
    pub cpus: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 128,
            cpus: 0.5,
        }
    }
}

/// Network attachment for a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// No network interfaces besides loopback
    #[default]
    None,
    /// Runtime's default bridge network
    Bridge,
}

impl NetworkMode {
    /// Name understood by `podman run --network`.
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::None => "none",
            NetworkMode::Bridge => "bridge",
        }
    }
}

/// A host directory bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Host path
    pub source: PathBuf,
    /// Path inside the container
    pub destination: String,
    /// Mount read-only
    pub read_only: bool,
}

/// Options for building an image.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    /// Build context directory
    pub context_dir: PathBuf,
    /// Tag to assign to the built image
    pub tag: String,
    /// Dockerfile path, relative to the context directory
    pub dockerfile: String,
}

/// Outcome of an image build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildOutput {
    /// Exit code of the build process
    pub exit_code: i32,
    /// Combined build output
    pub logs: String,
}

impl BuildOutput {
    /// Whether the build exited cleanly.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Options for running a container to completion.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Image to run
    pub image_tag: String,
    /// Unique container name (used for kill)
    pub container_name: String,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Bind mounts
    pub mounts: Vec<Mount>,
    /// Resource ceilings
    pub limits: ResourceLimits,
    /// Network attachment
    pub network: NetworkMode,
    /// Wall-clock limit, also handed to the runtime as a backstop
    pub timeout: Duration,
}

/// Outcome of a container run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOutput {
    /// Exit code of the container process
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

/// Trait for container runtimes.
///
/// Runtimes are PURE process supervisors - they do NOT access the database.
/// Deadlines are enforced by the caller: dropping an in-flight `build` or
/// `run` future must terminate the underlying process.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime type identifier (e.g., "podman", "docker", "mock")
    fn runtime_type(&self) -> &'static str;

    /// Build an image from a context directory.
    async fn build(&self, spec: &BuildSpec) -> Result<BuildOutput>;

    /// Run an image to completion, capturing its output.
    ///
    /// The container is started with auto-removal so it disappears on exit.
    async fn run(&self, spec: &RunSpec) -> Result<RunOutput>;

    /// Forcibly stop a running container.
    async fn kill(&self, container_name: &str) -> Result<()>;

    /// Remove an image by tag.
    async fn remove_image(&self, tag: &str) -> Result<()>;

    /// Check whether an image with this tag exists locally.
    async fn image_exists(&self, tag: &str) -> bool;

    /// Check whether a container with this name still exists.
    async fn container_exists(&self, container_name: &str) -> bool;
}
