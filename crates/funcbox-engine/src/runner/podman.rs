// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Podman/Docker CLI runtime implementation.
//!
//! Drives the container engine through its command line. Pure process
//! supervision, no database access. Every spawned child is created with
//! `kill_on_drop`, so a caller that abandons a build or run on timeout also
//! terminates the CLI process.
//!
//! Queries go through `image inspect` and `container inspect`, which both
//! CLIs accept. Docker has no `run --timeout`, so under docker the engine's
//! own deadline is the only one.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::traits::*;

/// Podman runtime configuration
#[derive(Debug, Clone)]
pub struct PodmanRuntimeConfig {
    /// CLI binary (`podman` or `docker`, optionally a path)
    pub binary: String,
    /// Target platform for builds (e.g. `linux/amd64`); engine default if unset
    pub platform: Option<String>,
    /// Disable the build cache
    pub no_cache: bool,
}

impl Default for PodmanRuntimeConfig {
    fn default() -> Self {
        Self {
            binary: "podman".to_string(),
            platform: None,
            no_cache: false,
        }
    }
}

impl PodmanRuntimeConfig {
    /// Whether the binary is docker rather than podman.
    pub fn is_docker(&self) -> bool {
        Path::new(&self.binary)
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("docker"))
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            binary: std::env::var("FUNCBOX_CONTAINER_BINARY")
                .unwrap_or_else(|_| "podman".to_string()),
            platform: std::env::var("FUNCBOX_BUILD_PLATFORM")
                .ok()
                .filter(|p| !p.is_empty()),
            no_cache: std::env::var("FUNCBOX_BUILD_NO_CACHE")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
        }
    }
}

/// Container runtime backed by the podman (or docker) CLI.
pub struct PodmanRuntime {
    config: PodmanRuntimeConfig,
}

impl PodmanRuntime {
    /// Create a new runtime
    pub fn new(config: PodmanRuntimeConfig) -> Self {
        Self { config }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::new(PodmanRuntimeConfig::from_env())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> RuntimeError {
        RuntimeError::Spawn {
            binary: self.config.binary.clone(),
            source,
        }
    }

    /// Run a short management command, reporting only whether it exited cleanly.
    async fn status_of(&self, args: &[&str]) -> bool {
        match self
            .command()
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(e) => {
                warn!(binary = %self.config.binary, error = %e, "Failed to query container runtime");
                false
            }
        }
    }
}

/// Arguments for `podman build`.
pub(crate) fn build_args(config: &PodmanRuntimeConfig, spec: &BuildSpec) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["build".into(), "--tag".into(), spec.tag.clone().into()];
    args.push("--file".into());
    args.push(spec.context_dir.join(&spec.dockerfile).into_os_string());
    if let Some(platform) = &config.platform {
        args.push("--platform".into());
        args.push(platform.into());
    }
    if config.no_cache {
        args.push("--no-cache".into());
    }
    args.push(spec.context_dir.clone().into_os_string());
    args
}

/// Podman's own `--timeout` for a run, in whole seconds.
///
/// A backstop for an engine that died mid-invocation. It is rounded up and
/// padded so it always fires after the engine's deadline, which then
/// reports the run as timed out.
pub(crate) fn runtime_timeout_secs(timeout: Duration) -> u64 {
    (timeout.as_millis().div_ceil(1000) as u64).saturating_add(1)
}

/// Arguments for `podman run`.
///
/// Containers are always auto-removed, have swap pinned to the memory
/// ceiling and run with the requested network attachment.
pub(crate) fn run_args(config: &PodmanRuntimeConfig, spec: &RunSpec) -> Vec<OsString> {
    let memory = format!("{}m", spec.limits.memory_mb);
    let mut args: Vec<OsString> = vec![
        "run".into(),
        "--rm".into(),
        "--name".into(),
        spec.container_name.clone().into(),
        "--network".into(),
        spec.network.as_str().into(),
        "--memory".into(),
        memory.clone().into(),
        "--memory-swap".into(),
        memory.into(),
        "--cpus".into(),
        format!("{}", spec.limits.cpus).into(),
    ];
    if !config.is_docker() {
        args.push("--timeout".into());
        args.push(runtime_timeout_secs(spec.timeout).to_string().into());
    }

    let mut env: Vec<_> = spec.env.iter().collect();
    env.sort();
    for (key, value) in env {
        args.push("--env".into());
        args.push(format!("{}={}", key, value).into());
    }

    for mount in &spec.mounts {
        let mut volume = OsString::from(mount.source.as_os_str());
        volume.push(":");
        volume.push(&mount.destination);
        if mount.read_only {
            volume.push(":ro");
        }
        args.push("--volume".into());
        args.push(volume);
    }

    args.push(spec.image_tag.clone().into());
    args
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    fn runtime_type(&self) -> &'static str {
        "podman"
    }

    async fn build(&self, spec: &BuildSpec) -> Result<BuildOutput> {
        if !spec.context_dir.is_dir() {
            return Err(RuntimeError::ContextNotFound(
                spec.context_dir.display().to_string(),
            ));
        }

        debug!(
            tag = %spec.tag,
            context_dir = %spec.context_dir.display(),
            "Building image"
        );

        let output = self
            .command()
            .args(build_args(&self.config, spec))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !logs.is_empty() && !logs.ends_with('\n') {
                logs.push('\n');
            }
            logs.push_str(&stderr);
        }

        let exit_code = output.status.code().unwrap_or(-1);
        info!(tag = %spec.tag, exit_code, "Image build finished");

        Ok(BuildOutput { exit_code, logs })
    }

    async fn run(&self, spec: &RunSpec) -> Result<RunOutput> {
        debug!(
            image = %spec.image_tag,
            container = %spec.container_name,
            memory_mb = spec.limits.memory_mb,
            cpus = spec.limits.cpus,
            network = spec.network.as_str(),
            "Starting container"
        );

        let output = self
            .command()
            .args(run_args(&self.config, spec))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        Ok(RunOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn kill(&self, container_name: &str) -> Result<()> {
        let killed = self
            .status_of(&["kill", "--signal", "SIGKILL", container_name])
            .await;
        if !killed {
            debug!(container = %container_name, "Kill reported failure, container may already be gone");
        }
        // Auto-removal normally reclaims the container; force it in case the kill raced startup.
        let _ = self.status_of(&["rm", "--force", container_name]).await;
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        let output = self
            .command()
            .args(["rmi", "--force", tag])
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::Other(format!(
                "Failed to remove image {}: {}",
                tag,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> bool {
        self.status_of(&["image", "inspect", tag]).await
    }

    async fn container_exists(&self, container_name: &str) -> bool {
        self.status_of(&["container", "inspect", container_name]).await
    }
}
