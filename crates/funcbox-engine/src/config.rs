// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for funcbox-engine.

use std::path::PathBuf;
use std::time::Duration;

use crate::runner::ResourceLimits;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL for the deployment store
    pub database_url: String,
    /// Data directory for working directories, artifacts and invocation files
    pub data_dir: PathBuf,
    /// Container runtime CLI (`podman` or `docker`)
    pub container_binary: String,
    /// Maximum number of invocations running at once
    pub max_concurrent_executions: usize,
    /// Image build timeout
    pub build_timeout: Duration,
    /// Execution defaults for functions that do not override them
    pub defaults: ExecutionDefaults,
    /// Connection string injected into functions that require a database
    pub function_database_url: Option<String>,
    /// Delay before the best-effort check for leaked containers after a timeout
    pub cleanup_check_delay: Duration,
}

/// Default per-invocation limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionDefaults {
    /// Wall-clock timeout for one invocation
    pub timeout: Duration,
    /// Memory and CPU ceilings
    pub limits: ResourceLimits,
}

impl Default for ExecutionDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            limits: ResourceLimits::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from(".data");
        Self {
            database_url: default_database_url(&data_dir),
            data_dir,
            container_binary: "podman".to_string(),
            max_concurrent_executions: 10,
            build_timeout: Duration::from_secs(300),
            defaults: ExecutionDefaults::default(),
            function_database_url: None,
            cleanup_check_delay: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir =
            PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| ".data".to_string()));

        let database_url = std::env::var("FUNCBOX_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .unwrap_or_else(|_| default_database_url(&data_dir));

        let container_binary =
            std::env::var("FUNCBOX_CONTAINER_BINARY").unwrap_or_else(|_| "podman".to_string());

        let max_concurrent_executions = parse_env("FUNCBOX_MAX_CONCURRENT_EXECUTIONS", 10usize)?;
        if max_concurrent_executions == 0 {
            return Err(ConfigError::InvalidValue {
                var: "FUNCBOX_MAX_CONCURRENT_EXECUTIONS",
                value: "0".to_string(),
            });
        }

        let build_timeout = Duration::from_secs(parse_env("FUNCBOX_BUILD_TIMEOUT_SECS", 300u64)?);
        let timeout = Duration::from_secs(parse_env("FUNCBOX_DEFAULT_TIMEOUT_SECS", 5u64)?);
        let memory_mb = parse_env("FUNCBOX_DEFAULT_MEMORY_MB", 128u32)?;
        let cpus = parse_env("FUNCBOX_DEFAULT_CPUS", 0.5f64)?;
        let cleanup_check_delay =
            Duration::from_secs(parse_env("FUNCBOX_CLEANUP_CHECK_DELAY_SECS", 5u64)?);

        let function_database_url = std::env::var("FUNCBOX_FUNCTION_DATABASE_URL")
            .ok()
            .filter(|v| !v.is_empty());

        Ok(Self {
            database_url,
            data_dir,
            container_binary,
            max_concurrent_executions,
            build_timeout,
            defaults: ExecutionDefaults {
                timeout,
                limits: ResourceLimits { memory_mb, cpus },
            },
            function_database_url,
            cleanup_check_delay,
        })
    }
}

fn default_database_url(data_dir: &std::path::Path) -> String {
    format!("sqlite:{}?mode=rwc", data_dir.join("funcbox.db").display())
}

/// Parse an env var, falling back to `default` when it is unset.
fn parse_env<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable holds a value that cannot be parsed.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value found in the environment.
        value: String,
    },
}
