// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for funcbox-engine.

use std::time::Duration;

use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Container runtime could not be driven.
    #[error("Container runtime error: {0}")]
    Runtime(#[from] crate::runner::RuntimeError),

    /// Malformed invocation request.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Concurrency ceiling reached.
    #[error("Execution limit reached ({limit} concurrent executions)")]
    Capacity {
        /// Configured maximum.
        limit: usize,
    },

    /// Function does not exist.
    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    /// Deployment does not exist (or belongs to another function).
    #[error("Deployment not found: {0}")]
    DeploymentNotFound(String),

    /// Function exists but nothing is serving it.
    #[error("No active deployment for function {0}")]
    NoActiveDeployment(String),

    /// Requested version does not exist.
    #[error("Version {version} not found for function {function_id}")]
    VersionNotFound {
        /// Function identifier.
        function_id: String,
        /// Requested version.
        version: i64,
    },

    /// Function working directory is not materialized on this host.
    #[error("Function directory missing for function {0}")]
    FunctionDirMissing(String),

    /// Deployment is in a state that does not allow the operation.
    #[error("Invalid deployment state: {0}")]
    InvalidState(String),

    /// Image build failed or timed out.
    #[error("Build failed: {0}")]
    Build(String),

    /// Container exited with a non-zero code.
    #[error("Execution failed with exit code {exit_code}: {stderr}")]
    Run {
        /// Exit code of the container process.
        exit_code: i32,
        /// Captured stderr.
        stderr: String,
    },

    /// Container exceeded its wall-clock limit and was killed.
    #[error("Execution timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Artifact upload, download or extraction failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Archive could not be read.
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl Error {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Capacity { .. } => "CAPACITY_EXCEEDED",
            Self::FunctionNotFound(_)
            | Self::DeploymentNotFound(_)
            | Self::NoActiveDeployment(_)
            | Self::VersionNotFound { .. }
            | Self::FunctionDirMissing(_) => "NOT_FOUND",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Build(_) => "BUILD_ERROR",
            Self::Run { .. } => "RUN_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Storage(_) | Self::Archive(_) => "STORAGE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(_) | Self::Migration(_) => "DATABASE_ERROR",
            Self::Io(_) | Self::Json(_) | Self::Runtime(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller sent something the engine refuses to act on.
    ///
    /// Client errors never mutate deployment state.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::Capacity { .. }
                | Self::FunctionNotFound(_)
                | Self::DeploymentNotFound(_)
                | Self::NoActiveDeployment(_)
                | Self::VersionNotFound { .. }
                | Self::FunctionDirMissing(_)
                | Self::InvalidState(_)
        )
    }
}

/// Result type using the engine Error.
pub type Result<T> = std::result::Result<T, Error>;
