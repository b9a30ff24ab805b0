// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for funcbox-engine.
//!
//! [`EngineRuntime`] wires the engine together, reconciles state left by a
//! previous process and runs the background cleanup worker. Outer layers
//! (an HTTP API, a CLI) call the handlers through [`EngineRuntime::state`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use funcbox_engine::config::Config;
//! use funcbox_engine::runtime::EngineRuntime;
//! use funcbox_engine::runner::PodmanRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let pool = sqlx::SqlitePool::connect(&config.database_url).await?;
//!
//!     let runtime = EngineRuntime::builder()
//!         .pool(pool)
//!         .container_runtime(Arc::new(PodmanRuntime::from_env()))
//!         .config(config)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve requests through runtime.state() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::artifact_store::{ArtifactStore, FsArtifactStore};
use crate::cleanup_worker::{CleanupWorker, CleanupWorkerConfig};
use crate::config::Config;
use crate::deployments::DeploymentRepository;
use crate::executor::INVOCATIONS_DIR;
use crate::handlers::EngineState;
use crate::runner::ContainerRuntime;

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    pool: Option<SqlitePool>,
    container_runtime: Option<Arc<dyn ContainerRuntime>>,
    artifact_store: Option<Arc<dyn ArtifactStore>>,
    config: Config,
    run_migrations: bool,
    cleanup_poll_interval: Duration,
    cleanup_max_age: Duration,
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            pool: None,
            container_runtime: None,
            artifact_store: None,
            config: Config::default(),
            run_migrations: true,
            cleanup_poll_interval: Duration::from_secs(600), // 10 minutes
            cleanup_max_age: Duration::from_secs(3600),      // 1 hour
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the deployment store pool (required).
    pub fn pool(mut self, pool: SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the container runtime (required).
    pub fn container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.container_runtime = Some(runtime);
        self
    }

    /// Set the artifact store. Defaults to a [`FsArtifactStore`] in the data dir.
    pub fn artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifact_store = Some(store);
        self
    }

    /// Set the engine configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Whether to apply embedded migrations on start (default: true).
    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// Set how often the cleanup worker scans for leftover scratch directories.
    pub fn cleanup_poll_interval(mut self, interval: Duration) -> Self {
        self.cleanup_poll_interval = interval;
        self
    }

    /// Set the age after which scratch directories are considered leftovers.
    pub fn cleanup_max_age(mut self, max_age: Duration) -> Self {
        self.cleanup_max_age = max_age;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let pool = self
            .pool
            .ok_or_else(|| anyhow::anyhow!("pool is required"))?;
        let container_runtime = self
            .container_runtime
            .ok_or_else(|| anyhow::anyhow!("container_runtime is required"))?;
        let artifact_store = self
            .artifact_store
            .unwrap_or_else(|| Arc::new(FsArtifactStore::in_data_dir(&self.config.data_dir)));

        Ok(EngineRuntimeConfig {
            pool,
            container_runtime,
            artifact_store,
            config: self.config,
            run_migrations: self.run_migrations,
            cleanup_poll_interval: self.cleanup_poll_interval,
            cleanup_max_age: self.cleanup_max_age,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    pool: SqlitePool,
    container_runtime: Arc<dyn ContainerRuntime>,
    artifact_store: Arc<dyn ArtifactStore>,
    config: Config,
    run_migrations: bool,
    cleanup_poll_interval: Duration,
    cleanup_max_age: Duration,
}

impl EngineRuntimeConfig {
    /// Start the runtime: migrate, reconcile, spawn the cleanup worker.
    pub async fn start(self) -> Result<EngineRuntime> {
        if self.run_migrations {
            crate::migrations::run(&self.pool).await?;
        }

        tokio::fs::create_dir_all(self.config.data_dir.join(INVOCATIONS_DIR)).await?;

        // Builds interrupted by a previous process will never finish.
        let repo = DeploymentRepository::new(self.pool.clone());
        match repo.fail_stale_builds().await {
            Ok(0) => {}
            Ok(count) => info!(count, "Reconciled interrupted builds"),
            Err(e) => warn!(error = %e, "Failed to reconcile interrupted builds"),
        }

        let state = Arc::new(EngineState::new(
            &self.config,
            self.pool,
            self.container_runtime.clone(),
            self.artifact_store,
        ));

        let cleanup_worker = CleanupWorker::new(CleanupWorkerConfig {
            data_dir: state.pipeline.data_dir().to_path_buf(),
            poll_interval: self.cleanup_poll_interval,
            max_age: self.cleanup_max_age,
        });
        let cleanup_shutdown = cleanup_worker.shutdown_handle();
        let cleanup_handle = tokio::spawn(async move {
            cleanup_worker.run().await;
        });

        info!(
            data_dir = %state.pipeline.data_dir().display(),
            container_runtime = self.container_runtime.runtime_type(),
            max_concurrent_executions = self.config.max_concurrent_executions,
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            cleanup_handle,
            cleanup_shutdown,
            state,
        })
    }
}

/// A running engine that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    cleanup_handle: JoinHandle<()>,
    cleanup_shutdown: Arc<Notify>,
    state: Arc<EngineState>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Get a reference to the shared handler state.
    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    /// Gracefully shut down the runtime.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        self.cleanup_shutdown.notify_one();
        if let Err(e) = self.cleanup_handle.await {
            error!("Cleanup worker task panicked: {}", e);
            return Err(anyhow::anyhow!("cleanup worker panicked: {}", e));
        }

        info!("EngineRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.cleanup_handle.is_finished()
    }
}
