// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Funcbox Engine - standalone process
//!
//! Starts the engine against the configured SQLite store and container CLI,
//! reconciles interrupted builds, and runs the cleanup worker until Ctrl-C.
//! Request routing lives in the outer API layer, which embeds
//! [`funcbox_engine::runtime::EngineRuntime`] the same way.

use std::sync::Arc;
use tracing::{info, warn};

use funcbox_engine::artifact_store::FsArtifactStore;
use funcbox_engine::config::Config;
use funcbox_engine::db;
use funcbox_engine::runner::{ContainerRuntime, PodmanRuntime, PodmanRuntimeConfig};
use funcbox_engine::runtime::EngineRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "funcbox_engine=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        data_dir = %config.data_dir.display(),
        container_binary = %config.container_binary,
        max_concurrent_executions = config.max_concurrent_executions,
        "Starting Funcbox Engine"
    );

    tokio::fs::create_dir_all(&config.data_dir).await?;

    // Connect to database
    let pool = db::connect(&config.database_url, db::DEFAULT_MAX_CONNECTIONS).await?;

    info!("Connected to database");

    // Create container runtime
    let runtime = Arc::new(PodmanRuntime::new(PodmanRuntimeConfig {
        binary: config.container_binary.clone(),
        ..PodmanRuntimeConfig::from_env()
    }));
    info!(runtime_type = runtime.runtime_type(), "Container runtime initialized");

    let artifacts = Arc::new(FsArtifactStore::in_data_dir(&config.data_dir));

    // Start the runtime
    let engine = EngineRuntime::builder()
        .pool(pool)
        .container_runtime(runtime)
        .artifact_store(artifacts)
        .config(config)
        .build()?
        .start()
        .await?;

    info!("Funcbox Engine ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    engine.shutdown().await?;

    info!("Funcbox Engine shut down");

    Ok(())
}
