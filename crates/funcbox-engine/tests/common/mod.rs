// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for funcbox-engine integration tests.
//!
//! Provides TestContext wiring an in-memory SQLite store, a temp data dir and
//! a MockRuntime into EngineState.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use funcbox_engine::artifact_store::FsArtifactStore;
use funcbox_engine::config::Config;
use funcbox_engine::db;
use funcbox_engine::deployments::FunctionSettings;
use funcbox_engine::handlers::{DeployRequest, EngineState, handle_deploy};
use funcbox_engine::runner::MockRuntime;

/// Test context that owns the engine state and its scratch directory.
pub struct TestContext {
    pub pool: SqlitePool,
    pub runtime: Arc<MockRuntime>,
    pub state: EngineState,
    pub data_dir: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Create a context with default configuration.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a context, letting the caller adjust the configuration.
    pub async fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        Self::build(false, adjust).await
    }

    /// Create a context on a file-backed store with a multi-connection pool,
    /// the way the binary opens it.
    pub async fn with_file_store() -> Self {
        Self::build(true, |_| {}).await
    }

    async fn build(file_store: bool, adjust: impl FnOnce(&mut Config)) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let data_dir = temp_dir.path().to_path_buf();

        let pool = if file_store {
            let url = format!("sqlite:{}?mode=rwc", data_dir.join("funcbox.db").display());
            db::connect(&url, db::DEFAULT_MAX_CONNECTIONS)
                .await
                .expect("Failed to open database file")
        } else {
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .expect("Failed to open in-memory database")
        };
        funcbox_engine::migrations::run(&pool)
            .await
            .expect("Failed to run migrations");

        let mut config = Config {
            data_dir: data_dir.clone(),
            build_timeout: Duration::from_secs(5),
            cleanup_check_delay: Duration::from_millis(50),
            ..Config::default()
        };
        adjust(&mut config);

        let runtime = Arc::new(MockRuntime::new());
        let state = EngineState::new(
            &config,
            pool.clone(),
            runtime.clone(),
            Arc::new(FsArtifactStore::in_data_dir(&data_dir)),
        );

        Self {
            pool,
            runtime,
            state,
            data_dir,
            _temp_dir: temp_dir,
        }
    }

    /// Deploy `archive` as a new version of `function_id` with default settings.
    pub async fn deploy(&self, function_id: &str, archive: Vec<u8>) -> funcbox_engine::handlers::DeployResponse {
        self.deploy_with(function_id, archive, None).await
    }

    /// Deploy with explicit execution settings.
    pub async fn deploy_with(
        &self,
        function_id: &str,
        archive: Vec<u8>,
        settings: Option<FunctionSettings>,
    ) -> funcbox_engine::handlers::DeployResponse {
        handle_deploy(
            &self.state,
            DeployRequest {
                function_id: function_id.to_string(),
                name: format!("{} function", function_id),
                owner: "test-owner".to_string(),
                archive,
                settings,
            },
        )
        .await
        .expect("deploy handler failed")
    }
}

/// Build an in-memory ZIP archive from `(name, content)` pairs.
pub fn zip_archive(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .expect("start_file");
        writer.write_all(content.as_bytes()).expect("write entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

/// A small function archive whose content differs per `revision`.
pub fn function_archive(revision: u32) -> Vec<u8> {
    let handler = format!("String handle() => 'revision {}';\n", revision);
    zip_archive(&[
        ("pubspec.yaml", "name: handler\n"),
        ("lib/handler.dart", handler.as_str()),
    ])
}
