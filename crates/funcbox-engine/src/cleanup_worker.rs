// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for cleaning up leftover scratch directories.
//!
//! Scratch directories are normally removed by their guards as soon as the
//! operation that created them finishes:
//! - `{DATA_DIR}/invocations/inv-*/` - request envelope handed to a container
//! - `{DATA_DIR}/functions/{function}/rollback-*/` - downloaded rollback archive
//!
//! A process that crashes mid-invocation or mid-rollback leaves them behind.
//! This worker periodically scans for old ones and removes them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::executor::{INVOCATIONS_DIR, is_invocation_dir};

/// Configuration for the cleanup worker.
#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    /// Engine data directory.
    pub data_dir: PathBuf,
    /// How often to scan for old directories.
    pub poll_interval: Duration,
    /// Maximum age of scratch directories before cleanup.
    pub max_age: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".data"),
            poll_interval: Duration::from_secs(600), // 10 minutes
            max_age: Duration::from_secs(3600),      // 1 hour
        }
    }
}

/// Background worker that cleans up leftover scratch directories.
pub struct CleanupWorker {
    config: CleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl CleanupWorker {
    /// Create a new cleanup worker.
    pub fn new(config: CleanupWorkerConfig) -> Self {
        Self {
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup worker loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            data_dir = %self.config.data_dir.display(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_secs = self.config.max_age.as_secs(),
            "Cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.cleanup_once().await {
                        error!(error = %e, "Failed to cleanup scratch directories");
                    }
                }
            }
        }

        info!("Cleanup worker stopped");
    }

    /// Run one cleanup pass, returning the number of directories removed.
    pub async fn cleanup_once(&self) -> std::io::Result<u64> {
        let max_age =
            chrono::Duration::from_std(self.config.max_age).unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - max_age;

        let invocations = self.config.data_dir.join(INVOCATIONS_DIR);
        let (mut cleaned, mut errors) = self
            .cleanup_matching(&invocations, cutoff, is_invocation_dir)
            .await;

        let functions = self.config.data_dir.join("functions");
        match tokio::fs::read_dir(&functions).await {
            Ok(mut dirs) => {
                while let Some(entry) = dirs.next_entry().await? {
                    let path = entry.path();
                    if !path.is_dir() {
                        continue;
                    }
                    let (c, e) = self
                        .cleanup_matching(&path, cutoff, is_rollback_staging_dir)
                        .await;
                    cleaned += c;
                    errors += e;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        if cleaned > 0 || errors > 0 {
            info!(cleaned, errors, "Cleanup cycle completed");
        } else {
            debug!("Cleanup cycle completed, no old directories found");
        }

        Ok(cleaned)
    }

    /// Remove subdirectories of `parent` accepted by `matches` and last
    /// modified before `cutoff`.
    async fn cleanup_matching(
        &self,
        parent: &Path,
        cutoff: DateTime<Utc>,
        matches: fn(&Path) -> bool,
    ) -> (u64, u64) {
        let mut cleaned = 0u64;
        let mut errors = 0u64;

        let mut entries = match tokio::fs::read_dir(parent).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return (0, 0),
            Err(e) => {
                warn!(path = %parent.display(), error = %e, "Failed to read directory");
                return (0, 1);
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() || !matches(&path) {
                continue;
            }

            let modified = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(t) => DateTime::<Utc>::from(t),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Failed to get modification time");
                    errors += 1;
                    continue;
                }
            };

            // Skip if too recent
            if modified > cutoff {
                continue;
            }

            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    debug!(
                        path = %path.display(),
                        age_secs = (Utc::now() - modified).num_seconds(),
                        "Removed leftover scratch directory"
                    );
                    cleaned += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove scratch directory");
                    errors += 1;
                }
            }
        }

        (cleaned, errors)
    }
}

fn is_rollback_staging_dir(dir: &Path) -> bool {
    dir.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("rollback-"))
}
