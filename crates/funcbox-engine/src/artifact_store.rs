// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Artifact Store
//!
//! Source archives are kept outside the deployment rows so a version can be
//! re-materialized long after its working directory and image are gone.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Stores function source archives by key.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an archive, returning the key it can be fetched by.
    async fn upload(&self, bytes: &[u8]) -> Result<String>;

    /// Fetch an archive into `dest`, overwriting whatever is there.
    async fn download(&self, key: &str, dest: &Path) -> Result<()>;

    /// Whether an archive exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove an archive. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Content-addressed store on the local filesystem.
///
/// Archives live at `<root>/<sha256>.zip`; uploading identical bytes twice
/// writes once.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `root` (created on first upload)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted at `<data_dir>/artifacts`
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("artifacts"))
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = key.len() == 64 && key.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(Error::Storage(format!("Invalid artifact key: {}", key)));
        }
        Ok(self.root.join(format!("{}.zip", key)))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn upload(&self, bytes: &[u8]) -> Result<String> {
        let key = format!("{:x}", Sha256::digest(bytes));
        let path = self.path_for(&key)?;

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!(key = %key, "Artifact already stored");
            return Ok(key);
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create artifact dir: {}", e)))?;

        // Write then rename so a reader never sees a partial archive.
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write artifact {}: {}", key, e)))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Storage(format!("Failed to store artifact {}: {}", key, e)));
        }

        tracing::info!(key = %key, size = bytes.len(), "Stored artifact");
        Ok(key)
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&path, dest).await.map_err(|e| {
            Error::Storage(format!("Failed to fetch artifact {}: {}", key, e))
        })?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!(
                "Failed to delete artifact {}: {}",
                key, e
            ))),
        }
    }
}
