// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ZIP extraction into function working directories.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::{Error, Result};

/// Extract a ZIP archive into `dest`.
///
/// `dest` is emptied first, so extracting the same archive twice leaves the
/// same tree. Entries whose names would land outside `dest` (absolute paths,
/// `..` components) are rejected and nothing further is written. Returns the
/// number of files written.
pub async fn extract_zip(bytes: Vec<u8>, dest: &Path) -> Result<usize> {
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_zip_blocking(&bytes, &dest))
        .await
        .map_err(|e| Error::Storage(format!("Extraction task failed: {}", e)))?
}

fn extract_zip_blocking(bytes: &[u8], dest: &Path) -> Result<usize> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;

    if dest.exists() {
        std::fs::remove_dir_all(dest)?;
    }
    std::fs::create_dir_all(dest)?;

    let mut written = 0;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let relative: PathBuf = file.enclosed_name().ok_or_else(|| {
            Error::Storage(format!("Archive entry escapes target directory: {}", file.name()))
        })?;
        let out_path = dest.join(relative);

        if file.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&out_path)?;
        std::io::copy(&mut file, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode & 0o777))?;
        }

        written += 1;
    }

    tracing::debug!(dest = %dest.display(), files = written, "Extracted archive");
    Ok(written)
}
