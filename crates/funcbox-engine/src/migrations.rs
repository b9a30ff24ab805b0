// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for funcbox-engine.
//!
//! The schema holds two tables:
//! - `functions` - one row per function, with its active-deployment pointer
//! - `deployments` - every version ever created for a function
//!
//! # Example
//!
//! ```ignore
//! use funcbox_engine::migrations;
//!
//! let pool = SqlitePool::connect(&database_url).await?;
//! migrations::run(&pool).await?;
//! ```

use sqlx::SqlitePool;
use sqlx::migrate::{MigrateError, Migrator};

/// Migrations embedded at compile time.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Run all pending migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run(pool: &SqlitePool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}
