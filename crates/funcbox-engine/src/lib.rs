// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Funcbox Engine - Deployment Versioning & Container Execution
//!
//! This crate turns uploaded function archives into versioned container
//! images, tracks which version of each function is live, runs invocations
//! against it under concurrency, time and resource limits, and rolls back
//! atomically to any earlier version.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 Outer layer (HTTP API, CLI, dashboard)                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ handlers
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     funcbox-engine (This Crate)                          │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │   Build     │  │  Execution  │  │  Rollback   │  │  Admission  │     │
//! │  │  Pipeline   │  │   Engine    │  │ Controller  │  │   Control   │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!        │                  │                 │                  │
//!        ▼                  ▼                 ▼                  ▼
//! ┌──────────────┐  ┌───────────────┐  ┌──────────────┐  ┌──────────────────┐
//! │   Artifact   │  │  Deployment   │  │  Container   │  │ Function working │
//! │    Store     │  │  Repository   │  │   Runtime    │  │   directories    │
//! │  (archives)  │  │   (SQLite)    │  │  (podman)    │  │   (DATA_DIR)     │
//! └──────────────┘  └───────────────┘  └──────────────┘  └──────────────────┘
//! ```
//!
//! # Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `deploy` | Upload an archive, build version `max + 1`, activate on success |
//! | `invoke` | Run the active version with the request envelope |
//! | `rollback` | Re-materialize an earlier version and activate it |
//! | `list_deployments` | Versions of a function, newest first |
//! | `delete_function` | Remove rows, images and working directories |
//!
//! # Deployment Status State Machine
//!
//! ```text
//!                 ┌──────────┐
//!                 │ BUILDING │
//!                 └────┬─────┘
//!           build ok   │   build failed / timed out / interrupted
//!          ┌───────────┴───────────┐
//!          ▼                       ▼
//!     ┌─────────┐             ┌────────┐
//!     │ ACTIVE  │◄─┐          │ FAILED │
//!     └────┬────┘  │          └────────┘
//!  newer   │       │ rollback
//!  version │       │
//!          ▼       │
//!     ┌──────────┐ │
//!     │ INACTIVE │─┘
//!     └──────────┘
//! ```
//!
//! At most one deployment per function is active at any instant; the
//! switch happens in a single database transaction.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FUNCBOX_DATABASE_URL` | `sqlite:<DATA_DIR>/funcbox.db?mode=rwc` | Deployment store (`DATABASE_URL` as fallback) |
//! | `DATA_DIR` | `.data` | Working directories, artifacts, invocation files |
//! | `FUNCBOX_CONTAINER_BINARY` | `podman` | Container CLI (`podman` or `docker`) |
//! | `FUNCBOX_MAX_CONCURRENT_EXECUTIONS` | `10` | Concurrent invocation limit |
//! | `FUNCBOX_BUILD_TIMEOUT_SECS` | `300` | Image build timeout |
//! | `FUNCBOX_DEFAULT_TIMEOUT_SECS` | `5` | Default invocation timeout |
//! | `FUNCBOX_DEFAULT_MEMORY_MB` | `128` | Default memory ceiling |
//! | `FUNCBOX_DEFAULT_CPUS` | `0.5` | Default CPU ceiling |
//! | `FUNCBOX_FUNCTION_DATABASE_URL` | - | Injected into functions that need a database |
//! | `FUNCBOX_CLEANUP_CHECK_DELAY_SECS` | `5` | Delay of the post-timeout container check |

#![deny(missing_docs)]

/// Database migrations for funcbox-engine.
///
/// ```ignore
/// use funcbox_engine::migrations;
///
/// let pool = SqlitePool::connect(&database_url).await?;
/// migrations::run(&pool).await?;
/// ```
pub mod migrations;

/// Engine configuration loaded from environment variables.
pub mod config;

/// Error types for engine operations.
pub mod error;

/// Deployment store connection setup.
pub mod db;

/// Functions and versioned deployments.
pub mod deployments;

/// Content-addressed storage for source archives.
pub mod artifact_store;

/// ZIP extraction into working directories.
pub mod archive;

/// Global invocation concurrency gate.
pub mod admission;

/// Per-function deploy/rollback serialization.
pub mod locks;

/// Archive to image to active deployment.
pub mod pipeline;

/// Sandboxed invocation of active deployments.
pub mod executor;

/// Re-activation of earlier versions.
pub mod rollback;

/// Container runtime backends (podman CLI, mock).
pub mod runner;

/// Engine operation handlers.
pub mod handlers;

/// Background worker for cleaning up leftover scratch directories.
pub mod cleanup_worker;

/// Embeddable runtime for funcbox-engine.
pub mod runtime;

pub use config::Config;
pub use error::Error;
