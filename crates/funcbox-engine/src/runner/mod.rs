// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner module - container runtime backends.
//!
//! Builds function images and runs them as short-lived sandboxed containers.

pub mod mock;
pub mod podman;
mod traits;

pub use mock::{MockRunBehavior, MockRuntime};
pub use podman::{PodmanRuntime, PodmanRuntimeConfig};
pub use traits::*;
