// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-function locks serializing deploys and rollbacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Keyed async mutexes, one per function id.
///
/// Held from version allocation through activation. Entries are pruned once
/// nobody holds or waits on them.
#[derive(Debug, Clone, Default)]
pub struct FunctionLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl FunctionLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a function.
    pub async fn acquire(&self, function_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // The map holds one reference; anything more is a holder or waiter.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(function_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Number of functions with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no lock entries are live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
