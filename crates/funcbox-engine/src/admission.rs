// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admission control for invocations.
//!
//! A single atomic in-flight counter checked against a fixed limit. There is
//! no queue: a caller either gets a permit immediately or is turned away.
//! The permit gives its slot back when dropped, so every exit path of an
//! invocation (success, error, timeout, panic unwind) releases it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide concurrency gate, shared by cloning.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    in_flight: AtomicUsize,
    limit: usize,
}

impl AdmissionControl {
    /// Create a gate admitting at most `limit` concurrent holders.
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                in_flight: AtomicUsize::new(0),
                limit,
            }),
        }
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        let mut current = self.inner.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.inner.limit {
                return None;
            }
            match self.inner.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(AdmissionPermit {
                        inner: self.inner.clone(),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Number of permits currently held.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Configured maximum.
    pub fn limit(&self) -> usize {
        self.inner.limit
    }
}

/// One admitted invocation. Dropping it frees the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    inner: Arc<Inner>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
