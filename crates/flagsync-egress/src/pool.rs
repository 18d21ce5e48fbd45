// Copyright 2025-Present Split Software, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reusable-container pools.
//!
//! The batching stages allocate the same vectors and maps on every process
//! cycle; pooling them keeps the steady state allocation-free. The contract
//! is: acquire clears, release returns unconditionally, capacity is kept
//! across reuse.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// A container that can be emptied and handed back out.
pub trait Reusable: Send {
    fn reset(&mut self);
}

impl<T: Send> Reusable for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

impl<K: Send + Eq + Hash, V: Send> Reusable for HashMap<K, V> {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Thread-safe free-list of reusable containers.
///
/// `acquire` pops a cleared container, building a fresh one with the
/// configured constructor only when the list is empty. `release` pushes
/// the container back without inspecting it; stale contents are cleared on
/// the next acquire.
pub struct Pool<T: Reusable> {
    free: Mutex<Vec<T>>,
    build: Box<dyn Fn() -> T + Send + Sync>,
    outstanding: AtomicIsize,
}

impl<T: Reusable> Pool<T> {
    pub fn new(build: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Pool {
            free: Mutex::new(Vec::new()),
            build: Box::new(build),
            outstanding: AtomicIsize::new(0),
        }
    }

    pub fn acquire(&self) -> T {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        let popped = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let mut item = popped.unwrap_or_else(|| (self.build)());
        item.reset();
        item
    }

    pub fn release(&self, item: T) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
    }

    /// Containers currently acquired and not yet released. Used by tests to
    /// assert acquire/release balance.
    pub fn outstanding(&self) -> isize {
        self.outstanding.load(Ordering::Relaxed)
    }
}
