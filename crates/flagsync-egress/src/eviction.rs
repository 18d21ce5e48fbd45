// Copyright 2025-Present Split Software, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Flush-history monitor producing the eviction lambda.
//!
//! Lambda is the ratio of flush throughput to generation rate over a
//! sliding window of flush observations. Lambda ≥ 1 means eviction keeps
//! pace with generation; lambda < 1 means the storage backlog is growing.
//! It is an early-warning signal for dashboards, not an automatic throttle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

/// One flush observation.
#[derive(Debug, Clone, Copy)]
struct EvictionRecord {
    #[allow(dead_code)] // kept for dashboard dumps of the raw window
    timestamp: i64,
    flushed: usize,
    in_storage: i64,
}

struct Window {
    records: VecDeque<EvictionRecord>,
    lambda: f64,
}

/// Tracks flush statistics and exposes an advisory single-holder lock so a
/// user-driven flush and the periodic task don't drain the same resource
/// concurrently. The pipeline itself does not enforce the lock; callers
/// must honor it.
pub struct Monitor {
    window: RwLock<Window>,
    max_len: usize,
    held: AtomicBool,
}

impl Monitor {
    /// Builds a monitor whose window holds 100 observations per flushing
    /// thread.
    pub fn new(threads: usize) -> Self {
        Monitor {
            window: RwLock::new(Window {
                records: VecDeque::new(),
                lambda: 1.0,
            }),
            max_len: 100 * threads.max(1),
            held: AtomicBool::new(false),
        }
    }

    /// Records one flush: how many records were flushed and how many remain
    /// in storage, then recomputes lambda over the window.
    pub fn store_data_flushed(&self, timestamp: i64, count_flushed: usize, count_in_storage: i64) {
        let mut window = self.window.write().unwrap_or_else(PoisonError::into_inner);
        if window.records.len() >= self.max_len {
            window.records.pop_front();
        }
        window.records.push_back(EvictionRecord {
            timestamp,
            flushed: count_flushed,
            in_storage: count_in_storage,
        });
        window.lambda = calculate_lambda(&window.records);
    }

    /// Last computed lambda; 1 until the first observation arrives.
    pub fn lambda(&self) -> f64 {
        self.window
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lambda
    }

    /// Attempts to take the advisory lock. Never blocks.
    pub fn acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the advisory lock.
    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    /// Whether the advisory lock is currently held.
    pub fn busy(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// `lambda = totalFlushed / (lastStorage - firstStorage + totalFlushed)`.
///
/// A zero denominator (no observable generation delta) yields 1, so a cold
/// start never reads as unhealthy.
fn calculate_lambda(records: &VecDeque<EvictionRecord>) -> f64 {
    let total_flushed: i64 = records.iter().map(|r| r.flushed as i64).sum();
    let (first, last) = match (records.front(), records.back()) {
        (Some(first), Some(last)) => (first, last),
        _ => return 1.0,
    };
    let generated = (last.in_storage - first.in_storage + total_flushed) as f64;
    if generated == 0.0 {
        return 1.0;
    }
    total_flushed as f64 / generated
}
