// Copyright 2025-Present Split Software, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::thread::available_parallelism;
use std::time::Duration;

const DEFAULT_PROCESS_BATCH_SIZE: usize = 2000;
const DEFAULT_POST_CONCURRENCY: usize = 2000;
const DEFAULT_MAX_ACCUM_WAIT: Duration = Duration::from_secs(5);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(3);

/// Options for a pipelined sync task.
///
/// Zero values are replaced with the documented defaults when the task is
/// constructed, so partial configs built with struct-update syntax behave
/// like the fully defaulted one.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Task name used in log lines.
    pub name: String,
    /// Number of processor tasks.
    pub process_concurrency: usize,
    /// Number of raw records accumulated before a process call is forced;
    /// also sizes the raw-batch input channel.
    pub process_batch_size: usize,
    /// Number of sinker tasks; also sizes the HTTP connection pool.
    pub post_concurrency: usize,
    /// Longest a processor waits for a full batch before processing what it has.
    pub max_accum_wait: Duration,
    /// Per-request HTTP timeout for bulk posts.
    pub http_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            name: "pipeline".to_string(),
            process_concurrency: default_process_concurrency(),
            process_batch_size: DEFAULT_PROCESS_BATCH_SIZE,
            post_concurrency: DEFAULT_POST_CONCURRENCY,
            max_accum_wait: DEFAULT_MAX_ACCUM_WAIT,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

impl PipelineConfig {
    pub(crate) fn normalize(&mut self) {
        if self.process_concurrency == 0 {
            self.process_concurrency = default_process_concurrency();
        }
        if self.process_batch_size == 0 {
            self.process_batch_size = DEFAULT_PROCESS_BATCH_SIZE;
        }
        if self.post_concurrency == 0 {
            self.post_concurrency = DEFAULT_POST_CONCURRENCY;
        }
        if self.max_accum_wait.is_zero() {
            self.max_accum_wait = DEFAULT_MAX_ACCUM_WAIT;
        }
        if self.http_timeout.is_zero() {
            self.http_timeout = DEFAULT_HTTP_TIMEOUT;
        }
    }
}

fn default_process_concurrency() -> usize {
    available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}
