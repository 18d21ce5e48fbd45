// Copyright 2025-Present Split Software, Inc.
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use crate::error::StorageError;

/// Read side of the durable telemetry store the pipeline drains.
///
/// Records are removed from the store as part of the pop; there is no
/// replay on downstream failure. Implementations must be safe for
/// concurrent callers, although the pipeline's filler is a single task.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Pops up to `count` raw serialized records, returning them together
    /// with the number of records remaining in storage after the pop.
    async fn pop_n_raw(&self, count: usize) -> Result<(Vec<String>, i64), StorageError>;
}
