// Copyright 2025-Present Split Software, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors surfaced by the pipelined sync task lifecycle.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The task was already started; a task cannot be started twice.
    #[error("task already started")]
    AlreadyStarted,

    /// The task is not running; returned by a second call to stop.
    #[error("task is not running")]
    NotRunning,

    /// The HTTP client used by the sinkers could not be built.
    #[error("error building http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Errors produced by the backing telemetry store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors produced by a pipeline worker during fetch/process/build.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("error fetching raw telemetry: {0}")]
    Storage(#[from] StorageError),

    #[error("error serializing bulk payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),

    #[error("invalid intake url: {0}")]
    InvalidUrl(String),

    #[error("output channel closed before all bulks were submitted")]
    SinkClosed,
}

/// Errors produced by the impression bulk listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("queue size must be at least 1")]
    InvalidQueueSize,

    #[error("queue is full, cannot add impression bulk")]
    QueueFull,

    #[error("listener is already running")]
    AlreadyRunning,

    #[error("listener is not running")]
    NotRunning,
}
