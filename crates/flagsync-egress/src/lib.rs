// Copyright 2025-Present Split Software, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Data-egress pipeline for buffered feature-flag telemetry.
//!
//! SDK instances buffer usage telemetry (impressions, events, unique keys)
//! in a shared store; this crate continuously drains that store, groups the
//! records by the SDK instance that produced them, and forwards them to the
//! provider's ingestion API with bounded concurrency, fixed retries and
//! explicit load shedding.
//!
//! The engine is [`pipeline::PipelinedSyncTask`], a three-stage concurrent
//! pipeline (filler → processors → sinkers) parameterized by a
//! [`pipeline::Worker`] implementation. Concrete workers live in
//! [`workers`]; flush health is tracked by the [`eviction::Monitor`].

pub mod config;
pub mod dtos;
pub mod error;
pub mod eviction;
pub mod listener;
pub mod pipeline;
pub mod pool;
pub mod storage;
pub mod workers;

mod util;

pub use config::PipelineConfig;
pub use error::{ListenerError, PipelineError, StorageError, WorkerError};
pub use pipeline::{PipelinedSyncTask, Worker};

/// Number of POST attempts per bulk before it is dropped.
pub(crate) const POST_ATTEMPTS: u32 = 3;
