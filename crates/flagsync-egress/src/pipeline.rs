// Copyright 2025-Present Split Software, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Generic fetch → process → post pipeline.
//!
//! A [`PipelinedSyncTask`] runs one filler task, N processor tasks and M
//! sinker tasks connected by two bounded channels. Decoupling the stages
//! lets each one be scaled independently to maximize throughput:
//!
//! ```text
//!   store ──fetch──> [filler] ──raw batches──> [processor × N]
//!                                   │
//!                                   └──bulks──> [sinker × M] ──POST──> intake
//! ```
//!
//! Stage semantics:
//! - the filler never blocks on a full input channel; a fetched batch that
//!   doesn't fit is dropped with a warning (load shedding, favoring store
//!   liveness over delivery),
//! - processors batch by size and time, whichever comes first,
//! - sinkers retry each bulk a fixed number of times and then drop it.
//!
//! Shutdown propagates causally through channel closure: stopping the task
//! makes the filler drop the input sender, processors drain and drop their
//! output senders, and sinkers exit once the pre-submit channel is empty.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, WorkerError};
use crate::pool::Pool;
use crate::POST_ATTEMPTS;

/// Deferred release of a bulk's pooled resources. Runs exactly once per
/// bulk, after the post attempt sequence, success or not.
pub type Cleanup = Box<dyn FnOnce() + Send + 'static>;

/// The three operations a data flow must implement to run on the pipeline.
///
/// `Batch` is the bulk value flowing from `process` to `build_request`;
/// each worker declares its own concrete shape instead of funneling
/// type-erased values through the channel.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    type Batch: Send + 'static;

    /// Pulls raw serialized records from the backing store. Ownership of
    /// the records transfers to the pipeline; they are consumed during
    /// `process`.
    async fn fetch(&self) -> Result<Vec<String>, WorkerError>;

    /// Deserializes, filters and groups raw records, pushing each completed
    /// bulk into `sink`. Sends block when the pre-submit channel is full;
    /// that is the pipeline's backpressure path.
    async fn process(
        &self,
        raws: &[String],
        sink: &mpsc::Sender<Self::Batch>,
    ) -> Result<(), WorkerError>;

    /// Builds the HTTP request for one bulk. The cleanup closure is
    /// returned even when the build fails so pooled containers are always
    /// recovered.
    fn build_request(&self, batch: Self::Batch) -> (Result<reqwest::Request, WorkerError>, Cleanup);
}

/// A running instance of the three-stage pipeline for one worker.
pub struct PipelinedSyncTask<W: Worker> {
    name: String,
    worker: Arc<W>,
    client: reqwest::Client,
    raw_buffers: Arc<Pool<Vec<String>>>,
    config: PipelineConfig,

    running: Arc<AtomicBool>,
    shutdown: CancellationToken,

    // channel endpoints are consumed on start; a task runs at most once
    input_tx: Option<mpsc::Sender<Vec<String>>>,
    input_rx: Option<mpsc::Receiver<Vec<String>>>,
    submit_tx: Option<mpsc::Sender<W::Batch>>,
    submit_rx: Option<mpsc::Receiver<W::Batch>>,
    handles: Vec<JoinHandle<()>>,
}

impl<W: Worker> PipelinedSyncTask<W> {
    pub fn new(mut config: PipelineConfig, worker: Arc<W>) -> Result<Self, PipelineError> {
        config.normalize();
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .pool_max_idle_per_host(config.post_concurrency)
            .build()?;

        let (input_tx, input_rx) = mpsc::channel(config.process_batch_size);
        let (submit_tx, submit_rx) = mpsc::channel(config.post_concurrency * 4);
        let batch_size = config.process_batch_size;

        Ok(PipelinedSyncTask {
            name: config.name.clone(),
            worker,
            client,
            raw_buffers: Arc::new(Pool::new(move || Vec::with_capacity(batch_size))),
            config,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            input_tx: Some(input_tx),
            input_rx: Some(input_rx),
            submit_tx: Some(submit_tx),
            submit_rx: Some(submit_rx),
            handles: Vec::new(),
        })
    }

    /// Spawns the filler, processor and sinker tasks.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyStarted);
        }
        let (input_tx, input_rx, submit_tx, submit_rx) = match (
            self.input_tx.take(),
            self.input_rx.take(),
            self.submit_tx.take(),
            self.submit_rx.take(),
        ) {
            (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
            _ => {
                // channels already consumed by a previous run
                self.running.store(false, Ordering::SeqCst);
                return Err(PipelineError::AlreadyStarted);
            }
        };

        let input_rx = Arc::new(Mutex::new(input_rx));
        let submit_rx = Arc::new(Mutex::new(submit_rx));

        for _ in 0..self.config.post_concurrency {
            self.handles.push(tokio::spawn(sinker(
                self.name.clone(),
                Arc::clone(&self.worker),
                self.client.clone(),
                Arc::clone(&submit_rx),
            )));
        }

        for _ in 0..self.config.process_concurrency {
            self.handles.push(tokio::spawn(processor(
                self.name.clone(),
                Arc::clone(&self.worker),
                Arc::clone(&input_rx),
                submit_tx.clone(),
                Arc::clone(&self.raw_buffers),
                self.config.process_batch_size,
                self.config.max_accum_wait,
            )));
        }
        // the processors hold the only senders now; the pre-submit channel
        // closes when the last of them exits
        drop(submit_tx);

        self.handles.push(tokio::spawn(filler(
            self.name.clone(),
            Arc::clone(&self.worker),
            input_tx,
            Arc::clone(&self.running),
            self.shutdown.clone(),
        )));
        Ok(())
    }

    /// Signals shutdown and, when `blocking`, awaits the drain of all
    /// stages: filler first, then processors, then sinkers, each driven by
    /// the closure of the channel upstream of it.
    pub async fn stop(&mut self, blocking: bool) -> Result<(), PipelineError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(PipelineError::NotRunning);
        }
        self.shutdown.cancel();
        if blocking {
            for handle in self.handles.drain(..) {
                let _ = handle.await;
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn filler<W: Worker>(
    name: String,
    worker: Arc<W>,
    input_tx: mpsc::Sender<Vec<String>>,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    debug!(task = %name, "starting filler");
    while running.load(Ordering::SeqCst) {
        let raw = match worker.fetch().await {
            Ok(raw) => raw,
            Err(e) => {
                error!(task = %name, error = %e, "fetch returned error");
                Vec::new()
            }
        };

        if raw.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                _ = shutdown.cancelled() => break,
            }
        }

        let count = raw.len();
        match input_tx.try_send(raw) {
            Ok(()) => debug!(task = %name, count, "pushed items into the processing buffer"),
            Err(TrySendError::Full(_)) => {
                warn!(task = %name, count, "dropping fetched bulk, processing buffer is full")
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
    debug!(task = %name, "filler exiting");
    // input_tx drops here, closing the channel so processors drain and exit
}

async fn processor<W: Worker>(
    name: String,
    worker: Arc<W>,
    input_rx: Arc<Mutex<mpsc::Receiver<Vec<String>>>>,
    sink: mpsc::Sender<W::Batch>,
    buffers: Arc<Pool<Vec<String>>>,
    batch_size: usize,
    max_accum_wait: Duration,
) {
    debug!(task = %name, "starting processor");
    let mut open = true;
    while open {
        let mut batch = buffers.acquire();

        // accumulate until the batch is full, the timer fires with data in
        // hand, or the input channel closes
        loop {
            let timer = tokio::time::sleep(max_accum_wait);
            tokio::pin!(timer);
            tokio::select! {
                maybe = async { input_rx.lock().await.recv().await } => match maybe {
                    Some(raws) => {
                        batch.extend(raws);
                        if batch.len() >= batch_size {
                            break;
                        }
                    }
                    None => {
                        open = false;
                        break;
                    }
                },
                _ = &mut timer => {
                    if !batch.is_empty() {
                        break;
                    }
                }
            }
        }

        if !batch.is_empty() {
            let count = batch.len();
            debug!(task = %name, count, "processing raw items");
            if let Err(e) = worker.process(&batch, &sink).await {
                error!(task = %name, count, error = %e, "failed to process items");
            }
        }
        buffers.release(batch);
    }
    debug!(task = %name, "processor exiting");
    // sink drops here; the last processor out closes the pre-submit channel
}

async fn sinker<W: Worker>(
    name: String,
    worker: Arc<W>,
    client: reqwest::Client,
    submit_rx: Arc<Mutex<mpsc::Receiver<W::Batch>>>,
) {
    debug!(task = %name, "starting sinker");
    loop {
        let bulk = { submit_rx.lock().await.recv().await };
        let Some(bulk) = bulk else {
            debug!(task = %name, "sinker exiting");
            return;
        };

        let (built, cleanup) = worker.build_request(bulk);
        match built {
            Err(e) => error!(task = %name, error = %e, "error building request, dropping bulk"),
            Ok(req) => post_with_retries(&name, &client, req).await,
        }
        cleanup();
    }
}

/// Fixed-attempt retry loop; transport errors and non-2xx statuses are
/// treated identically as retryable. The bulk is dropped once attempts are
/// exhausted.
async fn post_with_retries(name: &str, client: &reqwest::Client, req: reqwest::Request) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = match req.try_clone() {
            Some(clone) => match client.execute(clone).await {
                Ok(resp) if resp.status().is_success() => Ok(()),
                Ok(resp) => Err(format!("bad status code when sinking data: {}", resp.status())),
                Err(e) => Err(format!("error posting: {e}")),
            },
            None => Err("request body cannot be cloned for retry".to_string()),
        };

        match outcome {
            Ok(()) => {
                debug!(task = %name, "bulk posted successfully");
                return;
            }
            Err(e) if attempt >= POST_ATTEMPTS => {
                error!(task = %name, attempts = attempt, error = %e, "dropping bulk after exhausting retries");
                return;
            }
            Err(e) => debug!(task = %name, attempt, error = %e, "post attempt failed, retrying"),
        }
    }
}
