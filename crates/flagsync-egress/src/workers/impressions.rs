// Copyright 2025-Present Split Software, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Impressions flow: drains queued impressions, groups them by producer
//! identity and feature, and posts them to `/testImpressions/bulk`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::HeaderValue;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::dtos::{Impression, ImpressionQueueObject, KeyImpression, Metadata, TestImpressions};
use crate::error::WorkerError;
use crate::eviction::Monitor;
use crate::listener::{ImpressionBulkListener, ImpressionForListener, ImpressionsForListener};
use crate::pipeline::{Cleanup, Worker};
use crate::pool::Pool;
use crate::storage::TelemetryStore;
use crate::util::now_millis;
use crate::workers::{
    bulk_post, parse_endpoint, FEATURES_PER_BULK, IMPRESSIONS_MODE_HEADER,
    IMPRESSIONS_PER_FEATURE, MAX_BULK_SIZE, METADATAS_PER_BULK,
};

const DEFAULT_FETCH_SIZE: usize = 20000;

/// Per-impression gate applied before an impression is added to a bulk.
/// Implementations typically deduplicate repeated evaluations; returning
/// false suppresses the impression from the intake post (the listener
/// mirror is also skipped).
pub trait ImpressionsManager: Send + Sync {
    fn process_single(&self, impression: &Impression) -> bool;
}

/// Forwards every impression unchanged.
pub struct PassthroughManager;

impl ImpressionsManager for PassthroughManager {
    fn process_single(&self, _impression: &Impression) -> bool {
        true
    }
}

/// Impressions for one producer, ready to post.
pub struct ImpressionsBulk {
    pub metadata: Metadata,
    pub features: Vec<TestImpressions>,
    feature_index: HashMap<String, usize>,
    count: usize,
}

/// Pools for the containers churned on every process cycle.
pub(crate) struct ImpressionPools {
    key_impressions: Pool<Vec<KeyImpression>>,
    features: Pool<Vec<TestImpressions>>,
    feature_indexes: Pool<HashMap<String, usize>>,
    metadata_indexes: Pool<HashMap<Metadata, usize>>,
    groups: Pool<Vec<ImpressionsBulk>>,
}

impl ImpressionPools {
    fn new() -> Self {
        ImpressionPools {
            key_impressions: Pool::new(|| Vec::with_capacity(IMPRESSIONS_PER_FEATURE)),
            features: Pool::new(|| Vec::with_capacity(FEATURES_PER_BULK)),
            feature_indexes: Pool::new(|| HashMap::with_capacity(FEATURES_PER_BULK)),
            metadata_indexes: Pool::new(|| HashMap::with_capacity(METADATAS_PER_BULK)),
            groups: Pool::new(|| Vec::with_capacity(METADATAS_PER_BULK)),
        }
    }

    /// Returns a posted (or dropped) bulk's containers to their pools.
    pub(crate) fn recycle(&self, mut bulk: ImpressionsBulk) {
        for feature in bulk.features.drain(..) {
            self.key_impressions.release(feature.key_impressions);
        }
        self.features.release(bulk.features);
        self.feature_indexes.release(bulk.feature_index);
    }

    #[cfg(test)]
    fn outstanding(&self) -> isize {
        self.key_impressions.outstanding()
            + self.features.outstanding()
            + self.feature_indexes.outstanding()
            + self.metadata_indexes.outstanding()
            + self.groups.outstanding()
    }
}

/// Groups impressions into per-producer bulks, starting a new bulk for a
/// producer once the current one reaches `bulk_size`.
struct Accumulator<'a> {
    pools: &'a ImpressionPools,
    groups: Vec<ImpressionsBulk>,
    metadata_index: HashMap<Metadata, usize>,
    bulk_size: usize,
}

impl<'a> Accumulator<'a> {
    fn new(pools: &'a ImpressionPools, bulk_size: usize) -> Self {
        Accumulator {
            groups: pools.groups.acquire(),
            metadata_index: pools.metadata_indexes.acquire(),
            pools,
            bulk_size,
        }
    }

    fn add(&mut self, metadata: Metadata, impression: Impression) {
        let group_idx = match self.metadata_index.get(&metadata) {
            Some(&idx) if self.groups[idx].count < self.bulk_size => idx,
            _ => {
                self.groups.push(ImpressionsBulk {
                    metadata: metadata.clone(),
                    features: self.pools.features.acquire(),
                    feature_index: self.pools.feature_indexes.acquire(),
                    count: 0,
                });
                let idx = self.groups.len() - 1;
                self.metadata_index.insert(metadata, idx);
                idx
            }
        };

        let group = &mut self.groups[group_idx];
        let feature_idx = match group.feature_index.get(&impression.feature_name) {
            Some(&idx) => idx,
            None => {
                group.features.push(TestImpressions {
                    test_name: impression.feature_name.clone(),
                    key_impressions: self.pools.key_impressions.acquire(),
                });
                let idx = group.features.len() - 1;
                group
                    .feature_index
                    .insert(impression.feature_name.clone(), idx);
                idx
            }
        };
        group.features[feature_idx]
            .key_impressions
            .push(impression.into());
        group.count += 1;
    }

    /// Hands the completed bulks to the caller, releasing the metadata
    /// index. The returned vector is pool-owned; the caller drains it and
    /// releases it once empty. Per-bulk containers travel with each bulk
    /// and are recycled after the post.
    fn finish(mut self) -> Vec<ImpressionsBulk> {
        self.pools
            .metadata_indexes
            .release(std::mem::take(&mut self.metadata_index));
        std::mem::take(&mut self.groups)
    }
}

/// [`Worker`] implementation for the impressions flow.
pub struct ImpressionsWorker {
    store: Arc<dyn TelemetryStore>,
    manager: Arc<dyn ImpressionsManager>,
    listener: Option<Arc<dyn ImpressionBulkListener>>,
    monitor: Arc<Monitor>,
    pools: Arc<ImpressionPools>,
    url: reqwest::Url,
    api_key: String,
    fetch_size: usize,
    bulk_size: usize,
}

impl ImpressionsWorker {
    pub fn new(
        intake_base_url: &str,
        api_key: String,
        store: Arc<dyn TelemetryStore>,
        manager: Arc<dyn ImpressionsManager>,
        monitor: Arc<Monitor>,
        listener: Option<Arc<dyn ImpressionBulkListener>>,
    ) -> Result<Self, WorkerError> {
        Ok(ImpressionsWorker {
            store,
            manager,
            listener,
            monitor,
            pools: Arc::new(ImpressionPools::new()),
            url: parse_endpoint(intake_base_url, "/testImpressions/bulk")?,
            api_key,
            fetch_size: DEFAULT_FETCH_SIZE,
            bulk_size: MAX_BULK_SIZE,
        })
    }

    /// Overrides how many raw records each fetch pops from the store.
    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size.max(1);
        self
    }

    #[cfg(test)]
    fn with_bulk_size(mut self, bulk_size: usize) -> Self {
        self.bulk_size = bulk_size;
        self
    }

    fn mirror_to_listener(&self, groups: &[ImpressionsBulk]) {
        let Some(listener) = &self.listener else {
            return;
        };
        for group in groups {
            let payload = group
                .features
                .iter()
                .map(|feature| ImpressionsForListener {
                    test_name: feature.test_name.clone(),
                    key_impressions: feature
                        .key_impressions
                        .iter()
                        .map(|imp| ImpressionForListener {
                            key_name: imp.key_name.clone(),
                            treatment: imp.treatment.clone(),
                            time: imp.time,
                            change_number: imp.change_number,
                            label: imp.label.clone(),
                            bucketing_key: imp.bucketing_key.clone(),
                            pt: imp.pt,
                            properties: imp.properties.clone(),
                        })
                        .collect(),
                })
                .collect();
            if let Err(e) = listener.submit(payload, &group.metadata) {
                warn!(error = %e, "could not forward impressions to listener");
            }
        }
    }

    fn try_build(&self, bulk: &ImpressionsBulk) -> Result<reqwest::Request, WorkerError> {
        let body = serde_json::to_vec(&bulk.features)?;
        let mut req = bulk_post(&self.url, &self.api_key, &bulk.metadata)?;
        req.headers_mut()
            .insert(IMPRESSIONS_MODE_HEADER, HeaderValue::from_static("optimized"));
        *req.body_mut() = Some(body.into());
        Ok(req)
    }
}

#[async_trait]
impl Worker for ImpressionsWorker {
    type Batch = ImpressionsBulk;

    async fn fetch(&self) -> Result<Vec<String>, WorkerError> {
        let (raws, remaining) = self.store.pop_n_raw(self.fetch_size).await?;
        if !raws.is_empty() {
            self.monitor
                .store_data_flushed(now_millis(), raws.len(), remaining);
        }
        Ok(raws)
    }

    async fn process(
        &self,
        raws: &[String],
        sink: &mpsc::Sender<ImpressionsBulk>,
    ) -> Result<(), WorkerError> {
        let mut accumulator = Accumulator::new(&self.pools, self.bulk_size);
        for raw in raws {
            match serde_json::from_str::<ImpressionQueueObject>(raw) {
                Ok(queued) => {
                    if self.manager.process_single(&queued.impression) {
                        accumulator.add(queued.metadata, queued.impression);
                    } else {
                        debug!(feature = %queued.impression.feature_name, "impression deduplicated");
                    }
                }
                Err(e) => warn!(error = %e, "skipping malformed impression record"),
            }
        }

        let mut groups = accumulator.finish();
        self.mirror_to_listener(&groups);
        let mut result = Ok(());
        let mut pending = groups.drain(..);
        while let Some(group) = pending.next() {
            if let Err(mpsc::error::SendError(group)) = sink.send(group).await {
                self.pools.recycle(group);
                for leftover in pending.by_ref() {
                    self.pools.recycle(leftover);
                }
                result = Err(WorkerError::SinkClosed);
                break;
            }
        }
        drop(pending);
        self.pools.groups.release(groups);
        result
    }

    fn build_request(
        &self,
        batch: ImpressionsBulk,
    ) -> (Result<reqwest::Request, WorkerError>, Cleanup) {
        let built = self.try_build(&batch);
        let pools = Arc::clone(&self.pools);
        (built, Box::new(move || pools.recycle(batch)))
    }
}
