// Copyright 2025-Present Split Software, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Unique-keys flow: drains per-feature key sets recorded by SDKs running
//! in NONE impressions mode and posts the merged sets to `/keys/ss`.
//!
//! Unlike the other flows these records carry no producer identity; the
//! agent posts them under its own metadata, and duplicate keys for a
//! feature are merged within each processed batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::dtos::{Metadata, UniqueKeysDto, UniquesPayload};
use crate::error::WorkerError;
use crate::pipeline::{Cleanup, Worker};
use crate::storage::TelemetryStore;
use crate::workers::{bulk_post, parse_endpoint};

const DEFAULT_FETCH_SIZE: usize = 10000;

/// [`Worker`] implementation for the unique-keys flow.
pub struct UniqueKeysWorker {
    store: Arc<dyn TelemetryStore>,
    url: reqwest::Url,
    api_key: String,
    metadata: Metadata,
    fetch_size: usize,
}

impl UniqueKeysWorker {
    /// `metadata` identifies this agent, not the originating SDKs.
    pub fn new(
        intake_base_url: &str,
        api_key: String,
        metadata: Metadata,
        store: Arc<dyn TelemetryStore>,
    ) -> Result<Self, WorkerError> {
        Ok(UniqueKeysWorker {
            store,
            url: parse_endpoint(intake_base_url, "/keys/ss")?,
            api_key,
            metadata,
            fetch_size: DEFAULT_FETCH_SIZE,
        })
    }

    /// Overrides how many raw records each fetch pops from the store.
    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size.max(1);
        self
    }
}

/// Records may be stored one per entry or as a serialized batch of entries.
fn parse_record(raw: &str) -> Result<Vec<UniqueKeysDto>, serde_json::Error> {
    match serde_json::from_str::<UniqueKeysDto>(raw) {
        Ok(single) => Ok(vec![single]),
        Err(_) => serde_json::from_str::<Vec<UniqueKeysDto>>(raw),
    }
}

#[async_trait]
impl Worker for UniqueKeysWorker {
    type Batch = UniquesPayload;

    async fn fetch(&self) -> Result<Vec<String>, WorkerError> {
        let (raws, _remaining) = self.store.pop_n_raw(self.fetch_size).await?;
        Ok(raws)
    }

    async fn process(
        &self,
        raws: &[String],
        sink: &mpsc::Sender<UniquesPayload>,
    ) -> Result<(), WorkerError> {
        let mut merged: HashMap<String, HashSet<String>> = HashMap::new();
        for raw in raws {
            match parse_record(raw) {
                Ok(records) => {
                    for record in records {
                        merged
                            .entry(record.feature)
                            .or_default()
                            .extend(record.keys);
                    }
                }
                Err(e) => warn!(error = %e, "skipping malformed unique keys record"),
            }
        }
        if merged.is_empty() {
            return Ok(());
        }

        let payload = UniquesPayload {
            keys: merged
                .into_iter()
                .map(|(feature, keys)| UniqueKeysDto {
                    feature,
                    keys: keys.into_iter().collect(),
                })
                .collect(),
        };
        sink.send(payload).await.map_err(|_| WorkerError::SinkClosed)
    }

    fn build_request(
        &self,
        batch: UniquesPayload,
    ) -> (Result<reqwest::Request, WorkerError>, Cleanup) {
        let built = serde_json::to_vec(&batch)
            .map_err(WorkerError::from)
            .and_then(|body| {
                let mut req = bulk_post(&self.url, &self.api_key, &self.metadata)?;
                *req.body_mut() = Some(body.into());
                Ok(req)
            });
        (built, Box::new(|| {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct QueueStore {
        raws: Mutex<VecDeque<String>>,
    }

    #[async_trait]
    impl TelemetryStore for QueueStore {
        async fn pop_n_raw(&self, count: usize) -> Result<(Vec<String>, i64), StorageError> {
            let mut raws = self.raws.lock().unwrap();
            let taken: Vec<String> = (0..count).filter_map(|_| raws.pop_front()).collect();
            Ok((taken, raws.len() as i64))
        }
    }

    fn worker_for(raws: Vec<String>) -> UniqueKeysWorker {
        UniqueKeysWorker::new(
            "http://localhost:1",
            "api-key".to_string(),
            Metadata {
                sdk_version: "agent-1.0.0".to_string(),
                machine_ip: "127.0.0.1".to_string(),
                machine_name: "agent-host".to_string(),
            },
            Arc::new(QueueStore {
                raws: Mutex::new(raws.into()),
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_merges_keys_per_feature() {
        let worker = worker_for(Vec::new());
        let raws = vec![
            r#"{"f":"feat_a","ks":["k1","k2"]}"#.to_string(),
            r#"{"f":"feat_a","ks":["k2","k3"]}"#.to_string(),
            r#"{"f":"feat_b","ks":["k1"]}"#.to_string(),
        ];
        let (tx, mut rx) = mpsc::channel(4);
        worker.process(&raws, &tx).await.unwrap();
        drop(tx);

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload.keys.len(), 2);
        let feat_a = payload.keys.iter().find(|d| d.feature == "feat_a").unwrap();
        let mut keys = feat_a.keys.clone();
        keys.sort();
        assert_eq!(keys, vec!["k1", "k2", "k3"]);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_accepts_batched_records() {
        let worker = worker_for(Vec::new());
        let raws = vec![
            r#"[{"f":"feat_a","ks":["k1"]},{"f":"feat_b","ks":["k2"]}]"#.to_string(),
        ];
        let (tx, mut rx) = mpsc::channel(4);
        worker.process(&raws, &tx).await.unwrap();
        drop(tx);

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload.keys.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_emits_nothing() {
        let worker = worker_for(Vec::new());
        let raws = vec!["not json at all".to_string()];
        let (tx, mut rx) = mpsc::channel(4);
        worker.process(&raws, &tx).await.unwrap();
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_build_request_uses_agent_metadata() {
        let worker = worker_for(Vec::new());
        let payload = UniquesPayload {
            keys: vec![UniqueKeysDto {
                feature: "feat_a".to_string(),
                keys: vec!["k1".to_string()],
            }],
        };

        let (built, cleanup) = worker.build_request(payload);
        let req = built.unwrap();
        assert!(req.url().path().ends_with("/keys/ss"));
        assert_eq!(
            req.headers()
                .get(crate::workers::MACHINE_NAME_HEADER)
                .unwrap(),
            "agent-host"
        );
        let body = req.body().unwrap().as_bytes().unwrap();
        let parsed: UniquesPayload = serde_json::from_slice(body).unwrap();
        assert_eq!(parsed.keys[0].feature, "feat_a");
        cleanup();
    }
}
