// Copyright 2025-Present Split Software, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Events flow: drains queued track events, groups them by producer
//! identity, and posts them to `/events/bulk`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::dtos::{Event, Metadata, QueueStoredEvent};
use crate::error::WorkerError;
use crate::eviction::Monitor;
use crate::pipeline::{Cleanup, Worker};
use crate::pool::Pool;
use crate::storage::TelemetryStore;
use crate::util::now_millis;
use crate::workers::{bulk_post, parse_endpoint, MAX_BULK_SIZE, METADATAS_PER_BULK};

const DEFAULT_FETCH_SIZE: usize = 10000;
const EVENTS_PER_BULK: usize = 100;

/// Events for one producer, ready to post.
pub struct EventsBulk {
    pub metadata: Metadata,
    pub events: Vec<Event>,
}

pub(crate) struct EventPools {
    events: Pool<Vec<Event>>,
    metadata_indexes: Pool<HashMap<Metadata, usize>>,
    groups: Pool<Vec<EventsBulk>>,
}

impl EventPools {
    fn new() -> Self {
        EventPools {
            events: Pool::new(|| Vec::with_capacity(EVENTS_PER_BULK)),
            metadata_indexes: Pool::new(|| HashMap::with_capacity(METADATAS_PER_BULK)),
            groups: Pool::new(|| Vec::with_capacity(METADATAS_PER_BULK)),
        }
    }

    pub(crate) fn recycle(&self, bulk: EventsBulk) {
        self.events.release(bulk.events);
    }

    #[cfg(test)]
    fn outstanding(&self) -> isize {
        self.events.outstanding()
            + self.metadata_indexes.outstanding()
            + self.groups.outstanding()
    }
}

/// [`Worker`] implementation for the events flow.
pub struct EventsWorker {
    store: Arc<dyn TelemetryStore>,
    monitor: Arc<Monitor>,
    pools: Arc<EventPools>,
    url: reqwest::Url,
    api_key: String,
    fetch_size: usize,
    bulk_size: usize,
}

impl EventsWorker {
    pub fn new(
        intake_base_url: &str,
        api_key: String,
        store: Arc<dyn TelemetryStore>,
        monitor: Arc<Monitor>,
    ) -> Result<Self, WorkerError> {
        Ok(EventsWorker {
            store,
            monitor,
            pools: Arc::new(EventPools::new()),
            url: parse_endpoint(intake_base_url, "/events/bulk")?,
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

    fn try_build(&self, bulk: &EventsBulk) -> Result<reqwest::Request, WorkerError> {
        let body = serde_json::to_vec(&bulk.events)?;
        let mut req = bulk_post(&self.url, &self.api_key, &bulk.metadata)?;
        *req.body_mut() = Some(body.into());
        Ok(req)
    }
}

#[async_trait]
impl Worker for EventsWorker {
    type Batch = EventsBulk;

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
        sink: &mpsc::Sender<EventsBulk>,
    ) -> Result<(), WorkerError> {
        let mut groups = self.pools.groups.acquire();
        let mut metadata_index = self.pools.metadata_indexes.acquire();

        for raw in raws {
            let queued = match serde_json::from_str::<QueueStoredEvent>(raw) {
                Ok(queued) => queued,
                Err(e) => {
                    warn!(error = %e, "skipping malformed event record");
                    continue;
                }
            };
            let group_idx = match metadata_index.get(&queued.metadata) {
                Some(&idx) if groups[idx].events.len() < self.bulk_size => idx,
                _ => {
                    groups.push(EventsBulk {
                        metadata: queued.metadata.clone(),
                        events: self.pools.events.acquire(),
                    });
                    let idx = groups.len() - 1;
                    metadata_index.insert(queued.metadata, idx);
                    idx
                }
            };
            groups[group_idx].events.push(queued.event);
        }
        self.pools.metadata_indexes.release(metadata_index);

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

    fn build_request(&self, batch: EventsBulk) -> (Result<reqwest::Request, WorkerError>, Cleanup) {
        let built = self.try_build(&batch);
        let pools = Arc::clone(&self.pools);
        (built, Box::new(move || pools.recycle(batch)))
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

    fn make_serialized_events(metadatas: usize, events: usize) -> Vec<String> {
        let mut raws = Vec::with_capacity(metadatas * events);
        for m in 0..metadatas {
            for e in 0..events {
                let queued = QueueStoredEvent {
                    metadata: Metadata {
                        sdk_version: "php-7.2".to_string(),
                        machine_ip: format!("10.0.0.{m}"),
                        machine_name: format!("host_{m}"),
                    },
                    event: Event {
                        key: format!("user_{e}"),
                        traffic_type_name: "user".to_string(),
                        event_type_id: "page_view".to_string(),
                        value: Some(e as f64),
                        timestamp: 1000 + e as i64,
                        properties: None,
                    },
                };
                raws.push(serde_json::to_string(&queued).unwrap());
            }
        }
        raws
    }

    fn worker_for(raws: Vec<String>) -> EventsWorker {
        EventsWorker::new(
            "http://localhost:1",
            "api-key".to_string(),
            Arc::new(QueueStore {
                raws: Mutex::new(raws.into()),
            }),
            Arc::new(Monitor::new(1)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_groups_by_metadata() {
        let worker = worker_for(Vec::new());
        let raws = make_serialized_events(3, 15);
        let (tx, mut rx) = mpsc::channel(8);

        worker.process(&raws, &tx).await.unwrap();
        drop(tx);

        let mut bulks = Vec::new();
        while let Some(bulk) = rx.recv().await {
            bulks.push(bulk);
        }
        assert_eq!(bulks.len(), 3);
        for bulk in bulks {
            assert_eq!(bulk.events.len(), 15);
            worker.pools.recycle(bulk);
        }
        assert_eq!(worker.pools.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_splits_bulks_at_size_limit() {
        let worker = worker_for(Vec::new()).with_bulk_size(10);
        let raws = make_serialized_events(1, 25);
        let (tx, mut rx) = mpsc::channel(8);

        worker.process(&raws, &tx).await.unwrap();
        drop(tx);

        let mut sizes = Vec::new();
        while let Some(bulk) = rx.recv().await {
            sizes.push(bulk.events.len());
            worker.pools.recycle(bulk);
        }
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(worker.pools.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_malformed_records_are_skipped() {
        let worker = worker_for(Vec::new());
        let mut raws = make_serialized_events(1, 2);
        raws.push("{broken".to_string());

        let (tx, mut rx) = mpsc::channel(4);
        worker.process(&raws, &tx).await.unwrap();
        drop(tx);

        let bulk = rx.recv().await.unwrap();
        assert_eq!(bulk.events.len(), 2);
        worker.pools.recycle(bulk);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_build_request_shape() {
        let worker = worker_for(Vec::new());
        let bulk = EventsBulk {
            metadata: Metadata {
                sdk_version: "php-7.2".to_string(),
                machine_ip: "10.0.0.1".to_string(),
                machine_name: "host_0".to_string(),
            },
            events: vec![Event {
                key: "user_1".to_string(),
                traffic_type_name: "user".to_string(),
                event_type_id: "checkout".to_string(),
                value: Some(9.99),
                timestamp: 1234,
                properties: None,
            }],
        };

        let (built, cleanup) = worker.build_request(bulk);
        let req = built.unwrap();
        assert!(req.url().path().ends_with("/events/bulk"));
        let body = req.body().unwrap().as_bytes().unwrap();
        let parsed: Vec<Event> = serde_json::from_slice(body).unwrap();
        assert_eq!(parsed[0].event_type_id, "checkout");
        cleanup();
    }

    #[tokio::test]
    async fn test_fetch_drains_store() {
        let worker = worker_for(make_serialized_events(1, 30));
        let fetched = worker.fetch().await.unwrap();
        assert_eq!(fetched.len(), 30);
        let empty = worker.fetch().await.unwrap();
        assert!(empty.is_empty());
    }
}
