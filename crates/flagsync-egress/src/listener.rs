// Copyright 2025-Present Split Software, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Optional secondary destination for logged impressions.
//!
//! Deployments can mirror every impression the pipeline forwards to a
//! user-supplied HTTP endpoint. Delivery is best-effort: submissions are
//! queued on a bounded channel and dropped with an error when the queue is
//! full, so the listener can never stall the pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::dtos::Metadata;
use crate::error::ListenerError;

/// One impression in the listener's wire shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpressionForListener {
    pub key_name: String,
    pub treatment: String,
    pub time: i64,
    pub change_number: i64,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucketing_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pt: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<String>,
}

/// Impressions for one feature in the listener's wire shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpressionsForListener {
    pub test_name: String,
    pub key_impressions: Vec<ImpressionForListener>,
}

/// Consumer of mirrored impression bulks. Errors are logged by the caller,
/// never propagated into the pipeline.
pub trait ImpressionBulkListener: Send + Sync {
    fn submit(
        &self,
        impressions: Vec<ImpressionsForListener>,
        metadata: &Metadata,
    ) -> Result<(), ListenerError>;
}

#[derive(Debug, Serialize)]
struct ListenerPostBody {
    impressions: Vec<ImpressionsForListener>,
    #[serde(rename = "sdkVersion")]
    sdk_version: String,
    #[serde(rename = "machineIP")]
    machine_ip: String,
    #[serde(rename = "machineName")]
    machine_name: String,
}

/// HTTP implementation of [`ImpressionBulkListener`] with its own bounded
/// queue and background poster task.
pub struct HttpImpressionBulkListener {
    endpoint: String,
    client: reqwest::Client,
    tx: mpsc::Sender<ListenerPostBody>,
    rx: Mutex<Option<mpsc::Receiver<ListenerPostBody>>>,
    running: AtomicBool,
    shutdown: CancellationToken,
    poster: Mutex<Option<JoinHandle<()>>>,
}

impl HttpImpressionBulkListener {
    pub fn new(
        endpoint: String,
        queue_size: usize,
        client: Option<reqwest::Client>,
    ) -> Result<Self, ListenerError> {
        if queue_size < 1 {
            return Err(ListenerError::InvalidQueueSize);
        }
        let (tx, rx) = mpsc::channel(queue_size);
        Ok(HttpImpressionBulkListener {
            endpoint,
            client: client.unwrap_or_default(),
            tx,
            rx: Mutex::new(Some(rx)),
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            poster: Mutex::new(None),
        })
    }

    /// Spawns the poster task draining the queue.
    pub fn start(&self) -> Result<(), ListenerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ListenerError::AlreadyRunning);
        }
        let mut rx = match self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(rx) => rx,
            None => return Err(ListenerError::AlreadyRunning),
        };

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                let body = tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(body) => body,
                        None => return,
                    },
                    _ = shutdown.cancelled() => return,
                };
                match client.post(&endpoint).json(&body).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        debug!(endpoint = %endpoint, "impression bulk forwarded to listener");
                    }
                    Ok(resp) => {
                        error!(endpoint = %endpoint, status = %resp.status(), "listener endpoint rejected impression bulk");
                    }
                    Err(e) => {
                        error!(endpoint = %endpoint, error = %e, "error posting impression bulk to listener");
                    }
                }
            }
        });
        *self.poster.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Stops the poster task, optionally waiting for it to exit.
    pub async fn stop(&self, blocking: bool) -> Result<(), ListenerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ListenerError::NotRunning);
        }
        self.shutdown.cancel();
        if blocking {
            let handle = self
                .poster
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }
        Ok(())
    }
}

impl ImpressionBulkListener for HttpImpressionBulkListener {
    fn submit(
        &self,
        impressions: Vec<ImpressionsForListener>,
        metadata: &Metadata,
    ) -> Result<(), ListenerError> {
        let body = ListenerPostBody {
            impressions,
            sdk_version: metadata.sdk_version.clone(),
            machine_ip: metadata.machine_ip.clone(),
            machine_name: metadata.machine_name.clone(),
        };
        self.tx
            .try_send(body)
            .map_err(|_| ListenerError::QueueFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_payload() -> Vec<ImpressionsForListener> {
        vec![ImpressionsForListener {
            test_name: "feat_1".to_string(),
            key_impressions: vec![ImpressionForListener {
                key_name: "user-1".to_string(),
                treatment: "on".to_string(),
                time: 1,
                change_number: 2,
                label: "whitelisted".to_string(),
                bucketing_key: None,
                pt: None,
                properties: None,
            }],
        }]
    }

    fn sample_metadata() -> Metadata {
        Metadata {
            sdk_version: "go-1.1.1".to_string(),
            machine_ip: "10.0.0.1".to_string(),
            machine_name: "host-a".to_string(),
        }
    }

    #[test]
    fn test_rejects_invalid_queue_size() {
        assert!(matches!(
            HttpImpressionBulkListener::new("http://localhost".to_string(), 0, None),
            Err(ListenerError::InvalidQueueSize)
        ));
    }

    #[tokio::test]
    async fn test_submit_fails_when_queue_full() {
        let listener =
            HttpImpressionBulkListener::new("http://localhost:1".to_string(), 1, None).unwrap();
        // not started: nothing drains the queue
        assert!(listener.submit(sample_payload(), &sample_metadata()).is_ok());
        assert!(matches!(
            listener.submit(sample_payload(), &sample_metadata()),
            Err(ListenerError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_sentinels() {
        let listener =
            HttpImpressionBulkListener::new("http://localhost:1".to_string(), 10, None).unwrap();
        assert!(matches!(
            listener.stop(false).await,
            Err(ListenerError::NotRunning)
        ));
        listener.start().unwrap();
        assert!(matches!(
            listener.start(),
            Err(ListenerError::AlreadyRunning)
        ));
        listener.stop(true).await.unwrap();
        assert!(matches!(
            listener.stop(false).await,
            Err(ListenerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_posts_submitted_bulks() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/listener")
            .match_header("content-type", "application/json")
            .with_status(200)
            .create_async()
            .await;

        let listener = HttpImpressionBulkListener::new(
            format!("{}/listener", server.url()),
            10,
            None,
        )
        .unwrap();
        listener.start().unwrap();
        listener
            .submit(sample_payload(), &sample_metadata())
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !mock.matched() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        mock.assert_async().await;
        listener.stop(true).await.unwrap();
    }
}
