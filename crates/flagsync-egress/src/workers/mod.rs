// Copyright 2025-Present Split Software, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Concrete pipeline workers, one per telemetry flow.

pub mod events;
pub mod impressions;
pub mod unique_keys;

use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::dtos::Metadata;
use crate::error::WorkerError;

/// Impressions or events per bulk before a new one is started for the same
/// producer.
pub const MAX_BULK_SIZE: usize = 5000;

/// Sizing hints for the pooled batching containers. These are initial
/// capacities only; containers grow past them and keep the larger capacity
/// across reuse.
pub(crate) const METADATAS_PER_BULK: usize = 10;
pub(crate) const FEATURES_PER_BULK: usize = 200;
pub(crate) const IMPRESSIONS_PER_FEATURE: usize = 25;

pub(crate) const SDK_VERSION_HEADER: HeaderName = HeaderName::from_static("splitsdkversion");
pub(crate) const MACHINE_IP_HEADER: HeaderName = HeaderName::from_static("splitsdkmachineip");
pub(crate) const MACHINE_NAME_HEADER: HeaderName = HeaderName::from_static("splitsdkmachinename");
pub(crate) const IMPRESSIONS_MODE_HEADER: HeaderName =
    HeaderName::from_static("splitsdkimpressionsmode");

/// Builds a POST with the auth and producer-identity headers shared by all
/// bulk endpoints. The body is attached by the caller.
pub(crate) fn bulk_post(
    url: &reqwest::Url,
    api_key: &str,
    metadata: &Metadata,
) -> Result<reqwest::Request, WorkerError> {
    let mut req = reqwest::Request::new(reqwest::Method::POST, url.clone());
    let headers = req.headers_mut();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {api_key}"))?,
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        SDK_VERSION_HEADER,
        HeaderValue::from_str(&metadata.sdk_version)?,
    );
    headers.insert(
        MACHINE_IP_HEADER,
        HeaderValue::from_str(&metadata.machine_ip)?,
    );
    headers.insert(
        MACHINE_NAME_HEADER,
        HeaderValue::from_str(&metadata.machine_name)?,
    );
    Ok(req)
}

pub(crate) fn parse_endpoint(base: &str, path: &str) -> Result<reqwest::Url, WorkerError> {
    reqwest::Url::parse(&format!("{}{}", base.trim_end_matches('/'), path))
        .map_err(|e| WorkerError::InvalidUrl(e.to_string()))
}
