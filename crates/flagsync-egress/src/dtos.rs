// Copyright 2025-Present Split Software, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wire-level data types.
//!
//! Queue shapes (`ImpressionQueueObject`, `QueueStoredEvent`) use the short
//! single-letter keys SDKs write into the store; bulk shapes use the
//! camelCase keys the ingestion API expects.

use serde::{Deserialize, Serialize};

/// Identity of the SDK instance that produced a telemetry record.
///
/// Immutable value type; used as a map key to group records per producer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "s")]
    pub sdk_version: String,
    #[serde(rename = "i", default)]
    pub machine_ip: String,
    #[serde(rename = "n", default)]
    pub machine_name: String,
}

/// A single impression as stored by an SDK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Impression {
    #[serde(rename = "k")]
    pub key_name: String,
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    pub bucketing_key: Option<String>,
    #[serde(rename = "f")]
    pub feature_name: String,
    #[serde(rename = "t")]
    pub treatment: String,
    #[serde(rename = "r", default)]
    pub label: String,
    #[serde(rename = "c", default)]
    pub change_number: i64,
    #[serde(rename = "m", default)]
    pub time: i64,
    #[serde(rename = "pt", default, skip_serializing_if = "Option::is_none")]
    pub previous_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<String>,
}

/// Impression plus the identity of the SDK that generated it, as queued in
/// the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpressionQueueObject {
    #[serde(rename = "m")]
    pub metadata: Metadata,
    #[serde(rename = "i")]
    pub impression: Impression,
}

/// One impression in the bulk-post shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyImpression {
    pub key_name: String,
    pub treatment: String,
    pub time: i64,
    pub change_number: i64,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucketing_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pt: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<String>,
}

impl From<Impression> for KeyImpression {
    fn from(imp: Impression) -> Self {
        KeyImpression {
            key_name: imp.key_name,
            treatment: imp.treatment,
            time: imp.time,
            change_number: imp.change_number,
            label: imp.label,
            bucketing_key: imp.bucketing_key,
            pt: imp.previous_time,
            properties: imp.properties,
        }
    }
}

/// Impressions for one feature, as posted to `/testImpressions/bulk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestImpressions {
    pub test_name: String,
    pub key_impressions: Vec<KeyImpression>,
}

/// A single tracked event; the storage shape and the bulk-post shape are
/// the same.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub key: String,
    pub traffic_type_name: String,
    pub event_type_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Event plus producer identity, as queued in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStoredEvent {
    #[serde(rename = "m")]
    pub metadata: Metadata,
    #[serde(rename = "e")]
    pub event: Event,
}

/// Unique keys seen for one feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniqueKeysDto {
    #[serde(rename = "f")]
    pub feature: String,
    #[serde(rename = "ks")]
    pub keys: Vec<String>,
}

/// Payload posted to `/keys/ss`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UniquesPayload {
    pub keys: Vec<UniqueKeysDto>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_impression_queue_object_roundtrip() {
        let raw = r#"{"m":{"s":"go-1.1.1","i":"1.2.3.4","n":"machine_1"},"i":{"k":"user-1","f":"onboarding","t":"on","r":"default rule","c":123,"m":456}}"#;
        let parsed: ImpressionQueueObject = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.metadata.sdk_version, "go-1.1.1");
        assert_eq!(parsed.impression.feature_name, "onboarding");
        assert_eq!(parsed.impression.bucketing_key, None);
        assert_eq!(parsed.impression.previous_time, None);
    }

    #[test]
    fn test_metadata_usable_as_map_key() {
        use std::collections::HashMap;
        let m1 = Metadata {
            sdk_version: "php-7.2".to_string(),
            machine_ip: "10.0.0.1".to_string(),
            machine_name: "host-a".to_string(),
        };
        let m2 = m1.clone();
        let mut index: HashMap<Metadata, usize> = HashMap::new();
        index.insert(m1, 0);
        assert_eq!(index.get(&m2), Some(&0));
    }

    #[test]
    fn test_bulk_shape_omits_empty_optionals() {
        let bulk = vec![TestImpressions {
            test_name: "feat_1".to_string(),
            key_impressions: vec![KeyImpression {
                key_name: "k".to_string(),
                treatment: "on".to_string(),
                time: 1,
                change_number: 2,
                label: "in segment".to_string(),
                bucketing_key: None,
                pt: None,
                properties: None,
            }],
        }];
        let serialized = serde_json::to_string(&bulk).unwrap();
        assert!(serialized.contains(r#""testName":"feat_1""#));
        assert!(serialized.contains(r#""keyImpressions""#));
        assert!(!serialized.contains("bucketingKey"));
        assert!(!serialized.contains("pt"));
    }

    #[test]
    fn test_event_wire_shape() {
        let raw = r#"{"m":{"s":"java-4.0"},"e":{"key":"u1","trafficTypeName":"user","eventTypeId":"checkout","value":9.99,"timestamp":1000}}"#;
        let parsed: QueueStoredEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.event.event_type_id, "checkout");
        assert_eq!(parsed.event.value, Some(9.99));

        let out = serde_json::to_string(&parsed.event).unwrap();
        assert!(out.contains(r#""trafficTypeName":"user""#));
        assert!(!out.contains("properties"));
    }
}
