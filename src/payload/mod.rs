//! Transport-independent message content.
//!
//! A [`Payload`] is immutable once built. It carries either raw bytes or an
//! ordered batch of sub-payloads, together with string metadata used by
//! [`macros`] to expand destination templates such as topics or object keys.

pub mod macros;

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::utils::Result;

/// Content of a [`Payload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Body {
    Raw(#[serde(with = "base64_bytes")] Vec<u8>),
    Batch(Vec<Payload>),
}

/// Serializable message envelope.
///
/// Serialization is a pure function of content: metadata is kept sorted, so
/// two payloads with identical content produce identical wire bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    body: Body,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
    timestamp_ms: i64,
}

impl Payload {
    /// Creates a raw payload stamped with the current time.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            body: Body::Raw(data.into()),
            metadata: BTreeMap::new(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Creates a batch payload. The number of sub-payloads is fixed from here on.
    pub fn batch(items: Vec<Payload>) -> Self {
        Self {
            body: Body::Batch(items),
            metadata: BTreeMap::new(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Raw bytes, or `None` for a batch.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Raw(data) => Some(data),
            Body::Batch(_) => None,
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self.body, Body::Batch(_))
    }

    /// Number of sub-payloads; `0` for a raw payload.
    pub fn batch_len(&self) -> usize {
        match &self.body {
            Body::Batch(items) => items.len(),
            Body::Raw(_) => 0,
        }
    }

    pub fn batch_item(&self, index: usize) -> Option<&Payload> {
        match &self.body {
            Body::Batch(items) => items.get(index),
            Body::Raw(_) => None,
        }
    }

    pub fn batch_items(&self) -> &[Payload] {
        match &self.body {
            Body::Batch(items) => items,
            Body::Raw(_) => &[],
        }
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Byte length of a raw payload, sub-payload count of a batch.
    pub fn size(&self) -> usize {
        match &self.body {
            Body::Raw(data) => data.len(),
            Body::Batch(items) => items.len(),
        }
    }

    pub fn to_wire(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Builds a payload from bytes received on a transport: a wire envelope is
    /// decoded, anything else is wrapped as raw data.
    pub fn from_transport(bytes: &[u8]) -> Self {
        Self::from_wire(bytes).unwrap_or_else(|_| Self::new(bytes))
    }

    /// The bytes a publish-only transport writes for this payload: raw data
    /// as-is, batches in wire form.
    pub fn content_bytes(&self) -> Result<Vec<u8>> {
        match &self.body {
            Body::Raw(data) => Ok(data.clone()),
            Body::Batch(_) => self.to_wire(),
        }
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
