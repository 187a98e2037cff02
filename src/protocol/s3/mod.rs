//! Object-storage protocol (`s3`).
//!
//! Connectionless: every publish is one or more uploads into an
//! [`ObjectStore`]. Bucket and key are macro templates expanded per uploaded
//! payload; an expanded batch gives each item the extra `${index}` macro.

mod client;
mod sigv4;
pub mod store;

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::credentials::CredentialProvider;
use super::factory::{ProtocolFactory, parse_options};
use super::{ProtocolClient, ProtocolMessage};
use crate::payload::Payload;
use crate::utils::{BrokerError, Result};

pub use client::S3Client;
pub use store::{HttpObjectStore, LocalObjectStore, ObjectStore};

pub const PROTOCOL: &str = "s3";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// `s3_options` of a target.
#[derive(Debug, Clone, Deserialize)]
pub struct S3TargetOptions {
    pub region: String,
    /// `https://…` for an S3-compatible service or `file://<dir>` for a local
    /// directory. Defaults to the regional AWS endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_content_type() -> String {
    DEFAULT_CONTENT_TYPE.to_string()
}

/// `s3_message_options` of a destination.
#[derive(Debug, Clone, Deserialize)]
pub struct S3MessageOptions {
    pub bucket: String,
    pub key: String,
    #[serde(default = "default_true")]
    pub overwrite: bool,
    #[serde(default = "default_true")]
    pub batch_payload_expansion: bool,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

/// Upload request. `bucket` and `key` are still templates; they are expanded
/// against each uploaded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct S3Message {
    pub bucket: String,
    pub key: String,
    pub overwrite: bool,
    pub batch_payload_expansion: bool,
    pub content_type: String,
    pub payload: Payload,
}

enum StoreLocation {
    Aws,
    Http(String),
    Local(String),
}

impl StoreLocation {
    fn parse(endpoint: Option<&str>) -> Result<Self> {
        match endpoint.map(str::trim) {
            None | Some("") => Ok(Self::Aws),
            Some(endpoint) => {
                if let Some(dir) = endpoint.strip_prefix("file://") {
                    if dir.is_empty() {
                        return Err(BrokerError::config("s3 endpoint file:// needs a directory"));
                    }
                    Ok(Self::Local(dir.to_string()))
                } else if endpoint.starts_with("https://") || endpoint.starts_with("http://") {
                    Ok(Self::Http(endpoint.to_string()))
                } else {
                    Err(BrokerError::config(format!("unsupported s3 endpoint: {endpoint}")))
                }
            }
        }
    }
}

fn parse_target_options(options: &Value) -> Result<(S3TargetOptions, StoreLocation)> {
    let options: S3TargetOptions = parse_options(PROTOCOL, "options", options)?;
    if options.region.trim().is_empty() {
        return Err(BrokerError::config("s3 options: region must not be empty"));
    }
    let location = StoreLocation::parse(options.endpoint.as_deref())?;
    Ok((options, location))
}

fn parse_message_options(options: &Value) -> Result<S3MessageOptions> {
    let options: S3MessageOptions = parse_options(PROTOCOL, "message options", options)?;
    if options.bucket.is_empty() || options.key.is_empty() {
        return Err(BrokerError::config(
            "s3 message options: bucket and key must not be empty",
        ));
    }
    Ok(options)
}

#[derive(Default)]
pub struct S3Factory {
    store: Option<Arc<dyn ObjectStore>>,
}

impl S3Factory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every client built by this factory uploads into `store`, whatever
    /// endpoint its options name.
    pub fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        Self { store: Some(store) }
    }
}

impl ProtocolFactory for S3Factory {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn validate_options(&self, options: &Value) -> Result<()> {
        parse_target_options(options).map(|_| ())
    }

    fn validate_message_options(&self, options: &Value) -> Result<()> {
        parse_message_options(options).map(|_| ())
    }

    fn create_client(
        &self,
        options: &Value,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Arc<dyn ProtocolClient>> {
        let (options, location) = parse_target_options(options)?;
        let store: Arc<dyn ObjectStore> = match (&self.store, location) {
            (Some(store), _) => Arc::clone(store),
            (None, StoreLocation::Aws) => {
                Arc::new(HttpObjectStore::for_region(&options.region, credentials)?)
            }
            (None, StoreLocation::Http(endpoint)) => Arc::new(HttpObjectStore::new(
                &endpoint,
                options.region.as_str(),
                credentials,
            )?),
            (None, StoreLocation::Local(dir)) => Arc::new(LocalObjectStore::new(dir)),
        };
        Ok(Arc::new(S3Client::new(&options.region, store)?))
    }

    fn create_message(&self, payload: &Payload, options: &Value) -> Result<ProtocolMessage> {
        let options = parse_message_options(options)?;
        Ok(ProtocolMessage::S3(S3Message {
            bucket: options.bucket,
            key: options.key,
            overwrite: options.overwrite,
            batch_payload_expansion: options.batch_payload_expansion,
            content_type: options.content_type,
            payload: payload.clone(),
        }))
    }
}
