//! Object stores the `s3` protocol uploads into.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Url};
use tracing::debug;

use super::sigv4::{self, EMPTY_PAYLOAD_SHA256, SigningRequest};
use crate::protocol::credentials::CredentialProvider;
use crate::utils::{BrokerError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SERVICE: &str = "s3";

pub trait ObjectStore: Send + Sync {
    fn exists(&self, bucket: &str, key: &str) -> Result<bool>;
    fn put(&self, bucket: &str, key: &str, body: &[u8], content_type: &str) -> Result<()>;
}

/// S3-compatible HTTP endpoint, addressed path-style
/// (`<endpoint>/<bucket>/<key>`) and signed with SigV4 unless the credentials
/// are empty.
pub struct HttpObjectStore {
    endpoint: Url,
    region: String,
    credentials: Arc<dyn CredentialProvider>,
    http: Client,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: &str,
        region: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| BrokerError::config(format!("invalid s3 endpoint {endpoint}: {e}")))?;
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            endpoint,
            region: region.into(),
            credentials,
            http,
        })
    }

    /// `https://s3.<region>.amazonaws.com`
    pub fn for_region(region: &str, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        Self::new(&format!("https://s3.{region}.amazonaws.com"), region, credentials)
    }

    fn object_url(&self, bucket: &str, key: &str) -> Result<Url> {
        let base = self.endpoint.as_str().trim_end_matches('/');
        let url = format!("{base}/{}/{}", sigv4::encode_path(bucket), sigv4::encode_path(key));
        Url::parse(&url).map_err(|e| BrokerError::config(format!("invalid object url {url}: {e}")))
    }

    fn request(&self, method: Method, url: Url, payload_sha256: &str) -> Result<RequestBuilder> {
        let mut builder = self
            .http
            .request(method.clone(), url.clone())
            .header("x-amz-content-sha256", payload_sha256);

        let credentials = self.credentials.credentials()?;
        if credentials.is_empty() {
            return Ok(builder);
        }

        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(BrokerError::config(format!("s3 url has no host: {url}"))),
        };
        let amz_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let mut headers = vec![
            ("host", host.as_str()),
            ("x-amz-content-sha256", payload_sha256),
            ("x-amz-date", amz_date.as_str()),
        ];
        if let Some(token) = credentials.session_token.as_deref() {
            headers.push(("x-amz-security-token", token));
            builder = builder.header("x-amz-security-token", token);
        }
        let signing = SigningRequest {
            method: method.as_str(),
            canonical_uri: url.path(),
            canonical_query: url.query().unwrap_or(""),
            headers: &headers,
            payload_sha256,
        };
        let authorization =
            sigv4::authorization(&credentials, &self.region, SERVICE, &amz_date, &signing)?;
        Ok(builder
            .header("x-amz-date", amz_date.as_str())
            .header(AUTHORIZATION, authorization))
    }
}

impl ObjectStore for HttpObjectStore {
    fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let url = self.object_url(bucket, key)?;
        let response = self.request(Method::HEAD, url, EMPTY_PAYLOAD_SHA256)?.send()?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(BrokerError::transport(format!(
                "HEAD s3://{bucket}/{key} returned {status}"
            ))),
        }
    }

    fn put(&self, bucket: &str, key: &str, body: &[u8], content_type: &str) -> Result<()> {
        let url = self.object_url(bucket, key)?;
        let payload_sha256 = sigv4::sha256_hex(body);
        let response = self
            .request(Method::PUT, url, &payload_sha256)?
            .header(CONTENT_TYPE, content_type)
            .body(body.to_vec())
            .send()?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(BrokerError::transport(format!(
                "PUT s3://{bucket}/{key} returned {status}: {detail}"
            )));
        }
        debug!("Uploaded {} byte(s) to s3://{bucket}/{key}", body.len());
        Ok(())
    }
}

/// Stores objects as `<root>/<bucket>/<key>` on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let relative = Path::new(bucket).join(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(BrokerError::config(format!(
                "object path {bucket}/{key} leaves the store root"
            )));
        }
        Ok(self.root.join(relative))
    }
}

impl ObjectStore for LocalObjectStore {
    fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.object_path(bucket, key)?.is_file())
    }

    fn put(&self, bucket: &str, key: &str, body: &[u8], _content_type: &str) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, body)?;
        debug!("Wrote {} byte(s) to {}", body.len(), path.display());
        Ok(())
    }
}
