//! Credential collaborator used by network-backed protocol clients.
//!
//! Providers are shared between clients and may be queried concurrently; the
//! MQTT client asks again on every (re)connect so rotated credentials are
//! picked up without restarting the broker.

use serde::{Deserialize, Serialize};

use crate::utils::{BrokerError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// Expiry as an RFC 3339 timestamp, when the provider knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.access_key_id.is_empty()
    }
}

pub trait CredentialProvider: Send + Sync {
    fn credentials(&self) -> Result<Credentials>;

    fn as_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.credentials()?)?)
    }
}

/// Fixed credentials, also used for anonymous access when empty.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialProvider {
    credentials: Credentials,
}

impl StaticCredentialProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn credentials(&self) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}

/// Reads the standard `AWS_*` variables on every call.
///
/// A missing access key yields empty (anonymous) credentials; a key without
/// its secret is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentialProvider;

impl CredentialProvider for EnvCredentialProvider {
    fn credentials(&self) -> Result<Credentials> {
        let Ok(access_key_id) = std::env::var("AWS_ACCESS_KEY_ID") else {
            return Ok(Credentials::default());
        };
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            BrokerError::config("AWS_ACCESS_KEY_ID is set but AWS_SECRET_ACCESS_KEY is not")
        })?;
        Ok(Credentials {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
            expiration: std::env::var("AWS_CREDENTIAL_EXPIRATION").ok(),
        })
    }
}
