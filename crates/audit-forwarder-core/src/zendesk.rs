// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Upstream audit API transport and response shapes.

use crate::errors::{ForwarderError, SourceError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

pub const AUDIT_ENDPOINT: &str = "audit_logs.json";
pub const TICKET_AUDIT_ENDPOINT: &str = "ticket_audits.json";
pub const MAX_TICKET_AUDITS: usize = 1000;
/// Largest id accepted by the API; used to read the newest audit backwards.
pub const MAX_TICKET_AUDIT_ID: &str = "9999999999999999999999";

/// Monotonic position in the ticket audit feed, as assigned by upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor(pub u64);

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Cursor(n)),
            Raw::Text(s) => s
                .parse()
                .map(Cursor)
                .map_err(|_| serde::de::Error::custom(format!("invalid cursor '{s}'"))),
        }
    }
}

/// Upstream nulls, zeroes and empty strings all mean "no cursor".
fn usable_cursor<'de, D>(deserializer: D) -> Result<Option<Cursor>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Cursor(Cursor),
        Other(serde::de::IgnoredAny),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Cursor(cursor)) if cursor.0 > 0 => Some(cursor),
        _ => None,
    })
}

#[derive(Debug, Deserialize)]
pub struct AuditLogPage {
    pub audit_logs: Vec<Map<String, Value>>,
    #[serde(default)]
    pub next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TicketAuditPage {
    pub audits: Vec<Value>,
    #[serde(default, deserialize_with = "usable_cursor")]
    pub next_cursor: Option<Cursor>,
    #[serde(default, deserialize_with = "usable_cursor")]
    pub prev_cursor: Option<Cursor>,
    #[serde(default)]
    pub count: Option<usize>,
}

impl TicketAuditPage {
    /// Number of audits upstream reports for this page.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count.unwrap_or(self.audits.len())
    }
}

/// Decodes a response body, mapping shape errors to `Malformed`.
pub fn decode<T: DeserializeOwned>(url: &str, body: Value) -> Result<T, SourceError> {
    serde_json::from_value(body).map_err(|e| SourceError::Malformed {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

/// Read access to the upstream API.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Root all endpoint paths are joined to, ending in `/`.
    fn base_url(&self) -> &str;

    async fn get_json(&self, url: &str) -> Result<Value, SourceError>;
}

#[derive(Debug, Clone)]
pub struct ZendeskConfig {
    pub hostname: String,
    pub username: String,
    pub token: String,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

/// Authenticated client with per-request retries.
#[derive(Clone)]
pub struct ZendeskApi {
    client: reqwest::Client,
    base_url: String,
    user: String,
    token: String,
    max_attempts: u32,
    retry_delay: Duration,
}

impl fmt::Debug for ZendeskApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZendeskApi")
            .field("base_url", &self.base_url)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl ZendeskApi {
    pub fn new(config: &ZendeskConfig) -> Result<Self, ForwarderError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.timeout)
            .build()
            .map_err(ForwarderError::HttpClient)?;

        Ok(Self {
            client,
            base_url: format!("{}/api/v2/", config.hostname.trim_end_matches('/')),
            user: format!("{}/token", config.username),
            token: config.token.clone(),
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay,
        })
    }

    async fn attempt(&self, url: &str) -> Result<Value, SourceError> {
        let response = self
            .client
            .get(url)
            .basic_auth(&self.user, Some(&self.token))
            .send()
            .await
            .map_err(|source| SourceError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                url: url.to_string(),
                status,
            });
        }

        response.json().await.map_err(|e| SourceError::Malformed {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

fn is_retryable(error: &SourceError) -> bool {
    match error {
        SourceError::Transport { .. } => true,
        SourceError::Status { status, .. } => {
            status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
        }
        _ => false,
    }
}

#[async_trait]
impl Upstream for ZendeskApi {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json(&self, url: &str) -> Result<Value, SourceError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            debug!("GET {url}");
            match self.attempt(url).await {
                Ok(body) => return Ok(body),
                Err(e) if attempts < self.max_attempts && is_retryable(&e) => {
                    warn!("Attempt {attempts} of {url} failed, retrying: {e}");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
