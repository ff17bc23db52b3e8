// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;

/// Configuration problems. Always fatal: raised at construction and surfaced
/// to the process boundary.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required value '{0}'. Consult the readme for required config values.")]
    Missing(&'static str),

    #[error("{0} is an unsupported SIEM")]
    UnsupportedSiem(String),

    #[error("splunk requires a siemToken value to be provided")]
    MissingSiemToken,

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("Unable to parse config file {path}: {reason}")]
    File { path: String, reason: String },
}

/// Failures talking to the upstream audit API. Everything except
/// `CursorUnavailable` at startup is retried on the next scheduled tick.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} returned status {status}")]
    Status { url: String, status: StatusCode },

    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },

    #[error("cursor could not be obtained from {url}")]
    CursorUnavailable { url: String },

    #[error("poll of {url} did not complete within {secs}s")]
    Stalled { url: String, secs: u64 },
}

impl SourceError {
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Transport { url, .. }
            | Self::Status { url, .. }
            | Self::Malformed { url, .. }
            | Self::CursorUnavailable { url }
            | Self::Stalled { url, .. } => url,
        }
    }
}

/// A batch the sink could not confirm. The batch stays queued.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("rejected with status {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("missing or failed acknowledgement: {0}")]
    Acknowledgement(String),
}

/// Startup failures of the forwarder. There is no degraded mode.
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to bootstrap ticket audit cursor: {0}")]
    Bootstrap(#[from] SourceError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}
