// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching sink for SIEM HTTP collectors.
//!
//! ```text
//!   SinkHandle::log ──► [ BatchQueue ] ──(every batch interval)──► POST batch
//!                          ▲                                        │
//!                          └──── drop head on confirmed success ◄───┘
//! ```
//!
//! The queue is owned by [`BatchSinkService`], which runs as a single task.
//! Producers only ever talk to it through a cloneable [`SinkHandle`]. At most
//! one batch is in flight; records leave the queue only once the collector has
//! confirmed them, so delivery is at-least-once.

use crate::errors::{ConfigError, ForwarderError, SinkError};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub const SPLUNK_PATH: &str = "/services/collector/event/1.0";

pub const DEFAULT_LEVEL: &str = "INFO";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiemDialect {
    Http,
    SumoLogic,
    Splunk,
}

impl FromStr for SiemDialect {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "sumologic" => Ok(Self::SumoLogic),
            "splunk" => Ok(Self::Splunk),
            other => Err(ConfigError::UnsupportedSiem(other.to_string())),
        }
    }
}

impl SiemDialect {
    /// Splunk HEC wants every record inside an `{"event": ...}` envelope.
    fn wraps_event(self) -> bool {
        matches!(self, Self::Splunk)
    }

    /// Splunk HEC confirms delivery in the response body.
    fn requires_acknowledgement(self) -> bool {
        matches!(self, Self::Splunk)
    }
}

/// Target URL and headers for one dialect.
#[derive(Debug, Clone)]
pub struct SiemEndpoint {
    pub url: String,
    pub headers: HeaderMap,
}

impl SiemEndpoint {
    pub fn new(dialect: SiemDialect, url: &str, token: Option<&str>) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let url = match (dialect, token) {
            (SiemDialect::Http, _) => url.to_string(),
            (SiemDialect::SumoLogic, Some(token)) => format!("{url}{token}"),
            (SiemDialect::SumoLogic, None) => url.to_string(),
            (SiemDialect::Splunk, Some(token)) => {
                let value = HeaderValue::from_str(&format!("Splunk {token}")).map_err(|e| {
                    ConfigError::InvalidValue {
                        key: "siemToken",
                        reason: e.to_string(),
                    }
                })?;
                headers.insert(AUTHORIZATION, value);
                format!("{url}{SPLUNK_PATH}")
            }
            (SiemDialect::Splunk, None) => return Err(ConfigError::MissingSiemToken),
        };

        Ok(Self { url, headers })
    }
}

#[derive(Serialize)]
struct LogLine<'a> {
    level: &'a str,
    message: &'a Value,
}

#[derive(Serialize)]
struct SplunkEvent<'a> {
    event: LogLine<'a>,
}

#[derive(Deserialize)]
struct SplunkAcknowledgement {
    code: Option<i64>,
}

/// Serializes one record into the line format the dialect expects.
pub fn serialize_record(
    dialect: SiemDialect,
    level: &str,
    message: &Value,
) -> Result<String, serde_json::Error> {
    let line = LogLine { level, message };
    if dialect.wraps_event() {
        serde_json::to_string(&SplunkEvent { event: line })
    } else {
        serde_json::to_string(&line)
    }
}

/// Decides whether the collector confirmed a batch.
pub fn check_response(dialect: SiemDialect, status: StatusCode, body: &str) -> Result<(), SinkError> {
    if !(200..400).contains(&status.as_u16()) {
        return Err(SinkError::Rejected {
            status,
            body: body.to_string(),
        });
    }
    if !dialect.requires_acknowledgement() {
        return Ok(());
    }
    if body.trim().is_empty() {
        return Err(SinkError::Acknowledgement("empty body".to_string()));
    }
    match serde_json::from_str::<SplunkAcknowledgement>(body) {
        Ok(SplunkAcknowledgement { code: Some(0) }) => Ok(()),
        Ok(SplunkAcknowledgement { code }) => {
            Err(SinkError::Acknowledgement(format!("code {code:?}")))
        }
        Err(e) => Err(SinkError::Acknowledgement(e.to_string())),
    }
}

/// Ordered outbound records. The first `in_flight` records have been submitted
/// and are waiting for confirmation.
#[derive(Debug, Default)]
pub struct BatchQueue {
    records: VecDeque<String>,
    in_flight: usize,
    max_len: Option<usize>,
}

impl BatchQueue {
    #[must_use]
    pub fn new(max_len: Option<usize>) -> Self {
        Self {
            records: VecDeque::new(),
            in_flight: 0,
            max_len,
        }
    }

    /// Appends a record. When a capacity is set and exceeded, the oldest record
    /// that is not in flight is evicted and returned.
    pub fn push(&mut self, record: String) -> Option<String> {
        self.records.push_back(record);
        match self.max_len {
            Some(max) if self.records.len() > max => self.records.remove(self.in_flight),
            _ => None,
        }
    }

    /// Marks up to `batch_size` head records as in flight and returns their
    /// newline-joined body. `None` while a batch is in flight or when empty.
    pub fn begin_batch(&mut self, batch_size: usize) -> Option<String> {
        if self.in_flight > 0 || self.records.is_empty() {
            return None;
        }
        let count = batch_size.min(self.records.len());
        self.in_flight = count;
        let lines: Vec<&str> = self.records.iter().take(count).map(String::as_str).collect();
        Some(lines.join("\n"))
    }

    /// Resolves the in-flight batch. Returns how many records were removed.
    pub fn complete(&mut self, success: bool) -> usize {
        let count = std::mem::take(&mut self.in_flight);
        if success {
            self.records.drain(..count);
            count
        } else {
            0
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    #[must_use]
    pub fn records(&self) -> &VecDeque<String> {
        &self.records
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkStats {
    pub queued: usize,
    pub in_flight: usize,
}

#[derive(Debug)]
pub enum SinkCommand {
    Enqueue(String),
    Stats(oneshot::Sender<SinkStats>),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct SinkHandle {
    tx: mpsc::UnboundedSender<SinkCommand>,
    dialect: SiemDialect,
    default_level: Arc<str>,
}

impl SinkHandle {
    /// Appends an already serialized record. Never blocks.
    pub fn enqueue(&self, serialized: String) {
        if self.tx.send(SinkCommand::Enqueue(serialized)).is_err() {
            error!("SIEM | Sink is not running, dropping record");
        }
    }

    fn append(&self, level: &str, message: &Value) {
        match serialize_record(self.dialect, level, message) {
            Ok(serialized) => self.enqueue(serialized),
            Err(e) => error!("SIEM | Error serializing log line: {e}"),
        }
    }

    pub fn log(&self, message: &Value) {
        self.append(&self.default_level, message);
    }

    pub fn info(&self, message: &Value) {
        self.append("INFO", message);
    }

    pub fn warn(&self, message: &Value) {
        self.append("WARN", message);
    }

    pub fn error(&self, message: &Value) {
        self.append("ERROR", message);
    }

    pub async fn stats(&self) -> Result<SinkStats, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(SinkCommand::Stats(response_tx))
            .map_err(|e| format!("Failed to send stats command: {e}"))?;
        response_rx
            .await
            .map_err(|e| format!("Failed to receive stats response: {e}"))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<SinkCommand>> {
        self.tx.send(SinkCommand::Shutdown)
    }
}

#[derive(Debug, Clone)]
pub struct BatchSinkConfig {
    pub dialect: SiemDialect,
    pub url: String,
    pub token: Option<String>,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub max_queue: Option<usize>,
    pub strict_ssl: bool,
    pub default_level: String,
    pub timeout: Duration,
}

pub struct BatchSinkService {
    queue: BatchQueue,
    rx: mpsc::UnboundedReceiver<SinkCommand>,
    client: reqwest::Client,
    endpoint: Arc<SiemEndpoint>,
    dialect: SiemDialect,
    batch_size: usize,
    batch_interval: Duration,
    sends: JoinSet<Result<(), SinkError>>,
}

impl BatchSinkService {
    pub fn new(config: BatchSinkConfig) -> Result<(Self, SinkHandle), ForwarderError> {
        let endpoint = SiemEndpoint::new(config.dialect, &config.url, config.token.as_deref())?;
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(!config.strict_ssl)
            .timeout(config.timeout)
            .build()
            .map_err(ForwarderError::HttpClient)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            queue: BatchQueue::new(config.max_queue),
            rx,
            client,
            endpoint: Arc::new(endpoint),
            dialect: config.dialect,
            batch_size: config.batch_size.max(1),
            batch_interval: config.batch_interval.max(Duration::from_millis(1)),
            sends: JoinSet::new(),
        };
        let handle = SinkHandle {
            tx,
            dialect: config.dialect,
            default_level: Arc::from(config.default_level.as_str()),
        };
        Ok((service, handle))
    }

    #[cfg(test)]
    pub(crate) fn into_receiver(self) -> mpsc::UnboundedReceiver<SinkCommand> {
        self.rx
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("SIEM | Batch sink started, posting to {}", self.endpoint.url);

        let mut ticker = interval(self.batch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                Some(result) = self.sends.join_next(), if !self.sends.is_empty() => {
                    self.on_response(result);
                }
                _ = ticker.tick() => self.tick(),
                command = self.rx.recv() => match command {
                    Some(SinkCommand::Enqueue(record)) => {
                        if let Some(evicted) = self.queue.push(record) {
                            warn!(
                                "SIEM | Queue is full, dropped oldest record ({} bytes)",
                                evicted.len()
                            );
                        }
                    }
                    Some(SinkCommand::Stats(response_tx)) => {
                        let stats = SinkStats {
                            queued: self.queue.len(),
                            in_flight: self.queue.in_flight(),
                        };
                        if response_tx.send(stats).is_err() {
                            error!("SIEM | Failed to send stats response - receiver dropped");
                        }
                    }
                    Some(SinkCommand::Shutdown) | None => break,
                },
            }
        }

        if !self.queue.is_empty() {
            warn!(
                "SIEM | Batch sink stopped with {} undelivered records",
                self.queue.len()
            );
        }
        debug!("SIEM | Batch sink stopped");
    }

    fn tick(&mut self) {
        let Some(body) = self.queue.begin_batch(self.batch_size) else {
            return;
        };
        debug!("SIEM | Sending batch of {} records", self.queue.in_flight());

        let request = self
            .client
            .post(&self.endpoint.url)
            .headers(self.endpoint.headers.clone())
            .body(body);
        let dialect = self.dialect;
        self.sends.spawn(async move {
            let response = request.send().await?;
            let status = response.status();
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    debug!("SIEM | Failed to read collector response body: {e}");
                    String::new()
                }
            };
            check_response(dialect, status, &body)
        });
    }

    fn on_response(&mut self, result: Result<Result<(), SinkError>, JoinError>) {
        let success = match result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("SIEM | Failed to send batch to {}: {e}", self.endpoint.url);
                false
            }
            Err(e) => {
                error!("SIEM | Failed to join send task: {e}");
                false
            }
        };
        let removed = self.queue.complete(success);
        if success {
            debug!(
                "SIEM | Delivered {removed} records, {} still queued",
                self.queue.len()
            );
        }
    }
}
