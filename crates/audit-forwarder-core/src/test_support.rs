// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory upstream used by the track and scheduler tests.

use crate::errors::SourceError;
use crate::siem::{BatchSinkConfig, BatchSinkService, SiemDialect, SinkCommand, SinkHandle};
use crate::zendesk::Upstream;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as TokioMutex};

pub const BASE_URL: &str = "https://example.zendesk.com/api/v2/";

pub type Reply = Result<Value, SourceError>;

/// Records every requested URL and answers with whatever the test feeds into
/// the reply channel, in order. A request with no reply available waits.
pub struct ScriptedUpstream {
    requests: Mutex<Vec<String>>,
    replies: TokioMutex<mpsc::UnboundedReceiver<Reply>>,
}

impl ScriptedUpstream {
    pub fn new() -> (Self, mpsc::UnboundedSender<Reply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let upstream = Self {
            requests: Mutex::new(Vec::new()),
            replies: TokioMutex::new(rx),
        };
        (upstream, tx)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("lock poisoned").clone()
    }

    pub async fn wait_for_requests(&self, count: usize) {
        let wait = async {
            while self.requests().len() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("timed out waiting for upstream requests");
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    fn base_url(&self) -> &str {
        BASE_URL
    }

    async fn get_json(&self, url: &str) -> Result<Value, SourceError> {
        self.requests
            .lock()
            .expect("lock poisoned")
            .push(url.to_string());
        let mut replies = self.replies.lock().await;
        match replies.recv().await {
            Some(reply) => reply,
            None => Err(SourceError::Malformed {
                url: url.to_string(),
                reason: "no scripted reply".to_string(),
            }),
        }
    }
}

pub fn malformed(url: &str) -> SourceError {
    SourceError::Malformed {
        url: url.to_string(),
        reason: "scripted failure".to_string(),
    }
}

/// A sink handle whose commands land in a plain channel instead of a
/// running service, so tests can inspect exactly what was enqueued.
pub fn capture_sink() -> (SinkHandle, mpsc::UnboundedReceiver<SinkCommand>) {
    let (service, handle) = BatchSinkService::new(BatchSinkConfig {
        dialect: SiemDialect::Http,
        url: "http://127.0.0.1:9/collector".to_string(),
        token: None,
        batch_size: 100,
        batch_interval: Duration::from_secs(3600),
        max_queue: None,
        strict_ssl: true,
        default_level: "INFO".to_string(),
        timeout: Duration::from_secs(1),
    })
    .expect("sink");
    (handle, service.into_receiver())
}

pub fn drain_enqueued(rx: &mut mpsc::UnboundedReceiver<SinkCommand>) -> Vec<Value> {
    let mut records = Vec::new();
    while let Ok(command) = rx.try_recv() {
        if let SinkCommand::Enqueue(line) = command {
            records.push(serde_json::from_str(&line).expect("enqueued record is JSON"));
        }
    }
    records
}
