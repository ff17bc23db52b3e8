// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-windowed account audit log feed.
//!
//! Every poll requests the records created in `[window_start, now]`, oldest
//! first, following `next_page` links until the last page. The window only
//! moves forward once the whole chain succeeded; a failure anywhere leaves
//! `window_start` where it was so the same range is fetched again next tick.

use crate::errors::SourceError;
use crate::sanitizer::Sanitizer;
use crate::siem::SinkHandle;
use crate::source::{PollGuard, Track};
use crate::zendesk::{decode, AuditLogPage, Upstream, AUDIT_ENDPOINT};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub window_start: DateTime<Utc>,
    pub window_end: Option<DateTime<Utc>>,
    pub filter_active: bool,
}

#[derive(Debug)]
struct Window {
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
}

pub struct AuditLogFeed {
    upstream: Arc<dyn Upstream>,
    sink: SinkHandle,
    sanitizer: Sanitizer,
    window: Mutex<Window>,
    guard: PollGuard,
    poll_timeout: Duration,
    clock: Clock,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Query suffix selecting records created inside the window.
fn window_filter(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!(
        "&filter[created_at][]={}&filter[created_at][]={}",
        timestamp(start),
        timestamp(end)
    )
}

impl AuditLogFeed {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        sink: SinkHandle,
        sanitizer: Sanitizer,
        poll_timeout: Duration,
    ) -> Self {
        Self::with_clock(upstream, sink, sanitizer, poll_timeout, Arc::new(Utc::now))
    }

    pub fn with_clock(
        upstream: Arc<dyn Upstream>,
        sink: SinkHandle,
        sanitizer: Sanitizer,
        poll_timeout: Duration,
        clock: Clock,
    ) -> Self {
        let start = clock();
        Self {
            upstream,
            sink,
            sanitizer,
            window: Mutex::new(Window { start, end: None }),
            guard: PollGuard::default(),
            poll_timeout,
            clock,
        }
    }

    #[allow(clippy::expect_used)]
    pub fn state(&self) -> WindowState {
        let window = self.window.lock().expect("lock poisoned");
        WindowState {
            window_start: window.start,
            window_end: window.end,
            filter_active: self.guard.is_held(),
        }
    }

    /// Moves the start of the next window, e.g. to backfill from the epoch.
    #[allow(clippy::expect_used)]
    pub fn set_window_start(&self, start: DateTime<Utc>) {
        self.window.lock().expect("lock poisoned").start = start;
    }

    #[allow(clippy::expect_used)]
    fn open_window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let mut window = self.window.lock().expect("lock poisoned");
        let end = (self.clock)();
        window.end = Some(end);
        (window.start, end)
    }

    #[allow(clippy::expect_used)]
    fn commit_window(&self, end: DateTime<Utc>) {
        let mut window = self.window.lock().expect("lock poisoned");
        // The window never moves backwards, even if set_window_start raced us.
        if end > window.start {
            window.start = end;
        }
    }

    async fn fetch_window(&self, first_url: String, filter: &str) -> Result<usize, SourceError> {
        let mut url = first_url;
        let mut forwarded = 0;
        loop {
            let body = self.upstream.get_json(&url).await?;
            let page: AuditLogPage = decode(&url, body)?;

            for record in page.audit_logs {
                if let Some(record) = self.sanitizer.sanitize(record) {
                    self.sink.log(&Value::Object(record));
                    forwarded += 1;
                }
            }

            match page.next_page {
                Some(next) if !next.is_empty() => url = format!("{next}{filter}"),
                _ => return Ok(forwarded),
            }
        }
    }
}

#[async_trait]
impl Track for AuditLogFeed {
    fn name(&self) -> &'static str {
        "audit_logs"
    }

    async fn poll(&self) {
        let Some(_lease) = self.guard.try_acquire() else {
            debug!("AUDIT | Previous window still in flight, skipping poll");
            return;
        };

        let (start, end) = self.open_window();
        let filter = window_filter(start, end);
        let url = format!(
            "{}{AUDIT_ENDPOINT}?sort_order=asc{filter}",
            self.upstream.base_url()
        );
        debug!("AUDIT | Polling {url}");

        match tokio::time::timeout(self.poll_timeout, self.fetch_window(url.clone(), &filter)).await
        {
            Ok(Ok(forwarded)) => {
                self.commit_window(end);
                info!(
                    "AUDIT | Forwarded {forwarded} audit logs created between {} and {}",
                    timestamp(start),
                    timestamp(end)
                );
            }
            Ok(Err(e)) => {
                error!(
                    "AUDIT | Failed to fetch audit logs from {}, window will be retried: {e}",
                    e.url()
                );
            }
            Err(_) => {
                let stalled = SourceError::Stalled {
                    url,
                    secs: self.poll_timeout.as_secs(),
                };
                error!("AUDIT | Releasing stalled poll: {stalled}");
            }
        }
    }

    fn is_polling(&self) -> bool {
        self.guard.is_held()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitizer::{EventKinds, Policy, AUDIT_LOG_KIND_FIELD};
    use crate::test_support::{capture_sink, drain_enqueued, malformed, ScriptedUpstream};
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// A clock that advances one minute per reading.
    fn ticking_clock() -> Clock {
        let minutes = Arc::new(AtomicI64::new(0));
        Arc::new(move || {
            let n = minutes.fetch_add(1, Ordering::SeqCst);
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(n)
        })
    }

    fn at_minute(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(n)
    }

    fn feed(
        upstream: Arc<ScriptedUpstream>,
        sanitizer: Sanitizer,
    ) -> (Arc<AuditLogFeed>, tokio::sync::mpsc::UnboundedReceiver<crate::siem::SinkCommand>) {
        let (sink, rx) = capture_sink();
        let feed = AuditLogFeed::with_clock(
            upstream,
            sink,
            sanitizer,
            Duration::from_secs(30),
            ticking_clock(),
        );
        (Arc::new(feed), rx)
    }

    fn pass_through() -> Sanitizer {
        Sanitizer::new(Policy::pass_through(), AUDIT_LOG_KIND_FIELD)
    }

    #[test]
    fn test_window_filter_format() {
        assert_eq!(
            window_filter(at_minute(0), at_minute(1)),
            "&filter[created_at][]=2024-01-01T00:00:00.000Z&filter[created_at][]=2024-01-01T00:01:00.000Z"
        );
    }

    #[tokio::test]
    async fn test_successful_polls_chain_windows() {
        let (upstream, replies) = ScriptedUpstream::new();
        let upstream = Arc::new(upstream);
        let (feed, mut rx) = feed(Arc::clone(&upstream), pass_through());
        assert_eq!(feed.state().window_start, at_minute(0));

        replies
            .send(Ok(json!({"audit_logs": [{"id": 1}], "next_page": null})))
            .unwrap();
        feed.poll().await;
        let first = feed.state();
        assert_eq!(first.window_end, Some(at_minute(1)));
        assert_eq!(first.window_start, at_minute(1));
        assert!(!first.filter_active);

        replies
            .send(Ok(json!({"audit_logs": [{"id": 2}], "next_page": null})))
            .unwrap();
        feed.poll().await;
        let second = feed.state();
        assert_eq!(second.window_start, at_minute(2));

        let requests = upstream.requests();
        assert_eq!(
            requests[0],
            "https://example.zendesk.com/api/v2/audit_logs.json?sort_order=asc\
             &filter[created_at][]=2024-01-01T00:00:00.000Z\
             &filter[created_at][]=2024-01-01T00:01:00.000Z"
        );
        assert!(requests[1].contains("[]=2024-01-01T00:01:00.000Z&filter"));

        let forwarded = drain_enqueued(&mut rx);
        assert_eq!(
            forwarded,
            vec![
                json!({"level": "INFO", "message": {"id": 1}}),
                json!({"level": "INFO", "message": {"id": 2}})
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_poll_retries_same_window() {
        let (upstream, replies) = ScriptedUpstream::new();
        let upstream = Arc::new(upstream);
        let (feed, _rx) = feed(Arc::clone(&upstream), pass_through());

        replies.send(Err(malformed("audit_logs.json"))).unwrap();
        feed.poll().await;
        let state = feed.state();
        assert_eq!(state.window_start, at_minute(0));
        assert!(!state.filter_active);

        replies
            .send(Ok(json!({"not_audit_logs": []})))
            .unwrap();
        feed.poll().await;
        assert_eq!(feed.state().window_start, at_minute(0));

        let requests = upstream.requests();
        assert!(requests[1].contains("[]=2024-01-01T00:00:00.000Z&filter"));
    }

    #[tokio::test]
    async fn test_follows_next_page_inside_one_window() {
        let (upstream, replies) = ScriptedUpstream::new();
        let upstream = Arc::new(upstream);
        let (feed, mut rx) = feed(Arc::clone(&upstream), pass_through());

        let poll = tokio::spawn({
            let feed = Arc::clone(&feed);
            async move { feed.poll().await }
        });

        replies
            .send(Ok(json!({
                "audit_logs": [{"id": 1}],
                "next_page": "https://example.zendesk.com/api/v2/audit_logs.json?page=2"
            })))
            .unwrap();
        upstream.wait_for_requests(2).await;
        assert!(feed.is_polling());
        assert_eq!(feed.state().window_start, at_minute(0));

        replies
            .send(Ok(json!({"audit_logs": [{"id": 2}], "next_page": null})))
            .unwrap();
        poll.await.unwrap();

        assert!(!feed.is_polling());
        assert_eq!(feed.state().window_start, at_minute(1));
        assert!(upstream.requests()[1].starts_with(
            "https://example.zendesk.com/api/v2/audit_logs.json?page=2&filter[created_at][]="
        ));
        assert_eq!(drain_enqueued(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn test_failure_on_later_page_keeps_window() {
        let (upstream, replies) = ScriptedUpstream::new();
        let upstream = Arc::new(upstream);
        let (feed, _rx) = feed(Arc::clone(&upstream), pass_through());

        replies
            .send(Ok(json!({"audit_logs": [], "next_page": "https://x/audit_logs.json?page=2"})))
            .unwrap();
        replies.send(Err(malformed("page 2"))).unwrap();
        feed.poll().await;

        assert_eq!(upstream.requests().len(), 2);
        assert_eq!(feed.state().window_start, at_minute(0));
    }

    #[tokio::test]
    async fn test_poll_while_in_flight_is_noop() {
        let (upstream, replies) = ScriptedUpstream::new();
        let upstream = Arc::new(upstream);
        let (feed, _rx) = feed(Arc::clone(&upstream), pass_through());

        let first = tokio::spawn({
            let feed = Arc::clone(&feed);
            async move { feed.poll().await }
        });
        upstream.wait_for_requests(1).await;
        assert!(feed.state().filter_active);

        feed.poll().await;
        feed.poll().await;
        assert_eq!(upstream.requests().len(), 1);

        replies
            .send(Ok(json!({"audit_logs": [], "next_page": null})))
            .unwrap();
        first.await.unwrap();
        assert!(!feed.state().filter_active);
    }

    #[tokio::test]
    async fn test_audit_policy_is_applied() {
        let (upstream, replies) = ScriptedUpstream::new();
        let sanitizer = Sanitizer::new(
            Policy::new(EventKinds::parse("user"), EventKinds::None),
            AUDIT_LOG_KIND_FIELD,
        );
        let (feed, mut rx) = feed(Arc::new(upstream), sanitizer);

        replies
            .send(Ok(json!({
                "audit_logs": [
                    {"id": 1, "source_type": "user"},
                    {"id": 2, "source_type": "account_setting"}
                ],
                "next_page": null
            })))
            .unwrap();
        feed.poll().await;

        let forwarded = drain_enqueued(&mut rx);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0]["message"]["id"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_poll_releases_guard() {
        let (upstream, _replies) = ScriptedUpstream::new();
        let (sink, _rx) = capture_sink();
        let feed = AuditLogFeed::with_clock(
            Arc::new(upstream),
            sink,
            pass_through(),
            Duration::from_secs(5),
            ticking_clock(),
        );

        // No reply is ever sent, so the request hangs until the deadline.
        feed.poll().await;
        let state = feed.state();
        assert!(!state.filter_active);
        assert_eq!(state.window_start, at_minute(0));
    }
}
