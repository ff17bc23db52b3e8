// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cursor-ordered ticket audit feed.
//!
//! The feed starts from the cursor just before the newest audit (bootstrap)
//! and then reads forward `MAX_TICKET_AUDITS` at a time. A full page means
//! more are waiting, so the next page is requested straight away under the
//! same lease. When upstream stops returning a next cursor it has lost our
//! position, and the feed bootstraps again instead of reusing the old value.

use crate::errors::SourceError;
use crate::sanitizer::Sanitizer;
use crate::siem::SinkHandle;
use crate::source::{PollGuard, Track};
use crate::zendesk::{
    decode, Cursor, TicketAuditPage, Upstream, MAX_TICKET_AUDITS, MAX_TICKET_AUDIT_ID,
    TICKET_AUDIT_ENDPOINT,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorState {
    pub cursor: Option<Cursor>,
    pub cursor_processing: bool,
}

#[derive(Debug, Default)]
struct Position {
    cursor: Option<Cursor>,
    needs_bootstrap: bool,
}

pub struct TicketAuditFeed {
    upstream: Arc<dyn Upstream>,
    sink: SinkHandle,
    sanitizer: Sanitizer,
    position: Mutex<Position>,
    guard: PollGuard,
    poll_timeout: Duration,
}

impl TicketAuditFeed {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        sink: SinkHandle,
        sanitizer: Sanitizer,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            upstream,
            sink,
            sanitizer,
            position: Mutex::new(Position {
                cursor: None,
                needs_bootstrap: true,
            }),
            guard: PollGuard::default(),
            poll_timeout,
        }
    }

    #[allow(clippy::expect_used)]
    pub fn state(&self) -> CursorState {
        let position = self.position.lock().expect("lock poisoned");
        CursorState {
            cursor: position.cursor,
            cursor_processing: self.guard.is_held(),
        }
    }

    /// Starts reading after `cursor` without asking upstream for a position.
    #[allow(clippy::expect_used)]
    pub fn set_cursor(&self, cursor: Cursor) {
        let mut position = self.position.lock().expect("lock poisoned");
        position.cursor = Some(cursor);
        position.needs_bootstrap = false;
    }

    /// Records a cursor reported by upstream. Cursors never move backwards.
    #[allow(clippy::expect_used)]
    fn advance(&self, next: Cursor) -> Cursor {
        let mut position = self.position.lock().expect("lock poisoned");
        position.needs_bootstrap = false;
        match position.cursor {
            Some(current) if next < current => {
                warn!("TICKETS | Ignoring cursor {next} behind current cursor {current}");
                current
            }
            _ => {
                position.cursor = Some(next);
                next
            }
        }
    }

    #[allow(clippy::expect_used)]
    fn mark_cursor_lost(&self) {
        self.position.lock().expect("lock poisoned").needs_bootstrap = true;
    }

    #[allow(clippy::expect_used)]
    fn current(&self) -> (Option<Cursor>, bool) {
        let position = self.position.lock().expect("lock poisoned");
        (position.cursor, position.needs_bootstrap)
    }

    /// Reads the newest audit backwards to find the starting cursor.
    pub async fn bootstrap(&self) -> Result<Cursor, SourceError> {
        let url = format!(
            "{}{TICKET_AUDIT_ENDPOINT}?max_id={MAX_TICKET_AUDIT_ID}&limit=1",
            self.upstream.base_url()
        );
        debug!("TICKETS | Bootstrapping cursor from {url}");

        let body = self.upstream.get_json(&url).await?;
        let page: TicketAuditPage = decode(&url, body)?;
        let Some(cursor) = page.prev_cursor else {
            return Err(SourceError::CursorUnavailable { url });
        };

        let cursor = self.advance(cursor);
        info!("TICKETS | Cursor initialized at {cursor}");
        Ok(cursor)
    }

    async fn drain(&self) -> Result<usize, SourceError> {
        let mut forwarded = 0;
        loop {
            let cursor = match self.current() {
                (Some(cursor), false) => cursor,
                _ => self.bootstrap().await?,
            };

            let url = format!(
                "{}{TICKET_AUDIT_ENDPOINT}?since_id={cursor}&limit={MAX_TICKET_AUDITS}",
                self.upstream.base_url()
            );
            debug!("TICKETS | Polling {url}");
            let body = self.upstream.get_json(&url).await?;
            let page: TicketAuditPage = decode(&url, body)?;
            let count = page.count();

            let cursor_lost = match page.next_cursor {
                Some(next) => {
                    let cursor = self.advance(next);
                    debug!("TICKETS | Cursor advanced to {cursor}");
                    false
                }
                None => {
                    warn!("TICKETS | {url} returned no next cursor, cursor will be re-initialized");
                    self.mark_cursor_lost();
                    true
                }
            };

            for audit in page.audits {
                let entry = self.sanitizer.sanitize_ticket_audit(audit);
                self.sink.log(&entry);
                forwarded += 1;
            }

            if cursor_lost {
                self.bootstrap().await?;
            }

            if count < MAX_TICKET_AUDITS {
                return Ok(forwarded);
            }
        }
    }
}

#[async_trait]
impl Track for TicketAuditFeed {
    fn name(&self) -> &'static str {
        "ticket_audits"
    }

    async fn poll(&self) {
        let Some(_lease) = self.guard.try_acquire() else {
            debug!("TICKETS | Previous poll still in flight, skipping");
            return;
        };

        match tokio::time::timeout(self.poll_timeout, self.drain()).await {
            Ok(Ok(forwarded)) => {
                if forwarded > 0 {
                    info!("TICKETS | Forwarded {forwarded} ticket audits");
                }
            }
            Ok(Err(e)) => {
                error!(
                    "TICKETS | Failed to fetch ticket audits from {}, will retry: {e}",
                    e.url()
                );
            }
            Err(_) => {
                let stalled = SourceError::Stalled {
                    url: format!("{}{TICKET_AUDIT_ENDPOINT}", self.upstream.base_url()),
                    secs: self.poll_timeout.as_secs(),
                };
                error!("TICKETS | Releasing stalled poll: {stalled}");
            }
        }
    }

    fn is_polling(&self) -> bool {
        self.guard.is_held()
    }
}
