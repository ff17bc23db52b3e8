// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::Config;
use crate::errors::{ForwarderError, SourceError};
use crate::sanitizer::{Sanitizer, AUDIT_LOG_KIND_FIELD, TICKET_EVENT_KIND_FIELD};
use crate::scheduler::spawn_track;
use crate::siem::{BatchSinkService, SinkHandle};
use crate::source::{AuditLogFeed, TicketAuditFeed, Track};
use crate::zendesk::{Cursor, Upstream, ZendeskApi};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cursor the backfill mode starts reading after.
const BACKFILL_CURSOR: Cursor = Cursor(1);

/// Owns the sink and both tracks and runs them until cancelled.
pub struct Forwarder {
    config: Arc<Config>,
    sink_service: BatchSinkService,
    sink: SinkHandle,
    audit_logs: Arc<AuditLogFeed>,
    ticket_audits: Option<Arc<TicketAuditFeed>>,
}

impl Forwarder {
    pub async fn new(config: Arc<Config>) -> Result<Self, ForwarderError> {
        let upstream: Arc<dyn Upstream> = Arc::new(ZendeskApi::new(&config.zendesk())?);
        Self::with_upstream(config, upstream).await
    }

    /// Builds every component. With the ticket track enabled this bootstraps
    /// its cursor. An answer without a usable cursor is fatal; transport and
    /// status failures leave the bootstrap to the first scheduled poll.
    pub async fn with_upstream(
        config: Arc<Config>,
        upstream: Arc<dyn Upstream>,
    ) -> Result<Self, ForwarderError> {
        let (sink_service, sink) = BatchSinkService::new(config.sink())?;

        let audit_logs = Arc::new(AuditLogFeed::new(
            Arc::clone(&upstream),
            sink.clone(),
            Sanitizer::new(config.audit_policy.clone(), AUDIT_LOG_KIND_FIELD),
            config.poll_timeout,
        ));
        if config.debug {
            audit_logs.set_window_start(DateTime::<Utc>::UNIX_EPOCH);
        }

        let ticket_audits = if config.tickets {
            let feed = TicketAuditFeed::new(
                Arc::clone(&upstream),
                sink.clone(),
                Sanitizer::new(config.ticket_policy.clone(), TICKET_EVENT_KIND_FIELD),
                config.poll_timeout,
            );
            if config.debug {
                feed.set_cursor(BACKFILL_CURSOR);
            } else {
                match feed.bootstrap().await {
                    Ok(_) => {}
                    Err(e @ SourceError::CursorUnavailable { .. }) => return Err(e.into()),
                    Err(e) => warn!(
                        "TICKETS | Failed to initialize cursor from {}, will retry on first poll: {e}",
                        e.url()
                    ),
                }
            }
            Some(Arc::new(feed))
        } else {
            info!("TICKETS | Ticket audit forwarding disabled");
            None
        };

        Ok(Self {
            config,
            sink_service,
            sink,
            audit_logs,
            ticket_audits,
        })
    }

    #[must_use]
    pub fn sink(&self) -> SinkHandle {
        self.sink.clone()
    }

    #[must_use]
    pub fn audit_logs(&self) -> Arc<AuditLogFeed> {
        Arc::clone(&self.audit_logs)
    }

    #[must_use]
    pub fn ticket_audits(&self) -> Option<Arc<TicketAuditFeed>> {
        self.ticket_audits.clone()
    }

    /// Starts the sink and the schedules, returning once `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let sink_task = tokio::spawn(self.sink_service.run(cancel.clone()));

        let mut tracks: Vec<(Arc<dyn Track>, _)> =
            vec![(self.audit_logs as Arc<dyn Track>, self.config.audit_schedule)];
        if let Some(ticket_audits) = self.ticket_audits {
            tracks.push((ticket_audits as Arc<dyn Track>, self.config.ticket_schedule));
        }

        let mut schedules = Vec::with_capacity(tracks.len());
        for (track, schedule) in tracks {
            schedules.push(spawn_track(
                track,
                schedule,
                self.config.debug,
                cancel.clone(),
            ));
        }
        info!("Forwarder started with {} tracks", schedules.len());

        for schedule in schedules {
            if let Err(e) = schedule.await {
                error!("Schedule task failed: {e}");
            }
        }
        if let Err(e) = sink_task.await {
            error!("Sink task failed: {e}");
        }
        info!("Forwarder stopped");
    }
}
