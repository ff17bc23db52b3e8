// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Incremental pollers for the two upstream feeds.
//!
//! Each feed is a [`Track`]. A track allows at most one poll chain at a time:
//! the chain holds a [`PollLease`] from the track's [`PollGuard`] for its whole
//! duration, and a poll that cannot take the lease returns immediately. The
//! lease is released when dropped, so success, failure and timeout all free
//! the track for the next scheduled tick.

pub mod audit_logs;
pub mod ticket_audits;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

pub use audit_logs::{AuditLogFeed, WindowState};
pub use ticket_audits::{CursorState, TicketAuditFeed};

#[async_trait]
pub trait Track: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs one poll chain to completion, unless one is already in flight.
    async fn poll(&self);

    fn is_polling(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct PollGuard {
    active: AtomicBool,
}

impl PollGuard {
    #[must_use]
    pub fn try_acquire(&self) -> Option<PollLease<'_>> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PollLease { guard: self })
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct PollLease<'a> {
    guard: &'a PollGuard,
}

impl Drop for PollLease<'_> {
    fn drop(&mut self) {
        self.guard.active.store(false, Ordering::Release);
    }
}
