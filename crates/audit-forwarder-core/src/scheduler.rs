// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-track poll triggers.
//!
//! A track fires either on a fixed period measured from start-up or once a
//! minute at a wall-clock second. Each track gets its own timer task, and each
//! poll runs in its own task, so a slow poll on one track never delays the
//! other track's trigger. Triggers that land while a poll is still running
//! are skipped.

use crate::source::Track;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const MINUTE_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed period, first firing one period after start.
    Every(Duration),
    /// Once per minute when the wall clock reaches this second.
    AtSecond(u32),
}

impl Schedule {
    /// A non-zero interval wins; otherwise the offset is used modulo 60.
    #[must_use]
    pub fn new(interval: Duration, offset_secs: u64) -> Self {
        if interval.is_zero() {
            #[allow(clippy::cast_possible_truncation)]
            Self::AtSecond((offset_secs % 60) as u32)
        } else {
            Self::Every(interval)
        }
    }
}

/// Time from `now` until the next instant whose second-of-minute is `second`.
/// Always strictly positive; an exact hit waits a full minute.
#[must_use]
pub fn delay_until_second(now: DateTime<Utc>, second: u32) -> Duration {
    let into_minute = now.timestamp_millis().rem_euclid(MINUTE_MS);
    let target = i64::from(second % 60) * 1000;
    let mut delay = target - into_minute;
    if delay <= 0 {
        delay += MINUTE_MS;
    }
    #[allow(clippy::cast_sign_loss)]
    Duration::from_millis(delay as u64)
}

fn fire(track: &Arc<dyn Track>, polls: &mut JoinSet<()>) {
    if track.is_polling() {
        debug!("{} | Poll still in flight, skipping trigger", track.name());
        return;
    }
    let track = Arc::clone(track);
    polls.spawn(async move { track.poll().await });
}

fn reap(name: &str, result: Result<(), JoinError>) {
    if let Err(e) = result {
        if !e.is_cancelled() {
            error!("{name} | Poll task failed: {e}");
        }
    }
}

/// Triggers `track` according to `schedule` until `cancel` fires. With
/// `poll_immediately` the first poll starts without waiting for a trigger.
/// Polls still running at cancellation are aborted; the track state they
/// had not committed is simply lost with the process.
pub fn spawn_track(
    track: Arc<dyn Track>,
    schedule: Schedule,
    poll_immediately: bool,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = track.name();
        debug!("{name} | Scheduled {schedule:?}");
        let mut polls = JoinSet::new();
        if poll_immediately {
            debug!("{name} | Polling immediately");
            fire(&track, &mut polls);
        }

        match schedule {
            Schedule::Every(period) => {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker.tick().await; // discard first tick, which is instantaneous
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        Some(result) = polls.join_next(), if !polls.is_empty() => reap(name, result),
                        _ = ticker.tick() => fire(&track, &mut polls),
                    }
                }
            }
            Schedule::AtSecond(second) => {
                let mut delay = Box::pin(sleep(delay_until_second(Utc::now(), second)));
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        Some(result) = polls.join_next(), if !polls.is_empty() => reap(name, result),
                        () = &mut delay => {
                            fire(&track, &mut polls);
                            delay = Box::pin(sleep(delay_until_second(Utc::now(), second)));
                        }
                    }
                }
            }
        }

        if !polls.is_empty() {
            debug!("{name} | Aborting {} poll in flight", polls.len());
            polls.shutdown().await;
        }
        debug!("{name} | Schedule stopped");
    })
}
