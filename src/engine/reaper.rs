//! Deadline enforcement.
//!
//! A reaper pass force-aborts queries locked past the deadline, closes idle
//! sessions with nothing in flight, and forgets finished queries and closed
//! sessions once the retention window has passed.

use crate::engine::Engine;
use crate::voucher::Voucher;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outcome of one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Locked queries aborted past their deadline.
    pub force_aborted: usize,
    /// Idle sessions closed.
    pub sessions_closed: usize,
    /// Finished queries dropped after retention.
    pub queries_purged: usize,
    /// Closed sessions dropped after retention.
    pub sessions_purged: usize,
}

impl<V: Voucher> Engine<V> {
    /// Run one reaper pass as of `now`.
    pub async fn reap_expired(&self, now: Instant) -> ReapReport {
        let mut report = ReapReport::default();

        for id in self.queries.expired(now, self.config.query_deadline()) {
            match self.abort(id, true).await {
                Ok(()) => report.force_aborted += 1,
                Err(e) => warn!("Failed to force-abort query {id}: {e}"),
            }
        }

        let idle_timeout = self.config.session_idle_timeout();
        for id in self.sessions.idle(now, idle_timeout) {
            let Some(session) = self.sessions.get(id) else {
                continue;
            };
            let Ok(_guard) = self.gate.enter(&session.client).await else {
                debug!("Leaving idle session {id} of halted client {} open", session.client);
                continue;
            };
            let still_idle = self.sessions.get(id).is_some_and(|s| {
                s.is_open() && now.saturating_duration_since(s.last_activity) >= idle_timeout
            });
            if !still_idle || self.queries.has_locked_in(id) {
                continue;
            }
            if self.sessions.close(id, now) == Some(true) {
                self.metrics.record_session_closed();
                debug!("Session {id} closed after idle timeout");
                report.sessions_closed += 1;
            }
        }

        let retention = self.config.query_retention();
        report.queries_purged = self.queries.purge_finished(now, retention);
        report.sessions_purged = self.sessions.purge_closed(now, retention);
        self.gate.prune();
        self.metrics.flush();

        if report != ReapReport::default() {
            info!(
                "Reaper pass: {} force-aborted, {} sessions closed, {} queries and {} sessions purged",
                report.force_aborted,
                report.sessions_closed,
                report.queries_purged,
                report.sessions_purged
            );
        }
        report
    }

    /// Run [`Self::reap_expired`] every `reap_interval` until `shutdown`
    /// turns true or its sender is dropped.
    pub fn spawn_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut ticker = tokio::time::interval(self.config.reap_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Reaper stopping");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.reap_expired(Instant::now()).await;
                    }
                }
            }
        })
    }
}
