//! Gateway counters.
//!
//! Tracks accepted and rejected sessions, the query outcomes, and the atoms
//! charged at settlement. Counters are optionally persisted to disk with
//! `rmp-serde` and reloaded on start.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Sessions opened.
    pub sessions_accepted: u64,
    /// Session vouchers rejected.
    pub sessions_rejected: u64,
    /// Sessions closed explicitly or by idle timeout.
    pub sessions_closed: u64,
    /// Queries that reserved credit.
    pub queries_locked: u64,
    /// Queries refused for lack of credit.
    pub queries_rejected: u64,
    /// Queries settled.
    pub queries_settled: u64,
    /// Queries aborted by the caller.
    pub queries_aborted: u64,
    /// Queries aborted by the reaper after their deadline.
    pub queries_force_aborted: u64,
    /// Atoms charged by settled queries.
    pub atoms_settled: u64,
}

/// Atomic gateway counters.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    sessions_accepted: AtomicU64,
    sessions_rejected: AtomicU64,
    sessions_closed: AtomicU64,
    queries_locked: AtomicU64,
    queries_rejected: AtomicU64,
    queries_settled: AtomicU64,
    queries_aborted: AtomicU64,
    queries_force_aborted: AtomicU64,
    atoms_settled: AtomicU64,
    /// Path for persisting metrics (optional).
    persist_path: Option<PathBuf>,
}

impl GatewayMetrics {
    /// Create in-memory counters starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create counters persisted to `persist_path`, loading any saved values.
    #[must_use]
    pub fn with_persistence(persist_path: &Path) -> Self {
        let mut metrics = Self::new();
        metrics.persist_path = Some(persist_path.to_path_buf());

        if let Some(loaded) = Self::load_from_disk(persist_path) {
            metrics.restore(&loaded);
            info!(
                "Loaded persisted metrics: {} sessions, {} settled queries",
                loaded.sessions_accepted, loaded.queries_settled
            );
        }

        metrics
    }

    /// Record an opened session.
    pub fn record_session_accepted(&self) {
        let count = self.sessions_accepted.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Session accepted, total count: {count}");
        self.persist();
    }

    /// Record a rejected session voucher.
    pub fn record_session_rejected(&self) {
        self.sessions_rejected.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a closed session.
    pub fn record_session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a query that locked credit.
    pub fn record_query_locked(&self) {
        self.queries_locked.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a query refused for insufficient credit.
    pub fn record_query_rejected(&self) {
        self.queries_rejected.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a settled query and the atoms it was charged.
    pub fn record_query_settled(&self, atoms: u64) {
        self.queries_settled.fetch_add(1, Ordering::SeqCst);
        let total = self.atoms_settled.fetch_add(atoms, Ordering::SeqCst) + atoms;
        debug!("Query settled for {atoms} atoms, total settled: {total}");
        self.persist();
    }

    /// Record an aborted query.
    pub fn record_query_aborted(&self, forced: bool) {
        if forced {
            self.queries_force_aborted.fetch_add(1, Ordering::SeqCst);
        } else {
            self.queries_aborted.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Copy every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_accepted: self.sessions_accepted.load(Ordering::SeqCst),
            sessions_rejected: self.sessions_rejected.load(Ordering::SeqCst),
            sessions_closed: self.sessions_closed.load(Ordering::SeqCst),
            queries_locked: self.queries_locked.load(Ordering::SeqCst),
            queries_rejected: self.queries_rejected.load(Ordering::SeqCst),
            queries_settled: self.queries_settled.load(Ordering::SeqCst),
            queries_aborted: self.queries_aborted.load(Ordering::SeqCst),
            queries_force_aborted: self.queries_force_aborted.load(Ordering::SeqCst),
            atoms_settled: self.atoms_settled.load(Ordering::SeqCst),
        }
    }

    /// Write counters to disk now, if persistence is enabled.
    pub fn flush(&self) {
        self.persist();
    }

    fn restore(&self, loaded: &MetricsSnapshot) {
        self.sessions_accepted
            .store(loaded.sessions_accepted, Ordering::SeqCst);
        self.sessions_rejected
            .store(loaded.sessions_rejected, Ordering::SeqCst);
        self.sessions_closed
            .store(loaded.sessions_closed, Ordering::SeqCst);
        self.queries_locked
            .store(loaded.queries_locked, Ordering::SeqCst);
        self.queries_rejected
            .store(loaded.queries_rejected, Ordering::SeqCst);
        self.queries_settled
            .store(loaded.queries_settled, Ordering::SeqCst);
        self.queries_aborted
            .store(loaded.queries_aborted, Ordering::SeqCst);
        self.queries_force_aborted
            .store(loaded.queries_force_aborted, Ordering::SeqCst);
        self.atoms_settled
            .store(loaded.atoms_settled, Ordering::SeqCst);
    }

    fn persist(&self) {
        if let Some(ref path) = self.persist_path {
            match rmp_serde::to_vec(&self.snapshot()) {
                Ok(bytes) => {
                    if let Err(e) = std::fs::write(path, bytes) {
                        warn!("Failed to persist metrics: {e}");
                    }
                }
                Err(e) => warn!("Failed to encode metrics: {e}"),
            }
        }
    }

    fn load_from_disk(path: &Path) -> Option<MetricsSnapshot> {
        let bytes = std::fs::read(path).ok()?;
        rmp_serde::from_slice(&bytes).ok()
    }
}
