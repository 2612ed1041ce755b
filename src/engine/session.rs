//! Session records.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Opaque session identifier, displayed as `s-<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s-{}", self.0)
    }
}

/// A client's context for submitting queries.
#[derive(Debug, Clone)]
pub struct Session<C, K> {
    /// Identifier.
    pub id: SessionId,
    /// Owning client.
    pub client: C,
    /// Vendor the session pays.
    pub vendor: K,
    /// Nonce of the latest voucher accepted through this session.
    pub chain_head: u64,
    /// When the session was opened.
    pub opened_at: Instant,
    /// Last accepted voucher or query.
    pub last_activity: Instant,
    /// When the session was closed, if it was.
    pub closed_at: Option<Instant>,
}

impl<C, K> Session<C, K> {
    /// Returns true while the session accepts queries.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }
}

/// Session store keyed by id.
#[derive(Debug)]
pub(crate) struct SessionTable<C, K> {
    next_id: AtomicU64,
    sessions: RwLock<HashMap<SessionId, Session<C, K>>>,
}

impl<C: Clone, K: Clone> SessionTable<C, K> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn open(&self, client: C, vendor: K, chain_head: u64, now: Instant) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sessions.write().insert(
            id,
            Session {
                id,
                client,
                vendor,
                chain_head,
                opened_at: now,
                last_activity: now,
                closed_at: None,
            },
        );
        id
    }

    pub(crate) fn get(&self, id: SessionId) -> Option<Session<C, K>> {
        self.sessions.read().get(&id).cloned()
    }

    pub(crate) fn touch(&self, id: SessionId, now: Instant) {
        if let Some(s) = self.sessions.write().get_mut(&id) {
            s.last_activity = now;
        }
    }

    pub(crate) fn advance_head(&self, id: SessionId, chain_head: u64, now: Instant) {
        if let Some(s) = self.sessions.write().get_mut(&id) {
            s.chain_head = chain_head;
            s.last_activity = now;
        }
    }

    /// Close the session. `None` if unknown, `Some(false)` if already closed.
    pub(crate) fn close(&self, id: SessionId, now: Instant) -> Option<bool> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&id)?;
        if session.closed_at.is_some() {
            return Some(false);
        }
        session.closed_at = Some(now);
        Some(true)
    }

    /// Open sessions without activity for at least `timeout`.
    pub(crate) fn idle(&self, now: Instant, timeout: Duration) -> Vec<SessionId> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_open() && now.saturating_duration_since(s.last_activity) >= timeout)
            .map(|s| s.id)
            .collect()
    }

    /// Drop sessions closed at least `retention` ago. Returns how many.
    pub(crate) fn purge_closed(&self, now: Instant, retention: Duration) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| {
            !s.closed_at
                .is_some_and(|t| now.saturating_duration_since(t) >= retention)
        });
        before - sessions.len()
    }

    pub(crate) fn open_count(&self) -> usize {
        self.sessions.read().values().filter(|s| s.is_open()).count()
    }
}
