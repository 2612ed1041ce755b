//! Query records and their state machine.
//!
//! ```text
//! Pending ──lock──▶ Locked ──settle──▶ Settled
//!                      └─────abort───▶ Aborted
//! ```
//!
//! `released` and `charged` record settlement progress so a retried settle
//! or abort resumes where the previous attempt stopped.

use crate::credit::CreditState;
use crate::engine::session::SessionId;
use crate::error::InvariantViolation;
use crate::voucher::{Atoms, IdOf, Voucher};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Opaque query identifier, displayed as `q-<n>`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q-{}", self.0)
    }
}

/// Lifecycle state of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Estimate computed, credit not yet reserved.
    Pending,
    /// Credit reserved.
    Locked,
    /// Actual cost charged, reservation released.
    Settled,
    /// Reservation released, nothing charged.
    Aborted,
}

impl QueryState {
    /// Lowercase state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Locked => "locked",
            Self::Settled => "settled",
            Self::Aborted => "aborted",
        }
    }

    /// Returns true for Settled and Aborted.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Settled | Self::Aborted)
    }

    const fn can_move_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Locked) | (Self::Locked, Self::Settled | Self::Aborted)
        )
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settlement record returned by `settle_query`.
#[derive(Debug, Clone)]
pub struct Receipt<V: Voucher> {
    /// Settled query.
    pub query_id: QueryId,
    /// Session the query ran in.
    pub session_id: SessionId,
    /// Atoms that were reserved.
    pub estimated_cost: Atoms,
    /// Atoms charged.
    pub actual_cost: Atoms,
    /// Vouchers this settlement fully consumed, oldest first.
    pub vouchers_consumed: Vec<IdOf<V>>,
    /// Head voucher left partially spent, if any.
    pub partial: Option<IdOf<V>>,
    /// Credit figures right after settlement.
    pub credit_after: CreditState,
}

/// One billable unit of vendor work.
#[derive(Debug, Clone)]
pub struct Query<V: Voucher> {
    /// Identifier.
    pub id: QueryId,
    /// Session the query was accepted in.
    pub session: SessionId,
    /// Paying client.
    pub client: V::Client,
    /// Reserved atoms.
    pub estimated_cost: Atoms,
    /// Charged atoms, once known.
    pub actual_cost: Option<Atoms>,
    /// Current state.
    pub state: QueryState,
    /// When credit was reserved.
    pub locked_at: Instant,
    /// When the query reached a final state.
    pub finished_at: Option<Instant>,
    /// Aborted by the reaper rather than the caller.
    pub forced: bool,
    pub(crate) released: bool,
    pub(crate) charged: bool,
    pub(crate) consumed: Vec<IdOf<V>>,
    pub(crate) receipt: Option<Receipt<V>>,
}

impl<V: Voucher> Query<V> {
    pub(crate) fn pending(
        id: QueryId,
        session: SessionId,
        client: V::Client,
        estimated_cost: Atoms,
        now: Instant,
    ) -> Self {
        Self {
            id,
            session,
            client,
            estimated_cost,
            actual_cost: None,
            state: QueryState::Pending,
            locked_at: now,
            finished_at: None,
            forced: false,
            released: false,
            charged: false,
            consumed: Vec::new(),
            receipt: None,
        }
    }

    /// Move to `to`, refusing transitions outside the state machine.
    pub(crate) fn transition(
        &mut self,
        to: QueryState,
        now: Instant,
    ) -> Result<(), InvariantViolation> {
        if !self.state.can_move_to(to) {
            return Err(InvariantViolation::QueryTransition {
                query: self.id.to_string(),
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }
        self.state = to;
        if to.is_final() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Stored receipt of a settled query.
    #[must_use]
    pub fn receipt(&self) -> Option<&Receipt<V>> {
        self.receipt.as_ref()
    }
}

/// Query store keyed by id.
#[derive(Debug)]
pub(crate) struct QueryTable<V: Voucher> {
    next_id: AtomicU64,
    queries: RwLock<HashMap<QueryId, Query<V>>>,
}

impl<V: Voucher> QueryTable<V> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            queries: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn allocate_id(&self) -> QueryId {
        QueryId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn insert(&self, query: Query<V>) {
        self.queries.write().insert(query.id, query);
    }

    pub(crate) fn get(&self, id: QueryId) -> Option<Query<V>> {
        self.queries.read().get(&id).cloned()
    }

    /// Apply `f` to the stored query. `None` if the query is unknown.
    pub(crate) fn update<R>(&self, id: QueryId, f: impl FnOnce(&mut Query<V>) -> R) -> Option<R> {
        self.queries.write().get_mut(&id).map(f)
    }

    pub(crate) fn locked_for(&self, client: &V::Client) -> Vec<Query<V>> {
        self.queries
            .read()
            .values()
            .filter(|q| q.state == QueryState::Locked && &q.client == client)
            .cloned()
            .collect()
    }

    pub(crate) fn has_locked_in(&self, session: SessionId) -> bool {
        self.queries
            .read()
            .values()
            .any(|q| q.session == session && q.state == QueryState::Locked)
    }

    /// Locked queries reserved at least `deadline` ago.
    pub(crate) fn expired(&self, now: Instant, deadline: Duration) -> Vec<QueryId> {
        self.queries
            .read()
            .values()
            .filter(|q| {
                q.state == QueryState::Locked
                    && now.saturating_duration_since(q.locked_at) >= deadline
            })
            .map(|q| q.id)
            .collect()
    }

    /// Drop final queries older than `retention`. Returns how many.
    pub(crate) fn purge_finished(&self, now: Instant, retention: Duration) -> usize {
        let mut queries = self.queries.write();
        let before = queries.len();
        queries.retain(|_, q| {
            !q.finished_at
                .is_some_and(|t| now.saturating_duration_since(t) >= retention)
        });
        before - queries.len()
    }
}
