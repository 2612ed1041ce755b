//! Session and query lifecycle.
//!
//! The engine is the only writer of credit state. Every mutation for a client
//! runs under that client's [`ClientGate`] guard:
//!
//! ```text
//! accept_session  validate voucher, insert, absorb arrears, open session
//! accept_query    read chain, compute credit, lock estimate, record Locked
//! settle_query    release estimate, charge actual cost against the chain
//! abort_query     release estimate
//! ```
//!
//! Business outcomes (rejections, insufficient credit) and infrastructure
//! failures are returned as errors without touching state. An invariant
//! violation halts the client until [`Engine::resume_client`].

mod query;
mod reaper;
mod session;

pub use query::{Query, QueryId, QueryState, Receipt};
pub use reaper::ReapReport;
pub use session::{Session, SessionId};

use crate::auth::{Verdict, VoucherAuth};
use crate::config::{EngineConfig, GatewayConfig};
use crate::credit::{CreditSnapshot, CreditState, CreditTrack, HeadVoucher};
use crate::error::{Error, InvariantViolation, Rejection, Result};
use crate::metrics::{GatewayMetrics, MetricsSnapshot};
use crate::oracle::ChainOracle;
use crate::pricing::{PriceSchedule, Usage};
use crate::settle::SettlementQueue;
use crate::tracker::memory::{MemoryBalanceTracker, MemoryCostTracker, MemoryVoucherTracker};
use crate::tracker::{
    ClientGate, OutstandingBalanceTracker, UnmarkedCostTracker, VoucherTracker,
};
use crate::voucher::{Atoms, Voucher};
use parking_lot::Mutex;
use query::QueryTable;
use session::SessionTable;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// External collaborators the engine drives.
pub struct Collaborators<V: Voucher> {
    /// Voucher records.
    pub vouchers: Arc<dyn VoucherTracker<V>>,
    /// Dust cost per client.
    pub unmarked: Arc<dyn UnmarkedCostTracker<V::Client>>,
    /// Locked cost per client.
    pub balances: Arc<dyn OutstandingBalanceTracker<V::Client>>,
    /// Chain view.
    pub oracle: Arc<dyn ChainOracle<V::Client, V::Vendor>>,
}

impl<V: Voucher> Collaborators<V> {
    /// In-memory trackers with the given oracle.
    #[must_use]
    pub fn in_memory(oracle: Arc<dyn ChainOracle<V::Client, V::Vendor>>) -> Self {
        Self {
            vouchers: Arc::new(MemoryVoucherTracker::<V>::new()),
            unmarked: Arc::new(MemoryCostTracker::<V::Client>::new()),
            balances: Arc::new(MemoryBalanceTracker::<V::Client>::new()),
            oracle,
        }
    }
}

impl<V: Voucher> Clone for Collaborators<V> {
    fn clone(&self) -> Self {
        Self {
            vouchers: Arc::clone(&self.vouchers),
            unmarked: Arc::clone(&self.unmarked),
            balances: Arc::clone(&self.balances),
            oracle: Arc::clone(&self.oracle),
        }
    }
}

/// Head voucher whose consumption started but has not been reduced from the
/// unmarked cost yet.
#[derive(Debug, Clone)]
struct PendingSpend<V: Voucher> {
    voucher: V,
    query: Option<QueryId>,
    marked: bool,
}

/// Credit-gating engine for one vendor.
pub struct Engine<V: Voucher> {
    vendor: V::Vendor,
    config: EngineConfig,
    auth: VoucherAuth<V>,
    credit: CreditTrack<V>,
    vouchers: Arc<dyn VoucherTracker<V>>,
    unmarked: Arc<dyn UnmarkedCostTracker<V::Client>>,
    balances: Arc<dyn OutstandingBalanceTracker<V::Client>>,
    prices: PriceSchedule,
    gate: ClientGate<V::Client>,
    sessions: SessionTable<V::Client, V::Vendor>,
    queries: QueryTable<V>,
    settlement: SettlementQueue<V>,
    pending_spends: Mutex<HashMap<V::Client, PendingSpend<V>>>,
    metrics: GatewayMetrics,
}

impl<V: Voucher> Engine<V> {
    /// Create an engine selling on behalf of `vendor`.
    #[must_use]
    pub fn new(vendor: V::Vendor, collaborators: Collaborators<V>, config: &GatewayConfig) -> Self {
        let metrics = match &config.metrics.persist_path {
            Some(path) => GatewayMetrics::with_persistence(path),
            None => GatewayMetrics::new(),
        };
        info!(
            "Engine for vendor {vendor} initialized (expand_risk_factor={}, exhaustion_policy={:?}, query_deadline={}s)",
            config.credit.expand_risk_factor,
            config.credit.exhaustion_policy,
            config.engine.query_deadline_secs
        );
        Self {
            auth: VoucherAuth::new(Arc::clone(&collaborators.vouchers), &config.credit),
            credit: CreditTrack::new(
                vendor.clone(),
                Arc::clone(&collaborators.vouchers),
                Arc::clone(&collaborators.unmarked),
                Arc::clone(&collaborators.balances),
                collaborators.oracle,
                config.credit.clone(),
            ),
            vendor,
            config: config.engine.clone(),
            vouchers: collaborators.vouchers,
            unmarked: collaborators.unmarked,
            balances: collaborators.balances,
            prices: PriceSchedule::from_config(&config.pricing),
            gate: ClientGate::new(),
            sessions: SessionTable::new(),
            queries: QueryTable::new(),
            settlement: SettlementQueue::new(),
            pending_spends: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Vendor this engine sells for.
    #[must_use]
    pub fn vendor(&self) -> &V::Vendor {
        &self.vendor
    }

    /// Open a session with `voucher`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rejected`] if the voucher fails validation, or an
    /// infrastructure, invariant, or halt error. Nothing changes on error,
    /// except that an invariant violation while absorbing carried cost leaves
    /// the voucher recorded. Once recorded, an infrastructure failure while
    /// absorbing carried cost does not fail the call; the next settlement or
    /// voucher picks that cost up.
    pub async fn accept_session(&self, voucher: V) -> Result<SessionId> {
        let client = voucher.client().clone();
        let _guard = self.gate.enter(&client).await?;
        let result = self.admit(voucher).await;
        let nonce = self.check_fatal(&client, result)?;
        let id = self
            .sessions
            .open(client.clone(), self.vendor.clone(), nonce, Instant::now());
        self.metrics.record_session_accepted();
        info!("Session {id} opened for {client} at nonce {nonce}");
        Ok(id)
    }

    /// Add the next voucher of the chain to an open session.
    ///
    /// # Errors
    ///
    /// Same as [`Self::accept_session`], plus [`Error::UnknownSession`] if the
    /// session does not exist or belongs to another client, and
    /// [`Error::SessionClosed`].
    pub async fn top_up(&self, session: SessionId, voucher: V) -> Result<()> {
        let client = self.open_session(session)?.client;
        if voucher.client() != &client {
            return Err(Error::UnknownSession(format!(
                "{session} for client {}",
                voucher.client()
            )));
        }
        let _guard = self.gate.enter(&client).await?;
        self.open_session(session)?;
        let result = self.admit(voucher).await;
        let nonce = self.check_fatal(&client, result)?;
        self.sessions.advance_head(session, nonce, Instant::now());
        info!("Session {session} topped up to nonce {nonce}");
        Ok(())
    }

    /// Reserve `estimated_cost` for a new query in `session`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InsufficientCredit`] if the estimate exceeds the
    /// available credit, [`Error::Rejected`] with `NotSubscribed` if the
    /// subscription lapsed, or a request, infrastructure, invariant, or halt
    /// error. No query is created on error.
    pub async fn accept_query(&self, session: SessionId, estimated_cost: Atoms) -> Result<QueryId> {
        let client = self.open_session(session)?.client;
        let _guard = self.gate.enter(&client).await?;
        self.open_session(session)?;
        let result = self.reserve(session, &client, estimated_cost).await;
        let id = self.check_fatal(&client, result)?;
        self.sessions.touch(session, Instant::now());
        Ok(id)
    }

    /// Charge the actual cost of `query` and release its reservation.
    ///
    /// Retrying a settled query returns the stored receipt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownQuery`], [`Error::QueryAborted`], or an
    /// infrastructure, invariant, or halt error.
    pub async fn settle_query(&self, query: QueryId, usage: Usage) -> Result<Receipt<V>> {
        let client = self.query(query)?.client;
        let _guard = self.gate.enter(&client).await?;
        let result = self.settle_locked(query, &client, usage).await;
        self.check_fatal(&client, result)
    }

    /// Release the reservation of `query` without charging it.
    ///
    /// Aborting an aborted query does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownQuery`], [`Error::QuerySettled`], or an
    /// infrastructure, invariant, or halt error.
    pub async fn abort_query(&self, query: QueryId) -> Result<()> {
        self.abort(query, false).await
    }

    /// Stop accepting queries in `session`. Locked queries can still settle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownSession`].
    pub fn close_session(&self, session: SessionId) -> Result<()> {
        match self.sessions.close(session, Instant::now()) {
            None => Err(Error::UnknownSession(session.to_string())),
            Some(true) => {
                self.metrics.record_session_closed();
                info!("Session {session} closed");
                Ok(())
            }
            Some(false) => Ok(()),
        }
    }

    /// Lift a halt placed after an invariant violation.
    pub fn resume_client(&self, client: &V::Client) -> bool {
        self.gate.resume(client)
    }

    /// Returns true if `client` is halted.
    #[must_use]
    pub fn is_halted(&self, client: &V::Client) -> bool {
        self.gate.is_halted(client)
    }

    /// Spendable credit for `client` right now.
    ///
    /// # Errors
    ///
    /// Returns an oracle or tracker error.
    pub async fn available_credit(&self, client: &V::Client) -> Result<Atoms> {
        self.credit.available_credit(client).await
    }

    /// Full credit snapshot for `client`.
    ///
    /// # Errors
    ///
    /// Returns an oracle or tracker error.
    pub async fn credit_snapshot(&self, client: &V::Client) -> Result<CreditSnapshot> {
        let chain = self.credit.chain_snapshot(client).await?;
        self.credit.snapshot_with(client, &chain).await
    }

    /// Tracker-side credit figures for `client`.
    ///
    /// # Errors
    ///
    /// Returns a tracker error.
    pub async fn credit_state(&self, client: &V::Client) -> Result<CreditState> {
        self.credit.state(client).await
    }

    /// Earliest unspent voucher of `client`.
    ///
    /// # Errors
    ///
    /// Returns a tracker error.
    pub async fn head_voucher(&self, client: &V::Client) -> Result<Option<HeadVoucher<V>>> {
        self.credit.head(client).await
    }

    /// Session record.
    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<Session<V::Client, V::Vendor>> {
        self.sessions.get(id)
    }

    /// Query record.
    #[must_use]
    pub fn query_info(&self, id: QueryId) -> Option<Query<V>> {
        self.queries.get(id)
    }

    /// Locked queries of `client`.
    #[must_use]
    pub fn locked_queries(&self, client: &V::Client) -> Vec<Query<V>> {
        self.queries.locked_for(client)
    }

    /// Number of open sessions.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.sessions.open_count()
    }

    /// Spent vouchers awaiting downstream settlement.
    #[must_use]
    pub fn settlement(&self) -> &SettlementQueue<V> {
        &self.settlement
    }

    /// Counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Validate and record `voucher`, returning its nonce. Caller holds the gate.
    ///
    /// Every fallible read happens before the insert, so an error before
    /// the insert leaves nothing behind.
    async fn admit(&self, voucher: V) -> Result<u64> {
        let client = voucher.client().clone();
        let prior = self
            .vouchers
            .latest_nonce(&client, &self.vendor)
            .await?
            .unwrap_or(self.config.genesis_nonce);
        let chain = self.credit.chain_snapshot(&client).await?;
        if let Verdict::Rejected(reason) = self
            .auth
            .validate(&voucher, &self.vendor, prior, &chain)
            .await?
        {
            self.metrics.record_session_rejected();
            return Err(reason.into());
        }
        let arrears = self.unmarked.get(&client).await?;
        let nonce = voucher.nonce();
        if !self.vouchers.insert(voucher).await? {
            self.metrics.record_session_rejected();
            return Err(Rejection::NonceReplay {
                latest: prior,
                got: nonce,
            }
            .into());
        }
        if arrears > 0 {
            match self.absorb(&client, arrears, None).await {
                Ok(spent) => debug!(
                    "Voucher {client}/{nonce} absorbed {arrears} atoms of carried cost ({spent} vouchers spent)"
                ),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(
                    "Voucher {client}/{nonce} recorded, carried cost of {arrears} atoms left for later: {e}"
                ),
            }
        }
        Ok(nonce)
    }

    /// Check-and-reserve. Caller holds the gate.
    async fn reserve(
        &self,
        session: SessionId,
        client: &V::Client,
        estimated_cost: Atoms,
    ) -> Result<QueryId> {
        self.resume_spend(client).await?;
        let chain = self.credit.chain_snapshot(client).await?;
        if !chain.is_active() {
            self.metrics.record_query_rejected();
            return Err(Rejection::NotSubscribed.into());
        }
        let available = self.credit.snapshot_with(client, &chain).await?.available();
        if estimated_cost > available {
            self.metrics.record_query_rejected();
            debug!("Query for {client} refused: estimate {estimated_cost} > available {available}");
            return Err(Error::InsufficientCredit {
                requested: estimated_cost,
                available,
            });
        }

        let now = Instant::now();
        let mut query = Query::pending(
            self.queries.allocate_id(),
            session,
            client.clone(),
            estimated_cost,
            now,
        );
        let locked = self.balances.lock(client, estimated_cost).await?;
        query.transition(QueryState::Locked, now)?;
        let id = query.id;
        self.queries.insert(query);
        self.metrics.record_query_locked();
        debug!("Query {id} locked {estimated_cost} atoms for {client} (locked total {locked})");
        Ok(id)
    }

    /// Settle under the gate, resuming any partial progress.
    async fn settle_locked(
        &self,
        id: QueryId,
        client: &V::Client,
        usage: Usage,
    ) -> Result<Receipt<V>> {
        let query = self.query(id)?;
        match query.state {
            QueryState::Settled => {
                if let Some(receipt) = query.receipt {
                    debug!("Query {id} already settled, returning stored receipt");
                    return Ok(receipt);
                }
            }
            QueryState::Aborted => return Err(Error::QueryAborted(id.to_string())),
            QueryState::Pending | QueryState::Locked => {}
        }

        let actual_cost = match query.actual_cost {
            Some(cost) => cost,
            None => {
                let cost = self.prices.cost(&usage);
                self.queries.update(id, |q| q.actual_cost = Some(cost));
                cost
            }
        };

        if !query.released {
            self.balances.release(client, query.estimated_cost).await?;
            self.queries.update(id, |q| q.released = true);
        }

        if !query.charged {
            let unmarked = if actual_cost > 0 {
                self.unmarked.add(client, actual_cost).await?
            } else {
                self.unmarked.get(client).await?
            };
            self.queries.update(id, |q| q.charged = true);
            self.absorb(client, unmarked, Some(id)).await?;
        } else {
            // resumed after a failure part way through consumption
            let unmarked = self.unmarked.get(client).await?;
            self.absorb(client, unmarked, Some(id)).await?;
        }

        let credit_after = self.credit.state(client).await?;
        let partial = if credit_after.unmarked > 0 {
            self.credit.head(client).await?.map(|h| h.voucher.id())
        } else {
            None
        };
        let now = Instant::now();
        let receipt = self
            .queries
            .update(id, |q| -> Result<Receipt<V>> {
                q.transition(QueryState::Settled, now)?;
                let receipt = Receipt {
                    query_id: id,
                    session_id: q.session,
                    estimated_cost: q.estimated_cost,
                    actual_cost,
                    vouchers_consumed: q.consumed.clone(),
                    partial,
                    credit_after,
                };
                q.receipt = Some(receipt.clone());
                Ok(receipt)
            })
            .ok_or_else(|| Error::UnknownQuery(id.to_string()))??;

        self.metrics.record_query_settled(actual_cost);
        info!(
            "Query {id} settled for {client}: estimated {} actual {actual_cost}, {} vouchers consumed",
            receipt.estimated_cost,
            receipt.vouchers_consumed.len()
        );
        Ok(receipt)
    }

    async fn abort(&self, id: QueryId, forced: bool) -> Result<()> {
        let client = self.query(id)?.client;
        let _guard = self.gate.enter(&client).await?;
        let result = self.abort_locked(id, &client, forced).await;
        self.check_fatal(&client, result)
    }

    /// Abort under the gate.
    async fn abort_locked(&self, id: QueryId, client: &V::Client, forced: bool) -> Result<()> {
        let query = self.query(id)?;
        match query.state {
            QueryState::Aborted => return Ok(()),
            QueryState::Settled => return Err(Error::QuerySettled(id.to_string())),
            QueryState::Pending | QueryState::Locked => {}
        }
        if !query.released {
            self.balances.release(client, query.estimated_cost).await?;
            self.queries.update(id, |q| q.released = true);
        }
        let now = Instant::now();
        self.queries
            .update(id, |q| {
                q.forced = forced;
                q.transition(QueryState::Aborted, now)
            })
            .ok_or_else(|| Error::UnknownQuery(id.to_string()))??;
        self.metrics.record_query_aborted(forced);
        if forced {
            info!(
                "Query {id} of {client} force-aborted past its deadline, released {} atoms",
                query.estimated_cost
            );
        } else {
            debug!("Query {id} of {client} aborted, released {} atoms", query.estimated_cost);
        }
        Ok(())
    }

    /// Spend head vouchers while `unmarked` covers them, finishing any spend
    /// a failed call left behind first. Returns how many vouchers were spent.
    /// Caller holds the gate.
    async fn absorb(
        &self,
        client: &V::Client,
        mut unmarked: Atoms,
        query: Option<QueryId>,
    ) -> Result<usize> {
        let mut spent = 0;
        if let Some(after) = self.resume_spend(client).await? {
            unmarked = after;
            spent += 1;
        }
        for head in self
            .vouchers
            .unspent_vouchers_for(client, &self.vendor)
            .await?
        {
            if unmarked < head.atoms() {
                break;
            }
            unmarked = self.spend(client, head, query).await?;
            spent += 1;
        }
        Ok(spent)
    }

    /// Mark `head` spent and charge it against the unmarked cost, returning
    /// the new unmarked cost.
    async fn spend(&self, client: &V::Client, head: V, query: Option<QueryId>) -> Result<Atoms> {
        let id = head.id();
        let mut pending = PendingSpend {
            voucher: head,
            query,
            marked: false,
        };
        self.pending_spends
            .lock()
            .insert(client.clone(), pending.clone());
        self.vouchers.mark_spent(&id).await?;
        pending.marked = true;
        if let Some(p) = self.pending_spends.lock().get_mut(client) {
            p.marked = true;
        }
        self.complete_spend(client, pending).await
    }

    /// Finish a spend interrupted by a failed call. `None` if nothing was
    /// pending for `client`.
    async fn resume_spend(&self, client: &V::Client) -> Result<Option<Atoms>> {
        let Some(mut pending) = self.pending_spends.lock().get(client).cloned() else {
            return Ok(None);
        };
        let id = pending.voucher.id();
        debug!("Resuming interrupted spend of voucher {id}");
        if !pending.marked {
            if !self.vouchers.is_spent(&id).await? {
                self.vouchers.mark_spent(&id).await?;
            }
            pending.marked = true;
            if let Some(p) = self.pending_spends.lock().get_mut(client) {
                p.marked = true;
            }
        }
        self.complete_spend(client, pending).await.map(Some)
    }

    async fn complete_spend(&self, client: &V::Client, pending: PendingSpend<V>) -> Result<Atoms> {
        let id = pending.voucher.id();
        let unmarked = self
            .unmarked
            .reduce(client, pending.voucher.atoms())
            .await?;
        self.pending_spends.lock().remove(client);
        if let Some(query) = pending.query {
            self.queries.update(query, |q| q.consumed.push(id.clone()));
        }
        debug!("Voucher {id} spent");
        if !self.settlement.push(pending.voucher) {
            error!("Spent voucher {id} was refused by the settlement queue");
            return Err(InvariantViolation::NonceSequence {
                client: client.to_string(),
                detail: format!("spent voucher {id} is not newer than the settlement queue"),
            }
            .into());
        }
        Ok(unmarked)
    }

    fn open_session(&self, id: SessionId) -> Result<Session<V::Client, V::Vendor>> {
        let session = self
            .sessions
            .get(id)
            .ok_or_else(|| Error::UnknownSession(id.to_string()))?;
        if !session.is_open() {
            return Err(Error::SessionClosed(id.to_string()));
        }
        Ok(session)
    }

    fn query(&self, id: QueryId) -> Result<Query<V>> {
        self.queries
            .get(id)
            .ok_or_else(|| Error::UnknownQuery(id.to_string()))
    }

    /// Halt the client on invariant violations, pass everything else through.
    fn check_fatal<T>(&self, client: &V::Client, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                error!("Invariant violation for {client}: {e}");
                self.gate.halt(client, e.to_string());
            }
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{ExhaustionPolicy, Rounding};
    use crate::error::ErrorClass;
    use crate::oracle::ChainSnapshot;
    use crate::tracker::memory::MemoryOracle;
    use crate::voucher::testing::TestVoucher;
    use std::time::Duration;

    const CLIENT: u64 = 1;
    const VENDOR: u64 = 9;

    struct Harness {
        engine: Engine<TestVoucher>,
        oracle: Arc<MemoryOracle<u64>>,
        vouchers: Arc<MemoryVoucherTracker<TestVoucher>>,
        unmarked: Arc<MemoryCostTracker<u64>>,
        balances: Arc<MemoryBalanceTracker<u64>>,
    }

    impl Harness {
        /// Fail the next call of `op` on the named tracker.
        fn fail_next(&self, tracker: &str, op: &'static str) {
            match tracker {
                "vouchers" => self.vouchers.fail_next(op, 1),
                "unmarked" => self.unmarked.fail_next(op, 1),
                "balances" => self.balances.fail_next(op, 1),
                "oracle" => self.oracle.fail_next(1),
                other => panic!("unknown tracker {other}"),
            }
        }
    }

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.credit.expand_risk_factor = 1;
        // one atom per millihour
        config.pricing.hour_price = 1_000;
        config.pricing.rounding = Rounding::Down;
        config
    }

    fn harness_with(config: &GatewayConfig) -> Harness {
        let oracle = Arc::new(MemoryOracle::<u64>::new());
        oracle.set_snapshot(
            CLIENT,
            ChainSnapshot {
                collateral: 1000,
                subscribed_vendor_count: 4,
                subscribed: true,
                ..Default::default()
            },
        );
        let vouchers = Arc::new(MemoryVoucherTracker::<TestVoucher>::new());
        let unmarked = Arc::new(MemoryCostTracker::<u64>::new());
        let balances = Arc::new(MemoryBalanceTracker::<u64>::new());
        let collaborators = Collaborators {
            vouchers: Arc::clone(&vouchers) as _,
            unmarked: Arc::clone(&unmarked) as _,
            balances: Arc::clone(&balances) as _,
            oracle: Arc::clone(&oracle) as Arc<dyn ChainOracle<u64, u64>>,
        };
        Harness {
            engine: Engine::new(VENDOR, collaborators, config),
            oracle,
            vouchers,
            unmarked,
            balances,
        }
    }

    fn harness() -> Harness {
        harness_with(&config())
    }

    fn cost(atoms: u64) -> Usage {
        Usage::from_millihours_and_megabytes(atoms, 0)
    }

    #[tokio::test]
    async fn test_accept_session_rejects_without_state_change() {
        let h = harness();
        let result = h
            .engine
            .accept_session(TestVoucher::new(CLIENT, VENDOR, 2, 150))
            .await;
        assert!(matches!(
            result,
            Err(Error::Rejected(Rejection::NonceGap {
                expected: 1,
                got: 2
            }))
        ));
        assert_eq!(h.engine.open_sessions(), 0);
        assert_eq!(
            h.engine.credit_state(&CLIENT).await.expect("state"),
            CreditState::default()
        );
        assert_eq!(h.engine.metrics().sessions_rejected, 1);
    }

    #[tokio::test]
    async fn test_replayed_voucher_is_rejected() {
        let h = harness();
        let v = TestVoucher::new(CLIENT, VENDOR, 1, 150);
        h.engine.accept_session(v.clone()).await.expect("session");
        let result = h.engine.accept_session(v).await;
        assert!(matches!(
            result,
            Err(Error::Rejected(Rejection::NonceReplay { latest: 1, got: 1 }))
        ));
    }

    #[tokio::test]
    async fn test_oracle_failure_fails_closed() {
        let h = harness();
        let s = h
            .engine
            .accept_session(TestVoucher::new(CLIENT, VENDOR, 1, 150))
            .await
            .expect("session");
        h.oracle.set_available(false);
        let result = h.engine.accept_query(s, 10).await;
        let err = result.expect_err("must fail closed");
        assert_eq!(err.class(), ErrorClass::Infrastructure);
        assert_eq!(h.engine.credit_state(&CLIENT).await.expect("state").locked, 0);
    }

    #[tokio::test]
    async fn test_lapsed_subscription_refuses_queries() {
        let h = harness();
        let s = h
            .engine
            .accept_session(TestVoucher::new(CLIENT, VENDOR, 1, 150))
            .await
            .expect("session");
        h.oracle.set_snapshot(
            CLIENT,
            ChainSnapshot {
                collateral: 1000,
                subscribed_vendor_count: 4,
                subscribed: true,
                unsubscribe_queued: true,
                ..Default::default()
            },
        );
        let result = h.engine.accept_query(s, 10).await;
        assert!(matches!(result, Err(Error::Rejected(Rejection::NotSubscribed))));
    }

    #[tokio::test]
    async fn test_settle_consumes_across_vouchers() {
        let h = harness();
        let s = h
            .engine
            .accept_session(TestVoucher::new(CLIENT, VENDOR, 1, 100))
            .await
            .expect("session");
        h.engine
            .top_up(s, TestVoucher::new(CLIENT, VENDOR, 2, 100))
            .await
            .expect("top up");
        assert_eq!(h.engine.session(s).expect("session").chain_head, 2);

        let q = h.engine.accept_query(s, 150).await.expect("query");
        let receipt = h.engine.settle_query(q, cost(130)).await.expect("settle");
        assert_eq!(receipt.actual_cost, 130);
        assert_eq!(receipt.vouchers_consumed.len(), 1);
        assert_eq!(receipt.vouchers_consumed[0].nonce, 1);
        assert_eq!(receipt.partial.as_ref().map(|id| id.nonce), Some(2));
        assert_eq!(
            receipt.credit_after,
            CreditState {
                unspent: 100,
                unmarked: 30,
                locked: 0
            }
        );
        assert_eq!(h.engine.settlement().unsettled(&CLIENT).len(), 1);
    }

    #[tokio::test]
    async fn test_exact_cost_spends_voucher() {
        let h = harness();
        let s = h
            .engine
            .accept_session(TestVoucher::new(CLIENT, VENDOR, 1, 100))
            .await
            .expect("session");
        let q = h.engine.accept_query(s, 100).await.expect("query");
        let receipt = h.engine.settle_query(q, cost(100)).await.expect("settle");
        assert_eq!(receipt.vouchers_consumed.len(), 1);
        assert!(receipt.partial.is_none());
        assert_eq!(receipt.credit_after, CreditState::default());
        assert!(h.engine.head_voucher(&CLIENT).await.expect("head").is_none());
    }

    #[tokio::test]
    async fn test_arrears_absorbed_by_next_voucher() {
        let h = harness();
        let s = h
            .engine
            .accept_session(TestVoucher::new(CLIENT, VENDOR, 1, 100))
            .await
            .expect("session");
        let q = h.engine.accept_query(s, 90).await.expect("query");
        h.engine.settle_query(q, cost(120)).await.expect("settle");

        let snapshot = h.engine.credit_snapshot(&CLIENT).await.expect("snapshot");
        assert_eq!(snapshot.available(), 0);
        assert_eq!(snapshot.overdraft(), 20);

        h.engine
            .top_up(s, TestVoucher::new(CLIENT, VENDOR, 2, 100))
            .await
            .expect("top up");
        let state = h.engine.credit_state(&CLIENT).await.expect("state");
        assert_eq!(state.unspent, 100);
        assert_eq!(state.unmarked, 20);
        assert_eq!(h.engine.available_credit(&CLIENT).await.expect("credit"), 80);
    }

    #[tokio::test]
    async fn test_grace_policy_allows_credit_past_chain() {
        let mut config = config();
        config.credit.exhaustion_policy = ExhaustionPolicy::Grace;
        config.credit.grace_atoms = 30;
        let h = harness_with(&config);
        let s = h
            .engine
            .accept_session(TestVoucher::new(CLIENT, VENDOR, 1, 100))
            .await
            .expect("session");
        let q = h.engine.accept_query(s, 100).await.expect("query");
        h.engine.settle_query(q, cost(100)).await.expect("settle");

        let q = h.engine.accept_query(s, 30).await.expect("grace query");
        let result = h.engine.accept_query(s, 1).await;
        assert!(matches!(result, Err(Error::InsufficientCredit { .. })));
        h.engine.settle_query(q, cost(25)).await.expect("settle");
        assert_eq!(h.engine.available_credit(&CLIENT).await.expect("credit"), 5);
    }

    #[tokio::test]
    async fn test_reject_policy_refuses_past_chain() {
        let h = harness();
        let s = h
            .engine
            .accept_session(TestVoucher::new(CLIENT, VENDOR, 1, 100))
            .await
            .expect("session");
        let q = h.engine.accept_query(s, 100).await.expect("query");
        h.engine.settle_query(q, cost(100)).await.expect("settle");
        let result = h.engine.accept_query(s, 1).await;
        assert!(matches!(
            result,
            Err(Error::InsufficientCredit {
                requested: 1,
                available: 0
            })
        ));
    }

    #[tokio::test]
    async fn test_abort_semantics() {
        let h = harness();
        let s = h
            .engine
            .accept_session(TestVoucher::new(CLIENT, VENDOR, 1, 150))
            .await
            .expect("session");
        let q = h.engine.accept_query(s, 50).await.expect("query");
        h.engine.abort_query(q).await.expect("abort");
        h.engine.abort_query(q).await.expect("abort is idempotent");
        assert_eq!(h.engine.credit_state(&CLIENT).await.expect("state").locked, 0);
        assert!(matches!(
            h.engine.settle_query(q, cost(10)).await,
            Err(Error::QueryAborted(_))
        ));

        let q = h.engine.accept_query(s, 50).await.expect("query");
        h.engine.settle_query(q, cost(10)).await.expect("settle");
        assert!(matches!(
            h.engine.abort_query(q).await,
            Err(Error::QuerySettled(_))
        ));
        assert!(matches!(
            h.engine.abort_query(QueryId(999)).await,
            Err(Error::UnknownQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_session_refuses_queries_but_settles() {
        let h = harness();
        let s = h
            .engine
            .accept_session(TestVoucher::new(CLIENT, VENDOR, 1, 150))
            .await
            .expect("session");
        let q = h.engine.accept_query(s, 50).await.expect("query");
        h.engine.close_session(s).expect("close");
        h.engine.close_session(s).expect("close is idempotent");
        assert!(matches!(
            h.engine.accept_query(s, 10).await,
            Err(Error::SessionClosed(_))
        ));
        h.engine.settle_query(q, cost(40)).await.expect("settle");
        assert!(matches!(
            h.engine.close_session(SessionId(999)),
            Err(Error::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_invariant_violation_halts_client() {
        let h = harness();
        let s = h
            .engine
            .accept_session(TestVoucher::new(CLIENT, VENDOR, 1, 150))
            .await
            .expect("session");
        let q = h.engine.accept_query(s, 50).await.expect("query");
        // corrupt the locked balance behind the engine's back
        h.balances.release(&CLIENT, 50).await.expect("release");

        let err = h.engine.settle_query(q, cost(10)).await.expect_err("must fail");
        assert!(err.is_fatal());
        assert!(h.engine.is_halted(&CLIENT));
        assert!(matches!(
            h.engine.accept_query(s, 1).await,
            Err(Error::ClientHalted(_))
        ));

        assert!(h.engine.resume_client(&CLIENT));
        h.balances.lock(&CLIENT, 50).await.expect("repair");
        h.engine.settle_query(q, cost(10)).await.expect("settle after repair");
    }

    #[tokio::test]
    async fn test_top_up_from_other_client_is_rejected() {
        let h = harness();
        let s = h
            .engine
            .accept_session(TestVoucher::new(CLIENT, VENDOR, 1, 150))
            .await
            .expect("session");
        let result = h.engine.top_up(s, TestVoucher::new(2, VENDOR, 1, 150)).await;
        assert!(matches!(result, Err(Error::UnknownSession(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_receipt_is_stable_across_time() {
        let h = harness();
        let s = h
            .engine
            .accept_session(TestVoucher::new(CLIENT, VENDOR, 1, 150))
            .await
            .expect("session");
        let q = h.engine.accept_query(s, 50).await.expect("query");
        let first = h.engine.settle_query(q, cost(45)).await.expect("settle");
        tokio::time::advance(Duration::from_secs(10)).await;
        let second = h.engine.settle_query(q, cost(999)).await.expect("retry");
        assert_eq!(second.actual_cost, 45);
        assert_eq!(second.credit_after, first.credit_after);
        assert_eq!(h.engine.metrics().queries_settled, 1);
    }
    /// V1 and V2 of 100 atoms each, 150 locked in one query.
    async fn two_voucher_query(h: &Harness) -> QueryId {
        let s = h
            .engine
            .accept_session(TestVoucher::new(CLIENT, VENDOR, 1, 100))
            .await
            .expect("session");
        h.engine
            .top_up(s, TestVoucher::new(CLIENT, VENDOR, 2, 100))
            .await
            .expect("top up");
        h.engine.accept_query(s, 150).await.expect("query")
    }

    #[tokio::test]
    async fn test_failed_reduce_is_resumed_not_recharged() {
        let h = harness();
        let q = two_voucher_query(&h).await;

        h.unmarked.fail_next("reduce", 1);
        let err = h
            .engine
            .settle_query(q, cost(130))
            .await
            .expect_err("reduce fails");
        assert!(matches!(err, Error::TrackerUnavailable(_)));
        assert!(!h.engine.is_halted(&CLIENT));

        let receipt = h.engine.settle_query(q, cost(130)).await.expect("retry");
        assert_eq!(receipt.actual_cost, 130);
        let consumed: Vec<u64> = receipt.vouchers_consumed.iter().map(|id| id.nonce).collect();
        assert_eq!(consumed, vec![1]);
        assert_eq!(
            receipt.credit_after,
            CreditState {
                unspent: 100,
                unmarked: 30,
                locked: 0
            }
        );
        assert_eq!(h.engine.settlement().unsettled(&CLIENT).len(), 1);
    }

    #[tokio::test]
    async fn test_settle_recovers_from_each_tracker_failure() {
        let fault_points = [
            ("balances", "release"),
            ("unmarked", "add"),
            ("vouchers", "unspent_vouchers_for"),
            ("vouchers", "mark_spent"),
            ("unmarked", "reduce"),
            ("unmarked", "get"),
            ("balances", "locked"),
        ];
        for (tracker, op) in fault_points {
            let h = harness();
            let q = two_voucher_query(&h).await;

            h.fail_next(tracker, op);
            let err = h
                .engine
                .settle_query(q, cost(130))
                .await
                .expect_err("injected failure");
            assert!(!err.is_fatal(), "{tracker}.{op}: {err}");

            let receipt = h
                .engine
                .settle_query(q, cost(130))
                .await
                .unwrap_or_else(|e| panic!("{tracker}.{op} retry: {e}"));
            assert_eq!(receipt.actual_cost, 130, "{tracker}.{op}");
            assert_eq!(receipt.vouchers_consumed.len(), 1, "{tracker}.{op}");
            assert_eq!(receipt.vouchers_consumed[0].nonce, 1, "{tracker}.{op}");
            assert_eq!(receipt.partial.as_ref().map(|id| id.nonce), Some(2));
            let expected = CreditState {
                unspent: 100,
                unmarked: 30,
                locked: 0,
            };
            assert_eq!(receipt.credit_after, expected, "{tracker}.{op}");
            assert_eq!(
                h.engine.credit_state(&CLIENT).await.expect("state"),
                expected,
                "{tracker}.{op}"
            );
            assert_eq!(h.engine.settlement().unsettled(&CLIENT).len(), 1);
            assert_eq!(h.engine.metrics().queries_settled, 1);
        }
    }

    #[tokio::test]
    async fn test_abort_recovers_from_release_failure() {
        let h = harness();
        let s = h
            .engine
            .accept_session(TestVoucher::new(CLIENT, VENDOR, 1, 150))
            .await
            .expect("session");
        let q = h.engine.accept_query(s, 50).await.expect("query");

        h.fail_next("balances", "release");
        assert!(h.engine.abort_query(q).await.is_err());
        assert_eq!(h.engine.query_info(q).expect("query").state, QueryState::Locked);
        assert_eq!(h.engine.credit_state(&CLIENT).await.expect("state").locked, 50);

        h.engine.abort_query(q).await.expect("retry");
        assert_eq!(h.engine.credit_state(&CLIENT).await.expect("state").locked, 0);
        assert_eq!(h.engine.metrics().queries_aborted, 1);
    }

    #[tokio::test]
    async fn test_failed_accept_session_can_be_retried() {
        let fault_points = [
            ("vouchers", "latest_nonce"),
            ("oracle", "snapshot"),
            ("vouchers", "is_spent"),
            ("unmarked", "get"),
            ("vouchers", "insert"),
        ];
        for (tracker, op) in fault_points {
            let h = harness();
            let v = TestVoucher::new(CLIENT, VENDOR, 1, 100);

            h.fail_next(tracker, op);
            let err = h
                .engine
                .accept_session(v.clone())
                .await
                .expect_err("injected failure");
            assert_eq!(err.class(), ErrorClass::Infrastructure, "{tracker}.{op}");
            assert_eq!(
                h.engine.credit_state(&CLIENT).await.expect("state"),
                CreditState::default(),
                "{tracker}.{op}"
            );
            assert_eq!(h.engine.open_sessions(), 0);

            h.engine
                .accept_session(v)
                .await
                .unwrap_or_else(|e| panic!("{tracker}.{op} retry: {e}"));
            assert_eq!(
                h.engine.credit_state(&CLIENT).await.expect("state").unspent,
                100
            );
            assert_eq!(h.engine.metrics().sessions_accepted, 1);
        }
    }

    #[tokio::test]
    async fn test_recorded_voucher_opens_session_when_arrears_absorb_fails() {
        let h = harness();
        let s = h
            .engine
            .accept_session(TestVoucher::new(CLIENT, VENDOR, 1, 100))
            .await
            .expect("session");
        let q = h.engine.accept_query(s, 90).await.expect("query");
        h.engine.settle_query(q, cost(120)).await.expect("settle");

        // 20 atoms of arrears cover all of V2
        h.fail_next("unmarked", "reduce");
        h.engine
            .top_up(s, TestVoucher::new(CLIENT, VENDOR, 2, 10))
            .await
            .expect("voucher is recorded");
        assert_eq!(h.engine.session(s).expect("session").chain_head, 2);

        h.engine
            .top_up(s, TestVoucher::new(CLIENT, VENDOR, 3, 100))
            .await
            .expect("top up");
        assert_eq!(
            h.engine.credit_state(&CLIENT).await.expect("state"),
            CreditState {
                unspent: 100,
                unmarked: 10,
                locked: 0
            }
        );
        let queued: Vec<u64> = h
            .engine
            .settlement()
            .unsettled(&CLIENT)
            .iter()
            .map(|v| v.nonce)
            .collect();
        assert_eq!(queued, vec![1, 2]);
        assert_eq!(h.engine.available_credit(&CLIENT).await.expect("credit"), 90);
    }

    #[tokio::test]
    async fn test_interrupted_spend_is_finished_before_reserving() {
        let h = harness();
        let q = two_voucher_query(&h).await;
        h.fail_next("unmarked", "reduce");
        assert!(h.engine.settle_query(q, cost(130)).await.is_err());

        // a new reservation sees the finished spend: 100 - 30 = 70
        let s = h.engine.query_info(q).expect("query").session;
        assert!(matches!(
            h.engine.accept_query(s, 71).await,
            Err(Error::InsufficientCredit {
                requested: 71,
                available: 70
            })
        ));
        let receipt = h.engine.settle_query(q, cost(130)).await.expect("retry");
        assert_eq!(receipt.vouchers_consumed.len(), 1);
        assert_eq!(receipt.credit_after.unmarked, 30);
    }

    #[tokio::test]
    async fn test_refused_settlement_push_halts_client() {
        let h = harness();
        assert!(h
            .engine
            .settlement()
            .push(TestVoucher::new(CLIENT, VENDOR, 5, 1)));
        let s = h
            .engine
            .accept_session(TestVoucher::new(CLIENT, VENDOR, 1, 100))
            .await
            .expect("session");
        let q = h.engine.accept_query(s, 100).await.expect("query");

        let err = h
            .engine
            .settle_query(q, cost(100))
            .await
            .expect_err("queue refuses nonce 1 after 5");
        assert!(matches!(
            err,
            Error::Invariant(InvariantViolation::NonceSequence { .. })
        ));
        assert!(h.engine.is_halted(&CLIENT));
    }
}
