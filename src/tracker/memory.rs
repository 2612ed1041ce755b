//! In-memory collaborators.
//!
//! Concurrency-safe, process-local implementations of the trackers and of
//! [`ChainOracle`]. Suitable for tests, demos, and single-process deployments
//! that snapshot state elsewhere. Every accepted voucher is kept forever.
//! Each tracker can be switched offline or told to fail a named call.

use crate::error::InvariantViolation;
use crate::oracle::{ChainOracle, ChainSnapshot, OracleError};
use crate::tracker::{OutstandingBalanceTracker, TrackerError, UnmarkedCostTracker, VoucherTracker};
use crate::voucher::{Atoms, IdOf, Voucher};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Fault switches shared by the in-memory trackers.
///
/// Operations are named after the trait method they fail (`"insert"`,
/// `"reduce"`, ...).
#[derive(Debug)]
struct Faults {
    store: &'static str,
    available: AtomicBool,
    pending: Mutex<HashMap<&'static str, u32>>,
}

impl Faults {
    fn new(store: &'static str) -> Self {
        Self {
            store,
            available: AtomicBool::new(true),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn fail_next(&self, op: &'static str, n: u32) {
        self.pending.lock().insert(op, n);
    }

    fn check(&self, op: &'static str) -> Result<(), TrackerError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TrackerError::Unavailable(format!("{} offline", self.store)));
        }
        let mut pending = self.pending.lock();
        if let Some(n) = pending.get_mut(op).filter(|n| **n > 0) {
            *n -= 1;
            return Err(TrackerError::Unavailable(format!(
                "injected {op} failure in {}",
                self.store
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct VoucherChain<V> {
    /// Ascending by nonce, gapless.
    vouchers: Vec<V>,
    spent: BTreeSet<u64>,
}

impl<V> Default for VoucherChain<V> {
    fn default() -> Self {
        Self {
            vouchers: Vec::new(),
            spent: BTreeSet::new(),
        }
    }
}

/// In-memory [`VoucherTracker`].
#[derive(Debug)]
pub struct MemoryVoucherTracker<V: Voucher> {
    chains: Mutex<HashMap<(V::Client, V::Vendor), VoucherChain<V>>>,
    faults: Faults,
}

impl<V: Voucher> Default for MemoryVoucherTracker<V> {
    fn default() -> Self {
        Self {
            chains: Mutex::new(HashMap::new()),
            faults: Faults::new("voucher store"),
        }
    }
}

impl<V: Voucher> MemoryVoucherTracker<V> {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.faults.set_available(available);
    }

    /// Fail the next `n` calls of `op`.
    pub fn fail_next(&self, op: &'static str, n: u32) {
        self.faults.fail_next(op, n);
    }

    /// Every voucher ever accepted for the pair, spent or not.
    #[must_use]
    pub fn all_vouchers(&self, client: &V::Client, vendor: &V::Vendor) -> Vec<V> {
        self.chains
            .lock()
            .get(&(client.clone(), vendor.clone()))
            .map(|c| c.vouchers.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl<V: Voucher> VoucherTracker<V> for MemoryVoucherTracker<V> {
    async fn latest_nonce(
        &self,
        client: &V::Client,
        vendor: &V::Vendor,
    ) -> Result<Option<u64>, TrackerError> {
        self.faults.check("latest_nonce")?;
        Ok(self
            .chains
            .lock()
            .get(&(client.clone(), vendor.clone()))
            .and_then(|c| c.vouchers.last())
            .map(Voucher::nonce))
    }

    async fn insert(&self, voucher: V) -> Result<bool, TrackerError> {
        self.faults.check("insert")?;
        let mut chains = self.chains.lock();
        let chain = chains
            .entry((voucher.client().clone(), voucher.vendor().clone()))
            .or_default();
        if let Some(last) = chain.vouchers.last() {
            if voucher.nonce() <= last.nonce() {
                return Ok(false);
            }
            if voucher.nonce() != last.nonce() + 1 {
                return Err(InvariantViolation::NonceSequence {
                    client: voucher.client().to_string(),
                    detail: format!(
                        "insert of nonce {} after latest {}",
                        voucher.nonce(),
                        last.nonce()
                    ),
                }
                .into());
            }
        }
        chain.vouchers.push(voucher);
        Ok(true)
    }

    async fn is_spent(&self, id: &IdOf<V>) -> Result<bool, TrackerError> {
        self.faults.check("is_spent")?;
        Ok(self
            .chains
            .lock()
            .get(&(id.client.clone(), id.vendor.clone()))
            .is_some_and(|c| c.spent.contains(&id.nonce)))
    }

    async fn mark_spent(&self, id: &IdOf<V>) -> Result<(), TrackerError> {
        self.faults.check("mark_spent")?;
        let mut chains = self.chains.lock();
        let chain = chains
            .get_mut(&(id.client.clone(), id.vendor.clone()))
            .filter(|c| c.vouchers.iter().any(|v| v.nonce() == id.nonce))
            .ok_or_else(|| InvariantViolation::NonceSequence {
                client: id.client.to_string(),
                detail: format!("mark_spent of unknown nonce {}", id.nonce),
            })?;
        if !chain.spent.insert(id.nonce) {
            return Err(InvariantViolation::DoubleSpend {
                voucher: id.to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn unspent_vouchers_for(
        &self,
        client: &V::Client,
        vendor: &V::Vendor,
    ) -> Result<Vec<V>, TrackerError> {
        self.faults.check("unspent_vouchers_for")?;
        Ok(self
            .chains
            .lock()
            .get(&(client.clone(), vendor.clone()))
            .map(|c| {
                c.vouchers
                    .iter()
                    .filter(|v| !c.spent.contains(&v.nonce()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// In-memory [`UnmarkedCostTracker`].
#[derive(Debug)]
pub struct MemoryCostTracker<C> {
    costs: Mutex<HashMap<C, Atoms>>,
    faults: Faults,
}

impl<C> Default for MemoryCostTracker<C> {
    fn default() -> Self {
        Self {
            costs: Mutex::new(HashMap::new()),
            faults: Faults::new("unmarked cost store"),
        }
    }
}

impl<C> MemoryCostTracker<C> {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.faults.set_available(available);
    }

    /// Fail the next `n` calls of `op`.
    pub fn fail_next(&self, op: &'static str, n: u32) {
        self.faults.fail_next(op, n);
    }
}

#[async_trait]
impl<C> UnmarkedCostTracker<C> for MemoryCostTracker<C>
where
    C: Clone + Eq + Hash + Display + Send + Sync,
{
    async fn get(&self, client: &C) -> Result<Atoms, TrackerError> {
        self.faults.check("get")?;
        Ok(self.costs.lock().get(client).copied().unwrap_or(0))
    }

    async fn add(&self, client: &C, atoms: Atoms) -> Result<Atoms, TrackerError> {
        self.faults.check("add")?;
        let mut costs = self.costs.lock();
        let cost = costs.entry(client.clone()).or_insert(0);
        *cost = cost
            .checked_add(atoms)
            .ok_or_else(|| InvariantViolation::CostOverflow {
                client: client.to_string(),
                counter: "unmarked",
                current: *cost,
                add: atoms,
            })?;
        Ok(*cost)
    }

    async fn reduce(&self, client: &C, atoms: Atoms) -> Result<Atoms, TrackerError> {
        self.faults.check("reduce")?;
        let mut costs = self.costs.lock();
        let cost = costs.entry(client.clone()).or_insert(0);
        *cost = cost
            .checked_sub(atoms)
            .ok_or_else(|| InvariantViolation::NegativeUnmarkedCost {
                client: client.to_string(),
                unmarked: *cost,
                reduce: atoms,
            })?;
        Ok(*cost)
    }

    async fn reset(&self, client: &C) -> Result<(), TrackerError> {
        self.faults.check("reset")?;
        self.costs.lock().remove(client);
        Ok(())
    }
}

/// In-memory [`OutstandingBalanceTracker`].
#[derive(Debug)]
pub struct MemoryBalanceTracker<C> {
    locked: Mutex<HashMap<C, Atoms>>,
    faults: Faults,
}

impl<C> Default for MemoryBalanceTracker<C> {
    fn default() -> Self {
        Self {
            locked: Mutex::new(HashMap::new()),
            faults: Faults::new("balance store"),
        }
    }
}

impl<C> MemoryBalanceTracker<C> {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.faults.set_available(available);
    }

    /// Fail the next `n` calls of `op`.
    pub fn fail_next(&self, op: &'static str, n: u32) {
        self.faults.fail_next(op, n);
    }
}

#[async_trait]
impl<C> OutstandingBalanceTracker<C> for MemoryBalanceTracker<C>
where
    C: Clone + Eq + Hash + Display + Send + Sync,
{
    async fn lock(&self, client: &C, atoms: Atoms) -> Result<Atoms, TrackerError> {
        self.faults.check("lock")?;
        let mut locked = self.locked.lock();
        let value = locked.entry(client.clone()).or_insert(0);
        *value = value
            .checked_add(atoms)
            .ok_or_else(|| InvariantViolation::CostOverflow {
                client: client.to_string(),
                counter: "locked",
                current: *value,
                add: atoms,
            })?;
        Ok(*value)
    }

    async fn release(&self, client: &C, atoms: Atoms) -> Result<Atoms, TrackerError> {
        self.faults.check("release")?;
        let mut locked = self.locked.lock();
        let value = locked.entry(client.clone()).or_insert(0);
        *value = value
            .checked_sub(atoms)
            .ok_or_else(|| InvariantViolation::NegativeLockedCost {
                client: client.to_string(),
                locked: *value,
                release: atoms,
            })?;
        Ok(*value)
    }

    async fn locked(&self, client: &C) -> Result<Atoms, TrackerError> {
        self.faults.check("locked")?;
        Ok(self.locked.lock().get(client).copied().unwrap_or(0))
    }
}

/// In-memory [`ChainOracle`] with fault injection.
///
/// Unknown clients read as an empty snapshot (no collateral, no subscription).
#[derive(Debug)]
pub struct MemoryOracle<C> {
    snapshots: Mutex<HashMap<C, ChainSnapshot>>,
    available: AtomicBool,
    fail_next: AtomicU32,
    reads: AtomicU64,
}

impl<C> Default for MemoryOracle<C> {
    fn default() -> Self {
        Self {
            snapshots: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            reads: AtomicU64::new(0),
        }
    }
}

impl<C: Eq + Hash> MemoryOracle<C> {
    /// Create an oracle with no clients.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the snapshot returned for `client`.
    pub fn set_snapshot(&self, client: C, snapshot: ChainSnapshot) {
        self.snapshots.lock().insert(client, snapshot);
    }

    /// Make every read fail (`false`) or succeed (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` reads.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of reads attempted, failed ones included.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<C, K> ChainOracle<C, K> for MemoryOracle<C>
where
    C: Eq + Hash + Send + Sync,
    K: Sync,
{
    async fn snapshot(&self, client: &C, _vendor: &K) -> Result<ChainSnapshot, OracleError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("chain offline".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(OracleError::Unavailable("injected failure".to_string()));
        }
        Ok(self
            .snapshots
            .lock()
            .get(client)
            .copied()
            .unwrap_or_default())
    }
}
