//! Spent vouchers awaiting downstream settlement.
//!
//! The engine pushes each voucher it marks spent. A settlement job takes the
//! unsettled prefix as a [`SettlementBatch`], submits it elsewhere, and then
//! completes or fails it. At most one batch per client is in flight. Records
//! are kept after settlement, tagged with the job's external reference.

use crate::voucher::{Atoms, Voucher};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// A voucher together with the reference of the job that settled it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledVoucher<V> {
    /// The settled voucher.
    pub voucher: V,
    /// External reference, e.g. a transaction hash.
    pub reference: String,
}

/// Vouchers handed to a settlement job.
#[derive(Debug, Clone)]
pub struct SettlementBatch<V> {
    /// Vouchers in ascending nonce order.
    pub vouchers: Vec<V>,
    /// Highest nonce in the batch.
    pub up_to_nonce: u64,
    /// Sum of voucher atoms.
    pub total_atoms: Atoms,
}

#[derive(Debug)]
struct ClientSettlement<V> {
    unsettled: Vec<V>,
    settled: Vec<SettledVoucher<V>>,
    in_flight: Option<u64>,
}

impl<V> Default for ClientSettlement<V> {
    fn default() -> Self {
        Self {
            unsettled: Vec::new(),
            settled: Vec::new(),
            in_flight: None,
        }
    }
}

/// Per-client queue of spent, unsettled vouchers.
#[derive(Debug)]
pub struct SettlementQueue<V: Voucher> {
    clients: Mutex<HashMap<V::Client, ClientSettlement<V>>>,
}

impl<V: Voucher> Default for SettlementQueue<V> {
    fn default() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Voucher> SettlementQueue<V> {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a spent voucher. Returns false if it is not newer than the
    /// last queued voucher for the client.
    pub fn push(&self, voucher: V) -> bool {
        let mut clients = self.clients.lock();
        let entry = clients.entry(voucher.client().clone()).or_default();
        let last = entry
            .unsettled
            .last()
            .or_else(|| entry.settled.last().map(|s| &s.voucher))
            .map(Voucher::nonce);
        if last.is_some_and(|n| voucher.nonce() <= n) {
            warn!("Ignoring out-of-order spent voucher {}", voucher.id());
            return false;
        }
        debug!("Queued spent voucher {} for settlement", voucher.id());
        entry.unsettled.push(voucher);
        true
    }

    /// Start a batch covering every unsettled voucher of `client`.
    ///
    /// Returns `None` if a batch is already in flight or nothing is queued.
    pub fn begin_batch(&self, client: &V::Client) -> Option<SettlementBatch<V>> {
        let mut clients = self.clients.lock();
        let entry = clients.get_mut(client)?;
        if entry.in_flight.is_some() {
            return None;
        }
        let up_to_nonce = entry.unsettled.last()?.nonce();
        entry.in_flight = Some(up_to_nonce);
        let total_atoms = entry
            .unsettled
            .iter()
            .fold(0, |sum: Atoms, v| sum.saturating_add(v.atoms()));
        debug!(
            "Settlement batch for {client} up to nonce {up_to_nonce}: {} vouchers, {total_atoms} atoms",
            entry.unsettled.len()
        );
        Some(SettlementBatch {
            vouchers: entry.unsettled.clone(),
            up_to_nonce,
            total_atoms,
        })
    }

    /// Mark the in-flight batch settled under `reference`.
    ///
    /// Returns the number of vouchers settled, or `None` if no batch was in
    /// flight.
    pub fn complete_batch(&self, client: &V::Client, reference: &str) -> Option<usize> {
        let mut clients = self.clients.lock();
        let entry = clients.get_mut(client)?;
        let up_to_nonce = entry.in_flight.take()?;
        let split = entry
            .unsettled
            .iter()
            .position(|v| v.nonce() > up_to_nonce)
            .unwrap_or(entry.unsettled.len());
        let done: Vec<V> = entry.unsettled.drain(..split).collect();
        let count = done.len();
        entry
            .settled
            .extend(done.into_iter().map(|voucher| SettledVoucher {
                voucher,
                reference: reference.to_string(),
            }));
        info!("Settled {count} vouchers of {client} up to nonce {up_to_nonce} in {reference}");
        Some(count)
    }

    /// Abandon the in-flight batch. Its vouchers stay unsettled.
    pub fn fail_batch(&self, client: &V::Client) -> bool {
        let failed = self
            .clients
            .lock()
            .get_mut(client)
            .and_then(|e| e.in_flight.take())
            .is_some();
        if failed {
            warn!("Settlement batch for {client} failed");
        }
        failed
    }

    /// Returns true if `client` has a batch in flight.
    #[must_use]
    pub fn has_batch_in_flight(&self, client: &V::Client) -> bool {
        self.clients
            .lock()
            .get(client)
            .is_some_and(|e| e.in_flight.is_some())
    }

    /// Spent vouchers not yet settled.
    #[must_use]
    pub fn unsettled(&self, client: &V::Client) -> Vec<V> {
        self.clients
            .lock()
            .get(client)
            .map(|e| e.unsettled.clone())
            .unwrap_or_default()
    }

    /// Settled vouchers with their references.
    #[must_use]
    pub fn settled(&self, client: &V::Client) -> Vec<SettledVoucher<V>> {
        self.clients
            .lock()
            .get(client)
            .map(|e| e.settled.clone())
            .unwrap_or_default()
    }
}
