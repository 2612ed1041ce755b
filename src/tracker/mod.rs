//! Storage collaborators for voucher and balance state.
//!
//! The engine reads and drives three trackers:
//!
//! ```text
//! VoucherTracker            per (client, vendor): accepted vouchers, spent marks
//! UnmarkedCostTracker       per client: dust charged against the head voucher
//! OutstandingBalanceTracker per client: atoms locked by in-flight queries
//! ```
//!
//! Each call must be atomic on its own. Sequences of calls for one client are
//! serialized by the engine through [`ClientGate`]. Implementations report
//! accounting errors as [`TrackerError::Invariant`] and never clamp.

pub mod gate;
pub mod memory;

pub use gate::{ClientGate, ClientGuard};

use crate::error::InvariantViolation;
use crate::voucher::{Atoms, IdOf, Voucher};
use async_trait::async_trait;
use thiserror::Error;

/// Tracker failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// The backing store could not be reached.
    #[error("tracker unavailable: {0}")]
    Unavailable(String),

    /// The requested change would break an accounting invariant.
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

/// Durable record of accepted vouchers.
#[async_trait]
pub trait VoucherTracker<V: Voucher>: Send + Sync {
    /// Highest accepted nonce for the pair, `None` if nothing was accepted.
    async fn latest_nonce(
        &self,
        client: &V::Client,
        vendor: &V::Vendor,
    ) -> Result<Option<u64>, TrackerError>;

    /// Record a newly accepted voucher.
    ///
    /// Returns `false` without changing anything if a voucher with the same
    /// nonce is already recorded.
    async fn insert(&self, voucher: V) -> Result<bool, TrackerError>;

    /// Whether the voucher is recorded as spent.
    async fn is_spent(&self, id: &IdOf<V>) -> Result<bool, TrackerError>;

    /// Mark the voucher spent.
    ///
    /// Marking a voucher twice is [`InvariantViolation::DoubleSpend`].
    async fn mark_spent(&self, id: &IdOf<V>) -> Result<(), TrackerError>;

    /// Vouchers not yet spent, oldest first.
    async fn unspent_vouchers_for(
        &self,
        client: &V::Client,
        vendor: &V::Vendor,
    ) -> Result<Vec<V>, TrackerError>;
}

/// Dust not yet chargeable to a whole voucher.
#[async_trait]
pub trait UnmarkedCostTracker<C: Sync>: Send + Sync {
    /// Current unmarked cost.
    async fn get(&self, client: &C) -> Result<Atoms, TrackerError>;

    /// Atomically add to the unmarked cost, returning the new value.
    async fn add(&self, client: &C, atoms: Atoms) -> Result<Atoms, TrackerError>;

    /// Atomically subtract from the unmarked cost, returning the new value.
    ///
    /// Going below zero is [`InvariantViolation::NegativeUnmarkedCost`].
    async fn reduce(&self, client: &C, atoms: Atoms) -> Result<Atoms, TrackerError>;

    /// Reset the unmarked cost to zero.
    async fn reset(&self, client: &C) -> Result<(), TrackerError>;
}

/// Atoms reserved by in-flight queries.
#[async_trait]
pub trait OutstandingBalanceTracker<C: Sync>: Send + Sync {
    /// Reserve `atoms`, returning the new locked total.
    async fn lock(&self, client: &C, atoms: Atoms) -> Result<Atoms, TrackerError>;

    /// Release `atoms`, returning the new locked total.
    ///
    /// Releasing more than is locked is [`InvariantViolation::NegativeLockedCost`].
    async fn release(&self, client: &C, atoms: Atoms) -> Result<Atoms, TrackerError>;

    /// Currently locked atoms.
    async fn locked(&self, client: &C) -> Result<Atoms, TrackerError>;
}
