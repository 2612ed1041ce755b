//! Read-only view of on-chain client state.
//!
//! The chain is the ground truth for collateral and subscriptions but the
//! view of it is laggy. [`CachedOracle`] bounds that lag with a TTL and never
//! serves an expired snapshot.

mod cache;

pub use cache::{CachedOracle, OracleCacheStats};

use crate::voucher::Atoms;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Oracle failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
    /// The chain could not be read.
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
}

/// On-chain state of a client as seen by one vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainSnapshot {
    /// Collateral locked on chain.
    pub collateral: Atoms,
    /// Collateral queued for withdrawal (leaves once the queue expires).
    pub pending_withdrawal: Atoms,
    /// Number of vendors the client is subscribed to.
    pub subscribed_vendor_count: u64,
    /// Whether the client is subscribed to the reading vendor.
    pub subscribed: bool,
    /// Whether an unsubscribe from the reading vendor is queued.
    pub unsubscribe_queued: bool,
}

impl ChainSnapshot {
    /// Collateral remaining once queued withdrawals complete.
    #[must_use]
    pub fn effective_collateral(&self) -> Atoms {
        self.collateral.saturating_sub(self.pending_withdrawal)
    }

    /// Subscription is active and not about to end.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.subscribed && !self.unsubscribe_queued
    }
}

/// Source of [`ChainSnapshot`] values.
#[async_trait]
pub trait ChainOracle<C, K>: Send + Sync
where
    C: Sync,
    K: Sync,
{
    /// Read the current snapshot for `client` as seen by `vendor`.
    ///
    /// # Errors
    ///
    /// Returns [`OracleError::Unavailable`] if the chain cannot be read.
    async fn snapshot(&self, client: &C, vendor: &K) -> Result<ChainSnapshot, OracleError>;
}

#[async_trait]
impl<C, K, T> ChainOracle<C, K> for Arc<T>
where
    C: Sync,
    K: Sync,
    T: ChainOracle<C, K> + ?Sized,
{
    async fn snapshot(&self, client: &C, vendor: &K) -> Result<ChainSnapshot, OracleError> {
        (**self).snapshot(client, vendor).await
    }
}
