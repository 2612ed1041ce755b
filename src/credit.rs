//! Spendable credit.
//!
//! ```text
//! cap       = effective_collateral / (subscribed_vendor_count + expand_risk_factor)
//! raw       = unspent + grace - unmarked - locked
//! available = min(raw, cap)
//! ```
//!
//! `unspent` is the full value of every voucher not yet spent, `unmarked` is
//! the dust charged against the head voucher, and `locked` is what in-flight
//! queries have reserved. Everything is recomputed on each call from the
//! trackers and a fresh [`ChainSnapshot`]. Oracle failures are returned to the
//! caller.

use crate::config::CreditConfig;
use crate::error::Result;
use crate::oracle::{ChainOracle, ChainSnapshot};
use crate::tracker::{OutstandingBalanceTracker, UnmarkedCostTracker, VoucherTracker};
use crate::voucher::{Atoms, Voucher, VoucherState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Collateral a single vendor may rely on.
///
/// Zero if the divisor is zero.
#[must_use]
pub fn risk_adjusted_cap(snapshot: &ChainSnapshot, expand_risk_factor: u64) -> Atoms {
    let exposure = snapshot
        .subscribed_vendor_count
        .saturating_add(expand_risk_factor);
    snapshot
        .effective_collateral()
        .checked_div(exposure)
        .unwrap_or(0)
}

/// Tracker-side credit figures for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreditState {
    /// Full value of vouchers not yet spent.
    pub unspent: Atoms,
    /// Dust charged against the head voucher, or arrears once the chain is exhausted.
    pub unmarked: Atoms,
    /// Atoms reserved by locked queries.
    pub locked: Atoms,
}

impl CreditState {
    /// Credit left on the voucher chain plus `grace`, floored at zero.
    #[must_use]
    pub fn raw(&self, grace: Atoms) -> Atoms {
        self.unspent
            .saturating_add(grace)
            .saturating_sub(self.committed())
    }

    /// Atoms charged or reserved beyond the chain plus `grace`.
    #[must_use]
    pub fn overdraft(&self, grace: Atoms) -> Atoms {
        self.committed()
            .saturating_sub(self.unspent.saturating_add(grace))
    }

    fn committed(&self) -> Atoms {
        self.unmarked.saturating_add(self.locked)
    }
}

/// Credit state combined with the chain-derived cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditSnapshot {
    /// Tracker figures.
    pub state: CreditState,
    /// Risk-adjusted collateral cap.
    pub cap: Atoms,
    /// Credit allowed beyond the voucher chain.
    pub grace: Atoms,
}

impl CreditSnapshot {
    /// Credit left on the voucher chain, ignoring the cap.
    #[must_use]
    pub fn raw(&self) -> Atoms {
        self.state.raw(self.grace)
    }

    /// Spendable credit right now.
    #[must_use]
    pub fn available(&self) -> Atoms {
        self.raw().min(self.cap)
    }

    /// Atoms committed beyond the chain plus grace.
    #[must_use]
    pub fn overdraft(&self) -> Atoms {
        self.state.overdraft(self.grace)
    }
}

/// Earliest voucher not yet spent.
#[derive(Debug, Clone)]
pub struct HeadVoucher<V> {
    /// The voucher.
    pub voucher: V,
    /// Atoms not yet charged against it.
    pub remaining: Atoms,
    /// Unspent or partially spent.
    pub state: VoucherState,
}

/// Read-only credit projection for one vendor.
pub struct CreditTrack<V: Voucher> {
    vendor: V::Vendor,
    vouchers: Arc<dyn VoucherTracker<V>>,
    unmarked: Arc<dyn UnmarkedCostTracker<V::Client>>,
    balances: Arc<dyn OutstandingBalanceTracker<V::Client>>,
    oracle: Arc<dyn ChainOracle<V::Client, V::Vendor>>,
    config: CreditConfig,
}

impl<V: Voucher> CreditTrack<V> {
    /// Create a projection over the given collaborators.
    #[must_use]
    pub fn new(
        vendor: V::Vendor,
        vouchers: Arc<dyn VoucherTracker<V>>,
        unmarked: Arc<dyn UnmarkedCostTracker<V::Client>>,
        balances: Arc<dyn OutstandingBalanceTracker<V::Client>>,
        oracle: Arc<dyn ChainOracle<V::Client, V::Vendor>>,
        config: CreditConfig,
    ) -> Self {
        Self {
            vendor,
            vouchers,
            unmarked,
            balances,
            oracle,
            config,
        }
    }

    /// Vendor this projection computes credit for.
    #[must_use]
    pub fn vendor(&self) -> &V::Vendor {
        &self.vendor
    }

    /// Credit settings.
    #[must_use]
    pub fn config(&self) -> &CreditConfig {
        &self.config
    }

    /// Spendable credit for `client`.
    ///
    /// # Errors
    ///
    /// Returns an oracle or tracker error. No fallback value is used.
    pub async fn available_credit(&self, client: &V::Client) -> Result<Atoms> {
        let chain = self.chain_snapshot(client).await?;
        Ok(self.snapshot_with(client, &chain).await?.available())
    }

    /// Read the chain state for `client`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Oracle`] if the oracle cannot be read.
    pub async fn chain_snapshot(&self, client: &V::Client) -> Result<ChainSnapshot> {
        Ok(self.oracle.snapshot(client, &self.vendor).await?)
    }

    /// Credit snapshot computed against an already read chain state.
    ///
    /// # Errors
    ///
    /// Returns a tracker error.
    pub async fn snapshot_with(
        &self,
        client: &V::Client,
        chain: &ChainSnapshot,
    ) -> Result<CreditSnapshot> {
        let state = self.state(client).await?;
        let snapshot = CreditSnapshot {
            state,
            cap: risk_adjusted_cap(chain, self.config.expand_risk_factor),
            grace: self.config.grace(),
        };
        debug!(
            "Credit for {client}: unspent={} unmarked={} locked={} cap={} available={}",
            state.unspent,
            state.unmarked,
            state.locked,
            snapshot.cap,
            snapshot.available()
        );
        Ok(snapshot)
    }

    /// Tracker figures for `client`.
    ///
    /// # Errors
    ///
    /// Returns a tracker error.
    pub async fn state(&self, client: &V::Client) -> Result<CreditState> {
        let unspent = self
            .vouchers
            .unspent_vouchers_for(client, &self.vendor)
            .await?
            .iter()
            .fold(0, |sum: Atoms, v| sum.saturating_add(v.atoms()));
        Ok(CreditState {
            unspent,
            unmarked: self.unmarked.get(client).await?,
            locked: self.balances.locked(client).await?,
        })
    }

    /// Earliest unspent voucher and how much of it is left.
    ///
    /// # Errors
    ///
    /// Returns a tracker error.
    pub async fn head(&self, client: &V::Client) -> Result<Option<HeadVoucher<V>>> {
        let Some(voucher) = self
            .vouchers
            .unspent_vouchers_for(client, &self.vendor)
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        let unmarked = self.unmarked.get(client).await?;
        let remaining = voucher.atoms().saturating_sub(unmarked);
        let state = if unmarked == 0 {
            VoucherState::Unspent
        } else {
            VoucherState::PartiallySpent
        };
        Ok(Some(HeadVoucher {
            voucher,
            remaining,
            state,
        }))
    }
}
