//! Voucher authentication and authorization.
//!
//! Static checks are pure and run first, in a fixed order: signature, zero
//! atoms, vendor, nonce. Volatile checks depend on chain and tracker state and
//! are evaluated on every call: subscription, collateral, spent. The first
//! failing check decides the verdict.

use crate::config::{CollateralCheck, CreditConfig};
use crate::credit::risk_adjusted_cap;
use crate::error::Rejection;
use crate::oracle::ChainSnapshot;
use crate::tracker::{TrackerError, VoucherTracker};
use crate::voucher::Voucher;
use std::sync::Arc;
use tracing::debug;

/// Outcome of [`VoucherAuth::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Every check passed.
    Accepted,
    /// The first failed check.
    Rejected(Rejection),
}

impl Verdict {
    /// Returns true if the voucher was accepted.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Convert to a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the rejection reason.
    pub fn into_result(self) -> Result<(), Rejection> {
        match self {
            Self::Accepted => Ok(()),
            Self::Rejected(r) => Err(r),
        }
    }
}

impl From<Result<(), Rejection>> for Verdict {
    fn from(r: Result<(), Rejection>) -> Self {
        match r {
            Ok(()) => Self::Accepted,
            Err(reason) => Self::Rejected(reason),
        }
    }
}

/// Checks that need no external reads.
///
/// # Errors
///
/// Returns the first failed check.
pub fn check_static<V: Voucher>(
    voucher: &V,
    expected_vendor: &V::Vendor,
    prior_nonce: u64,
) -> Result<(), Rejection> {
    if !voucher.verify_signature() {
        return Err(Rejection::BadSignature);
    }
    if voucher.atoms() == 0 {
        return Err(Rejection::ZeroAtoms);
    }
    if voucher.vendor() != expected_vendor {
        return Err(Rejection::WrongVendor);
    }
    let got = voucher.nonce();
    if got <= prior_nonce {
        return Err(Rejection::NonceReplay {
            latest: prior_nonce,
            got,
        });
    }
    let expected = prior_nonce.saturating_add(1);
    if got != expected {
        return Err(Rejection::NonceGap { expected, got });
    }
    Ok(())
}

/// Validates vouchers for one gateway.
pub struct VoucherAuth<V: Voucher> {
    vouchers: Arc<dyn VoucherTracker<V>>,
    collateral_check: CollateralCheck,
    expand_risk_factor: u64,
}

impl<V: Voucher> VoucherAuth<V> {
    /// Create a validator reading spent state from `vouchers`.
    #[must_use]
    pub fn new(vouchers: Arc<dyn VoucherTracker<V>>, config: &CreditConfig) -> Self {
        Self {
            vouchers,
            collateral_check: config.collateral_check,
            expand_risk_factor: config.expand_risk_factor,
        }
    }

    /// Run every check against `voucher`.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] if spent state cannot be read. Rejections are
    /// reported in the [`Verdict`].
    pub async fn validate(
        &self,
        voucher: &V,
        expected_vendor: &V::Vendor,
        prior_nonce: u64,
        chain: &ChainSnapshot,
    ) -> Result<Verdict, TrackerError> {
        if let Err(reason) = check_static(voucher, expected_vendor, prior_nonce) {
            debug!("Voucher {} failed static checks: {reason}", voucher.id());
            return Ok(Verdict::Rejected(reason));
        }
        let verdict = self.check_volatile(voucher, chain).await?;
        if let Verdict::Rejected(reason) = &verdict {
            debug!("Voucher {} failed volatile checks: {reason}", voucher.id());
        }
        Ok(verdict)
    }

    /// Checks against chain and tracker state.
    ///
    /// # Errors
    ///
    /// Returns a [`TrackerError`] if spent state cannot be read.
    pub async fn check_volatile(
        &self,
        voucher: &V,
        chain: &ChainSnapshot,
    ) -> Result<Verdict, TrackerError> {
        if !chain.is_active() {
            return Ok(Verdict::Rejected(Rejection::NotSubscribed));
        }
        let collateral = match self.collateral_check {
            CollateralCheck::Full => chain.effective_collateral(),
            CollateralCheck::RiskAdjusted => risk_adjusted_cap(chain, self.expand_risk_factor),
        };
        if collateral < voucher.atoms() {
            return Ok(Verdict::Rejected(Rejection::InsufficientCollateral {
                collateral,
                required: voucher.atoms(),
            }));
        }
        if self.vouchers.is_spent(&voucher.id()).await? {
            return Ok(Verdict::Rejected(Rejection::AlreadySpent {
                nonce: voucher.nonce(),
            }));
        }
        Ok(Verdict::Accepted)
    }
}
