//! Payment vouchers.
//!
//! A voucher is a signed, nonce-sequenced instrument worth a fixed number of
//! atoms. The engine is written against the [`Voucher`] capability only; each
//! signature scheme supplies its own implementation. [`signed`] holds the
//! Ed25519 reference scheme.
//!
//! For a fixed (client, vendor) pair the accepted nonces form a gapless
//! ascending chain:
//!
//! ```text
//! [V1(spent), V2(spent), V3(partially spent), V4, V5]
//!                        ^ head              ^ latest
//! ```

pub mod signed;

use std::fmt;
use std::hash::Hash;

/// Smallest indivisible unit of value.
pub type Atoms = u64;

/// Capability set of a payment voucher.
pub trait Voucher: Clone + fmt::Debug + Send + Sync + 'static {
    /// Client identifier (the signer).
    type Client: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;
    /// Vendor identifier (the payee).
    type Vendor: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;

    /// Returns `true` if the signature verifies against the claimed client.
    fn verify_signature(&self) -> bool;

    /// Position of this voucher in the client's chain.
    fn nonce(&self) -> u64;

    /// Atoms the voucher is signed for.
    fn atoms(&self) -> Atoms;

    /// The signing client.
    fn client(&self) -> &Self::Client;

    /// The vendor the voucher pays.
    fn vendor(&self) -> &Self::Vendor;

    /// Identifier of this voucher.
    fn id(&self) -> VoucherId<Self::Client, Self::Vendor> {
        VoucherId {
            client: self.client().clone(),
            vendor: self.vendor().clone(),
            nonce: self.nonce(),
        }
    }
}

/// Identifier of a voucher, unique per (client, vendor, nonce).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VoucherId<C, K> {
    /// Signing client.
    pub client: C,
    /// Paid vendor.
    pub vendor: K,
    /// Chain position.
    pub nonce: u64,
}

impl<C: fmt::Display, K: fmt::Display> fmt::Display for VoucherId<C, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.client, self.vendor, self.nonce)
    }
}

/// Voucher identifier type for a voucher implementation.
pub type IdOf<V> = VoucherId<<V as Voucher>::Client, <V as Voucher>::Vendor>;

/// Lifecycle state of an accepted voucher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoucherState {
    /// No cost charged against it yet.
    Unspent,
    /// Dust charged against it, below its atom value.
    PartiallySpent,
    /// Fully consumed or invalidated.
    Spent,
}
