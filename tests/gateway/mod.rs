//! End-to-end tests for the gateway engine.
//!
//! Every test drives the public API with Ed25519-signed vouchers, the
//! in-memory trackers, and a TTL-cached in-memory chain oracle:
//!
//! ```text
//! TestGateway
//!     ├── Engine<SignedVoucher>
//!     ├── CachedOracle ── MemoryOracle (fault injection)
//!     └── VoucherSigner (one client)
//! ```

mod harness;

#[cfg(test)]
mod concurrency_tests;
#[cfg(test)]
mod lifecycle_tests;
#[cfg(test)]
mod scenario_tests;

pub use harness::TestGateway;
