//! # micropay-gateway
//!
//! Credit accounting and session lifecycle for services sold against
//! signed, nonce-sequenced payment vouchers.
//!
//! A client opens a session with a voucher. Each query reserves an estimate
//! of its cost before work starts and is settled with the actual cost once
//! the work is done:
//!
//! ```text
//!            accept_session(voucher)
//!                      │
//!                      ▼
//!   VoucherAuth ── static + volatile checks ── ChainOracle
//!                      │
//!            accept_query(estimate)
//!                      │
//!   CreditTrack ── min(unspent - unmarked - locked, cap)
//!                      │ lock
//!                      ▼
//!                 (external work)
//!                      │
//!        settle_query(usage) / abort_query
//!                      │ release + consume vouchers
//!                      ▼
//!   Trackers ─── spent vouchers ──▶ SettlementQueue
//! ```
//!
//! Storage and the chain are collaborators behind async traits. In-memory
//! implementations live in [`tracker::memory`]; [`voucher::signed`] provides
//! an Ed25519 voucher scheme.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use micropay_gateway::oracle::ChainSnapshot;
//! use micropay_gateway::pricing::Usage;
//! use micropay_gateway::tracker::memory::MemoryOracle;
//! use micropay_gateway::voucher::signed::{ClientKey, SignedVoucher, VendorId, VoucherSigner};
//! use micropay_gateway::{Collaborators, Engine, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let vendor = VendorId([7u8; 32]);
//!     let signer = VoucherSigner::generate();
//!     let oracle = Arc::new(MemoryOracle::<ClientKey>::new());
//!     oracle.set_snapshot(signer.client(), ChainSnapshot {
//!         collateral: 1_000,
//!         subscribed_vendor_count: 1,
//!         subscribed: true,
//!         ..Default::default()
//!     });
//!
//!     let collaborators = Collaborators::<SignedVoucher>::in_memory(oracle);
//!     let engine = Engine::new(vendor, collaborators, &GatewayConfig::default());
//!     let session = engine.accept_session(signer.sign(vendor, 1, 150)).await?;
//!     let query = engine.accept_query(session, 20).await?;
//!     let receipt = engine.settle_query(query, Usage::default()).await?;
//!     println!("charged {} atoms", receipt.actual_cost);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod auth;
pub mod config;
pub mod credit;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod oracle;
pub mod pricing;
pub mod settle;
pub mod tracker;
pub mod voucher;

pub use auth::{Verdict, VoucherAuth};
pub use config::GatewayConfig;
pub use credit::{CreditSnapshot, CreditState, CreditTrack};
pub use engine::{Collaborators, Engine, QueryId, QueryState, Receipt, SessionId};
pub use error::{Error, ErrorClass, Rejection, Result};
pub use oracle::{CachedOracle, ChainOracle, ChainSnapshot};
pub use pricing::{PriceSchedule, Usage};
pub use voucher::{Atoms, Voucher, VoucherId, VoucherState};
