//! Test gateway construction and invariant checks.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use micropay_gateway::config::Rounding;
use micropay_gateway::oracle::{CachedOracle, ChainOracle, ChainSnapshot};
use micropay_gateway::pricing::Usage;
use micropay_gateway::tracker::memory::MemoryOracle;
use micropay_gateway::voucher::signed::{ClientKey, SignedVoucher, VendorId, VoucherSigner};
use micropay_gateway::{Collaborators, Engine, GatewayConfig, SessionId};
use std::sync::Arc;

/// Vendor id used by every test gateway.
pub const VENDOR: VendorId = VendorId([0x5a; 32]);

/// A gateway with one signing client.
pub struct TestGateway {
    /// Engine under test.
    pub engine: Arc<Engine<SignedVoucher>>,
    /// Chain state behind the cache.
    pub chain: Arc<MemoryOracle<ClientKey>>,
    /// The client's signer.
    pub signer: VoucherSigner,
}

impl TestGateway {
    /// Gateway matching the reference scenario: collateral 1000, 4
    /// subscriptions, expand risk factor 1, one atom per millihour.
    pub fn scenario() -> Self {
        let mut config = GatewayConfig::default();
        config.credit.expand_risk_factor = 1;
        config.pricing.hour_price = 1_000;
        config.pricing.rounding = Rounding::Down;
        Self::with_config(&config)
    }

    /// Gateway with the reference chain state and the given configuration.
    pub fn with_config(config: &GatewayConfig) -> Self {
        let signer = VoucherSigner::generate();
        let chain = Arc::new(MemoryOracle::<ClientKey>::new());
        chain.set_snapshot(
            signer.client(),
            ChainSnapshot {
                collateral: 1000,
                subscribed_vendor_count: 4,
                subscribed: true,
                ..Default::default()
            },
        );
        let cached: CachedOracle<_, ClientKey, VendorId> =
            CachedOracle::new(Arc::clone(&chain), &config.oracle);
        let oracle: Arc<dyn ChainOracle<ClientKey, VendorId>> = Arc::new(cached);
        let engine = Engine::new(
            VENDOR,
            Collaborators::<SignedVoucher>::in_memory(oracle),
            config,
        );
        Self {
            engine: Arc::new(engine),
            chain,
            signer,
        }
    }

    /// The client id.
    pub fn client(&self) -> ClientKey {
        self.signer.client()
    }

    /// A voucher from the client to the test vendor.
    pub fn voucher(&self, nonce: u64, atoms: u64) -> SignedVoucher {
        self.signer.sign(VENDOR, nonce, atoms)
    }

    /// Open a session with voucher `nonce`.
    pub async fn open(&self, nonce: u64, atoms: u64) -> SessionId {
        self.engine
            .accept_session(self.voucher(nonce, atoms))
            .await
            .expect("session accepted")
    }

    /// Locked cost equals the sum of estimates of locked queries, and
    /// nothing beyond the chain is reserved.
    pub async fn assert_invariants(&self) {
        let client = self.client();
        let state = self.engine.credit_state(&client).await.expect("state");
        let reserved: u64 = self
            .engine
            .locked_queries(&client)
            .iter()
            .map(|q| q.estimated_cost)
            .sum();
        assert_eq!(state.locked, reserved, "locked cost drifted from locked queries");
        assert!(
            state.locked + state.unmarked <= state.unspent,
            "committed {} + {} exceeds unspent {}",
            state.locked,
            state.unmarked,
            state.unspent
        );
    }
}

/// Usage that costs exactly `atoms` under the scenario prices.
pub fn usage_costing(atoms: u64) -> Usage {
    Usage::from_millihours_and_megabytes(atoms, 0)
}
