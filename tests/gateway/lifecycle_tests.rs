//! Session and query lifecycle through the public API.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::harness::{usage_costing, TestGateway};
use micropay_gateway::oracle::ChainSnapshot;
use micropay_gateway::{Error, ErrorClass, GatewayConfig, QueryState, Rejection};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn test_nonce_sequence_is_enforced() {
    let gw = TestGateway::scenario();
    assert!(matches!(
        gw.engine.accept_session(gw.voucher(2, 10)).await,
        Err(Error::Rejected(Rejection::NonceGap { expected: 1, got: 2 }))
    ));
    gw.open(1, 10).await;
    assert!(matches!(
        gw.engine.accept_session(gw.voucher(1, 10)).await,
        Err(Error::Rejected(Rejection::NonceReplay { latest: 1, got: 1 }))
    ));
    assert!(matches!(
        gw.engine.accept_session(gw.voucher(3, 10)).await,
        Err(Error::Rejected(Rejection::NonceGap { expected: 2, got: 3 }))
    ));
    gw.open(2, 10).await;
    assert_eq!(gw.engine.metrics().sessions_accepted, 2);
    assert_eq!(gw.engine.metrics().sessions_rejected, 3);
}

#[tokio::test]
async fn test_collateral_and_subscription_checks() {
    let gw = TestGateway::scenario();
    assert!(matches!(
        gw.engine.accept_session(gw.voucher(1, 1_001)).await,
        Err(Error::Rejected(Rejection::InsufficientCollateral {
            collateral: 1000,
            required: 1_001
        }))
    ));

    let other = micropay_gateway::voucher::signed::VoucherSigner::generate();
    let stranger = other.sign(super::harness::VENDOR, 1, 10);
    let err = gw.engine.accept_session(stranger).await.expect_err("unknown client");
    assert!(matches!(err, Error::Rejected(Rejection::NotSubscribed)));
    assert_eq!(err.class(), ErrorClass::Authorization);
}

#[tokio::test(start_paused = true)]
async fn test_stale_oracle_data_is_not_reused() {
    let mut config = GatewayConfig::default();
    config.credit.expand_risk_factor = 1;
    config.oracle.ttl_ms = 1_000;
    config.oracle.retry_attempts = 1;
    let gw = TestGateway::with_config(&config);
    let session = gw.open(1, 150).await;

    // within the TTL the cached snapshot serves even with the chain down
    gw.chain.set_available(false);
    gw.engine.accept_query(session, 10).await.expect("cached read");

    tokio::time::advance(Duration::from_millis(1_001)).await;
    let err = gw
        .engine
        .accept_query(session, 10)
        .await
        .expect_err("expired snapshot must not be used");
    assert_eq!(err.class(), ErrorClass::Infrastructure);
    assert!(!err.is_fatal());

    gw.chain.set_available(true);
    gw.engine.accept_query(session, 10).await.expect("fresh read");
}

#[tokio::test(start_paused = true)]
async fn test_collateral_drop_shrinks_cap_after_ttl() {
    let mut config = GatewayConfig::default();
    config.credit.expand_risk_factor = 1;
    config.oracle.ttl_ms = 500;
    let gw = TestGateway::with_config(&config);
    let session = gw.open(1, 150).await;
    assert_eq!(gw.engine.available_credit(&gw.client()).await.expect("credit"), 150);

    gw.chain.set_snapshot(
        gw.client(),
        ChainSnapshot {
            collateral: 250,
            subscribed_vendor_count: 4,
            subscribed: true,
            ..Default::default()
        },
    );
    tokio::time::advance(Duration::from_millis(501)).await;
    assert_eq!(gw.engine.available_credit(&gw.client()).await.expect("credit"), 50);
    assert!(matches!(
        gw.engine.accept_query(session, 60).await,
        Err(Error::InsufficientCredit { available: 50, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_query_is_reclaimed() {
    let gw = TestGateway::scenario();
    let session = gw.open(1, 150).await;
    let abandoned = gw.engine.accept_query(session, 140).await.expect("query");
    assert!(gw.engine.accept_query(session, 20).await.is_err());

    let deadline = Duration::from_secs(GatewayConfig::default().engine.query_deadline_secs);
    let report = gw.engine.reap_expired(Instant::now() + deadline).await;
    assert_eq!(report.force_aborted, 1);
    assert_eq!(
        gw.engine.query_info(abandoned).expect("query").state,
        QueryState::Aborted
    );
    gw.engine.accept_query(session, 20).await.expect("credit reclaimed");
    gw.assert_invariants().await;
}

#[tokio::test]
async fn test_settle_and_abort_are_idempotent() {
    let gw = TestGateway::scenario();
    let session = gw.open(1, 150).await;

    let q = gw.engine.accept_query(session, 50).await.expect("query");
    let first = gw.engine.settle_query(q, usage_costing(45)).await.expect("settle");
    let again = gw.engine.settle_query(q, usage_costing(45)).await.expect("retry");
    assert_eq!(first.actual_cost, again.actual_cost);
    assert_eq!(first.credit_after, again.credit_after);
    let state = gw.engine.credit_state(&gw.client()).await.expect("state");
    assert_eq!(state.unmarked, 45);
    assert_eq!(state.locked, 0);

    let q = gw.engine.accept_query(session, 50).await.expect("query");
    gw.engine.abort_query(q).await.expect("abort");
    gw.engine.abort_query(q).await.expect("abort again");
    assert_eq!(gw.engine.credit_state(&gw.client()).await.expect("state").locked, 0);
    assert_eq!(gw.engine.metrics().queries_aborted, 1);
    gw.assert_invariants().await;
}
