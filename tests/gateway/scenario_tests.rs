//! The reference credit scenario, step by step.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::harness::{usage_costing, TestGateway};
use micropay_gateway::{Error, VoucherState};

#[tokio::test]
async fn test_reference_scenario() {
    let gw = TestGateway::scenario();
    let client = gw.client();

    // cap = 1000 / (4 + 1) = 200, only V1 on the chain
    let session = gw.open(1, 150).await;
    let snapshot = gw.engine.credit_snapshot(&client).await.expect("snapshot");
    assert_eq!(snapshot.cap, 200);
    assert_eq!(snapshot.available(), 150);

    let first = gw.engine.accept_query(session, 50).await.expect("first");
    assert_eq!(gw.engine.available_credit(&client).await.expect("credit"), 100);

    let second = gw.engine.accept_query(session, 90).await.expect("second");
    assert_eq!(gw.engine.available_credit(&client).await.expect("credit"), 10);

    let third = gw.engine.accept_query(session, 20).await;
    assert!(matches!(
        third,
        Err(Error::InsufficientCredit {
            requested: 20,
            available: 10
        })
    ));
    gw.assert_invariants().await;

    let receipt = gw
        .engine
        .settle_query(first, usage_costing(45))
        .await
        .expect("settle");
    assert_eq!(receipt.actual_cost, 45);
    assert!(receipt.vouchers_consumed.is_empty());
    assert_eq!(receipt.partial.as_ref().map(|id| id.nonce), Some(1));
    assert_eq!(receipt.credit_after.locked, 90);
    assert_eq!(receipt.credit_after.unmarked, 45);
    assert_eq!(receipt.credit_after.unspent, 150);

    let head = gw
        .engine
        .head_voucher(&client)
        .await
        .expect("head")
        .expect("V1 still unspent");
    assert_eq!(head.state, VoucherState::PartiallySpent);
    assert_eq!(head.remaining, 105);

    // 105 - 0 - 90 = 15 < 20
    let retried = gw.engine.accept_query(session, 20).await;
    assert!(matches!(
        retried,
        Err(Error::InsufficientCredit {
            requested: 20,
            available: 15
        })
    ));
    gw.assert_invariants().await;

    gw.engine
        .settle_query(second, usage_costing(90))
        .await
        .expect("settle second");
    let state = gw.engine.credit_state(&client).await.expect("state");
    assert_eq!(state.locked, 0);
    assert_eq!(state.unspent, 150);
    assert_eq!(state.unmarked, 135);
    gw.assert_invariants().await;
}

#[tokio::test]
async fn test_vouchers_chain_across_sessions() {
    let gw = TestGateway::scenario();
    let client = gw.client();

    let s1 = gw.open(1, 100).await;
    let s2 = gw.open(2, 100).await;
    assert_ne!(s1, s2);
    assert_eq!(gw.engine.available_credit(&client).await.expect("credit"), 200);

    // a forged third voucher is rejected even with the right nonce
    let mut forged = gw.voucher(3, 100);
    forged.atoms = 1_000;
    assert!(matches!(
        gw.engine.accept_session(forged).await,
        Err(Error::Rejected(micropay_gateway::Rejection::BadSignature))
    ));

    let q = gw.engine.accept_query(s2, 150).await.expect("query");
    let receipt = gw
        .engine
        .settle_query(q, usage_costing(150))
        .await
        .expect("settle");
    assert_eq!(receipt.vouchers_consumed.len(), 1);
    assert_eq!(receipt.vouchers_consumed[0].nonce, 1);

    let batch = gw
        .engine
        .settlement()
        .begin_batch(&client)
        .expect("spent voucher queued");
    assert_eq!(batch.up_to_nonce, 1);
    assert_eq!(batch.total_atoms, 100);
    assert_eq!(
        gw.engine.settlement().complete_batch(&client, "batch-1"),
        Some(1)
    );
    gw.assert_invariants().await;
}
