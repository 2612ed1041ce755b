//! Concurrent queries for one client.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::harness::{usage_costing, TestGateway};
use micropay_gateway::Error;
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_never_oversubscribe() {
    let gw = TestGateway::scenario();
    let session = gw.open(1, 150).await;

    let mut handles = Vec::new();
    for _ in 0..40 {
        let engine = Arc::clone(&gw.engine);
        handles.push(tokio::spawn(async move {
            engine.accept_query(session, 10).await
        }));
    }

    let mut accepted = 0;
    let mut refused = 0;
    for h in handles {
        match h.await.expect("join") {
            Ok(_) => accepted += 1,
            Err(Error::InsufficientCredit { .. }) => refused += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(accepted, 15);
    assert_eq!(refused, 25);
    assert_eq!(
        gw.engine.credit_state(&gw.client()).await.expect("state").locked,
        150
    );
    gw.assert_invariants().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_settles_apply_once() {
    let gw = TestGateway::scenario();
    let session = gw.open(1, 150).await;
    let q = gw.engine.accept_query(session, 50).await.expect("query");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&gw.engine);
        handles.push(tokio::spawn(async move {
            engine.settle_query(q, usage_costing(45)).await
        }));
    }
    for h in handles {
        let receipt = h.await.expect("join").expect("settle");
        assert_eq!(receipt.actual_cost, 45);
    }

    let state = gw.engine.credit_state(&gw.client()).await.expect("state");
    assert_eq!(state.unmarked, 45);
    assert_eq!(state.locked, 0);
    assert_eq!(gw.engine.metrics().queries_settled, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_lifecycle_keeps_invariants() {
    let gw = TestGateway::scenario();
    gw.open(1, 100).await;
    let session = gw.open(2, 100).await;

    let mut handles = Vec::new();
    for i in 0..20u64 {
        let engine = Arc::clone(&gw.engine);
        handles.push(tokio::spawn(async move {
            let Ok(q) = engine.accept_query(session, 10).await else {
                return;
            };
            if i % 3 == 0 {
                engine.abort_query(q).await.expect("abort");
            } else {
                engine
                    .settle_query(q, usage_costing(i % 10))
                    .await
                    .expect("settle");
            }
        }));
    }
    for h in handles {
        h.await.expect("join");
    }

    let state = gw.engine.credit_state(&gw.client()).await.expect("state");
    assert_eq!(state.locked, 0);
    gw.assert_invariants().await;
    let metrics = gw.engine.metrics();
    assert_eq!(
        metrics.queries_locked,
        metrics.queries_settled + metrics.queries_aborted
    );
}
