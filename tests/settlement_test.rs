//! Engine-level settlement tests: exactly-once application of gateway
//! results, create-time failure handling, the poll budget, and refund
//! reservations under concurrency.

mod common;

use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::Duration;
use tokio::sync::Barrier;
use uuid::Uuid;

use common::{
    TestHarness, fast_engine_config, harness, harness_with, parsed_completed, parsed_failed,
    seed_order,
};
use paycore::domain::{ContactInfo, OrderPaymentStatus, RefundStatus, TransactionStatus};
use paycore::engine::{ApplyOutcome, EngineConfig};
use paycore::error::AppError;
use paycore::gateway::GatewayError;
use paycore::middleware::Caller;
use paycore::ports::TransactionStore;

/// Seeds a 499.00 INR order and creates a pending payment for it.
async fn pending_payment(h: &TestHarness) -> (Uuid, Uuid, String) {
    let customer = Uuid::new_v4();
    let order_id = seed_order(&h.ledger, customer, "499.00", "INR").await;
    let created = h
        .engine
        .create_payment(
            &Caller::Customer { user_id: customer },
            order_id,
            ContactInfo::default(),
        )
        .await
        .unwrap();
    (customer, order_id, created.transaction.transaction_id)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deliveries_settle_exactly_once() {
    let h = harness();
    let (_, order_id, txn_id) = pending_payment(&h).await;

    let barrier = Arc::new(Barrier::new(8));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = h.engine.clone();
        let barrier = barrier.clone();
        let parsed = parsed_completed(&txn_id);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            engine.apply_gateway_result(&parsed).await.unwrap()
        }));
    }

    let mut settled = 0;
    let mut already_terminal = 0;
    for handle in handles {
        match handle.await.unwrap() {
            ApplyOutcome::Settled(status) => {
                assert_eq!(status, TransactionStatus::Completed);
                settled += 1;
            }
            ApplyOutcome::AlreadyTerminal => already_terminal += 1,
            ApplyOutcome::StillPending => panic!("completed result reported as still pending"),
        }
    }
    assert_eq!(settled, 1);
    assert_eq!(already_terminal, 7);

    assert_eq!(
        h.ledger.notifications_for(order_id).await,
        vec![TransactionStatus::Completed]
    );
    let tx = h
        .store
        .find_by_transaction_id(&txn_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conflicting_terminal_results_settle_once() {
    let h = harness();
    let (_, order_id, txn_id) = pending_payment(&h).await;

    let barrier = Arc::new(Barrier::new(2));
    let completed = {
        let engine = h.engine.clone();
        let barrier = barrier.clone();
        let parsed = parsed_completed(&txn_id);
        tokio::spawn(async move {
            barrier.wait().await;
            engine.apply_gateway_result(&parsed).await.unwrap()
        })
    };
    let failed = {
        let engine = h.engine.clone();
        let barrier = barrier.clone();
        let parsed = parsed_failed(&txn_id, "expired at gateway");
        tokio::spawn(async move {
            barrier.wait().await;
            engine.apply_gateway_result(&parsed).await.unwrap()
        })
    };

    let outcomes = [completed.await.unwrap(), failed.await.unwrap()];
    let settled: Vec<TransactionStatus> = outcomes
        .iter()
        .filter_map(|outcome| match outcome {
            ApplyOutcome::Settled(status) => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(settled.len(), 1);

    // whichever result won is what the order heard, exactly once
    assert_eq!(h.ledger.notifications_for(order_id).await, settled);
    let tx = h
        .store
        .find_by_transaction_id(&txn_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, settled[0]);
}

#[tokio::test]
async fn test_terminal_status_never_resurrects() {
    let h = harness();
    let (_, order_id, txn_id) = pending_payment(&h).await;

    let outcome = h
        .engine
        .apply_gateway_result(&parsed_failed(&txn_id, "insufficient funds"))
        .await
        .unwrap();
    assert_eq!(outcome, ApplyOutcome::Settled(TransactionStatus::Failed));

    let tx = h
        .store
        .find_by_transaction_id(&txn_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.failure_reason.as_deref(), Some("insufficient funds"));
    assert_eq!(
        h.ledger.order(order_id).await.unwrap().payment_status,
        OrderPaymentStatus::Failed
    );

    // a later conflicting result only refreshes the audit snapshot
    let late = parsed_completed(&txn_id);
    let outcome = h.engine.apply_gateway_result(&late).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::AlreadyTerminal);

    let tx = h
        .store
        .find_by_transaction_id(&txn_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Failed);
    assert_eq!(tx.gateway_response, Some(late.raw.clone()));
    assert_eq!(h.ledger.notifications_for(order_id).await.len(), 1);
}

#[tokio::test]
async fn test_transient_create_failure_leaves_pending() {
    let h = harness();
    let customer = Uuid::new_v4();
    let order_id = seed_order(&h.ledger, customer, "499.00", "INR").await;

    for _ in 0..3 {
        h.gateway
            .enqueue_create(Err(GatewayError::Transient("connect timeout".to_string())));
    }

    let err = h
        .engine
        .create_payment(
            &Caller::Customer { user_id: customer },
            order_id,
            ContactInfo::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::GatewayUnavailable(_)));
    assert_eq!(h.gateway.create_calls(), 3);

    // the row went in before the first gateway byte and is still pending
    let rows = h.store.transactions().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, TransactionStatus::Pending);
    assert!(rows[0].next_poll_at.is_some());

    assert!(h.ledger.notifications_for(order_id).await.is_empty());
    assert_eq!(
        h.ledger.order(order_id).await.unwrap().payment_status,
        OrderPaymentStatus::Unpaid
    );
}

#[tokio::test]
async fn test_rejected_create_fails_transaction_without_ledger_effect() {
    let h = harness();
    let customer = Uuid::new_v4();
    let order_id = seed_order(&h.ledger, customer, "499.00", "INR").await;

    h.gateway.enqueue_create(Err(GatewayError::Permanent(
        "card tokenization unsupported".to_string(),
    )));

    let caller = Caller::Customer { user_id: customer };
    let err = h
        .engine
        .create_payment(&caller, order_id, ContactInfo::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::GatewayRejected(_)));
    assert_eq!(h.gateway.create_calls(), 1);

    let rows = h.store.transactions().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, TransactionStatus::Failed);
    assert!(
        rows[0]
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("tokenization")
    );

    // the order heard nothing and accepts a fresh attempt
    assert!(h.ledger.notifications_for(order_id).await.is_empty());
    let created = h
        .engine
        .create_payment(&caller, order_id, ContactInfo::default())
        .await
        .unwrap();
    assert_eq!(created.transaction.status, TransactionStatus::Pending);
}

#[tokio::test]
async fn test_poll_settles_a_silent_payment() {
    let h = harness();
    let (_, order_id, txn_id) = pending_payment(&h).await;

    h.gateway.enqueue_poll(Ok(parsed_completed(&txn_id)));

    let outcome = h.engine.poll_once(&txn_id, true).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::Settled(TransactionStatus::Completed));
    assert_eq!(h.gateway.poll_calls(), 1);

    let tx = h
        .store
        .find_by_transaction_id(&txn_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.poll_attempts, 1);
    assert!(tx.last_polled_at.is_some());
    assert_eq!(
        h.ledger.notifications_for(order_id).await,
        vec![TransactionStatus::Completed]
    );
}

#[tokio::test]
async fn test_poll_failures_never_fail_the_payment() {
    let h = harness();
    let (_, _, txn_id) = pending_payment(&h).await;

    h.gateway
        .enqueue_poll(Err(GatewayError::Transient("gateway 503".to_string())));
    h.gateway.enqueue_poll(Err(GatewayError::Permanent(
        "reference unknown at gateway".to_string(),
    )));

    for _ in 0..2 {
        let outcome = h.engine.poll_once(&txn_id, true).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::StillPending);
    }

    let tx = h
        .store
        .find_by_transaction_id(&txn_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Pending);
    assert_eq!(tx.poll_attempts, 2);
    assert!(tx.next_poll_at.is_some());
}

#[tokio::test]
async fn test_poll_attempt_budget_parks_the_transaction() {
    let h = harness_with(EngineConfig {
        max_poll_attempts: 3,
        ..fast_engine_config()
    });
    let (_, order_id, txn_id) = pending_payment(&h).await;

    // unscripted polls answer pending; the third consumes the budget
    for _ in 0..3 {
        let outcome = h.engine.poll_once(&txn_id, true).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::StillPending);
    }

    let tx = h
        .store
        .find_by_transaction_id(&txn_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Pending);
    assert_eq!(tx.poll_attempts, 3);
    assert!(tx.next_poll_at.is_none());

    // parked transactions are invisible to the reconciler
    assert_eq!(h.engine.reconcile_due(10).await.unwrap(), 0);
    assert!(h.ledger.notifications_for(order_id).await.is_empty());
}

#[tokio::test]
async fn test_poll_window_budget_parks_the_transaction() {
    let h = harness_with(EngineConfig {
        max_poll_window: Duration::seconds(0),
        ..fast_engine_config()
    });
    let (_, _, txn_id) = pending_payment(&h).await;

    let outcome = h.engine.poll_once(&txn_id, true).await.unwrap();
    assert_eq!(outcome, ApplyOutcome::StillPending);

    let tx = h
        .store
        .find_by_transaction_id(&txn_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Pending);
    assert!(tx.next_poll_at.is_none());
}

#[tokio::test]
async fn test_reconcile_due_settles_due_transactions() {
    let h = harness_with(EngineConfig {
        poll_interval: Duration::seconds(0),
        ..fast_engine_config()
    });
    let (_, order_a, txn_a) = pending_payment(&h).await;
    let (_, order_b, txn_b) = pending_payment(&h).await;

    h.gateway.enqueue_poll(Ok(parsed_completed(&txn_a)));
    h.gateway.enqueue_poll(Ok(parsed_completed(&txn_b)));

    assert_eq!(h.engine.reconcile_due(10).await.unwrap(), 2);

    for txn_id in [&txn_a, &txn_b] {
        let tx = h
            .store
            .find_by_transaction_id(txn_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
    }
    assert_eq!(h.ledger.notifications_for(order_a).await.len(), 1);
    assert_eq!(h.ledger.notifications_for(order_b).await.len(), 1);
}

#[tokio::test]
async fn test_status_projection_polls_inline_when_due() {
    let h = harness_with(EngineConfig {
        poll_interval: Duration::seconds(0),
        ..fast_engine_config()
    });
    let (customer, _, txn_id) = pending_payment(&h).await;

    h.gateway.enqueue_poll(Ok(parsed_completed(&txn_id)));

    let tx = h
        .engine
        .payment_status(&Caller::Customer { user_id: customer }, &txn_id)
        .await
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(h.gateway.poll_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refunds_respect_the_reservation() {
    let h = harness();
    let (_, _, txn_id) = pending_payment(&h).await;
    h.engine
        .apply_gateway_result(&parsed_completed(&txn_id))
        .await
        .unwrap();

    let barrier = Arc::new(Barrier::new(8));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = h.engine.clone();
        let barrier = barrier.clone();
        let txn_id = txn_id.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            engine
                .request_refund(
                    &Caller::Operator,
                    &txn_id,
                    "100.00".parse().unwrap(),
                    "split shipment return".to_string(),
                )
                .await
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(refund) => {
                assert_eq!(refund.status, RefundStatus::Completed);
                accepted += 1;
            }
            Err(err) => assert!(matches!(err, AppError::Conflict(_))),
        }
    }
    // four 100.00 refunds fit under 499.00, the rest bounce
    assert_eq!(accepted, 4);
    assert_eq!(
        h.store.sum_completed_refunds(&txn_id).await.unwrap(),
        "400.00".parse::<BigDecimal>().unwrap()
    );
}

#[tokio::test]
async fn test_ambiguous_refund_outcome_holds_the_reservation() {
    let h = harness();
    let (_, _, txn_id) = pending_payment(&h).await;
    h.engine
        .apply_gateway_result(&parsed_completed(&txn_id))
        .await
        .unwrap();

    h.gateway
        .enqueue_refund(Err(GatewayError::Transient("refund timeout".to_string())));

    let refund = h
        .engine
        .request_refund(
            &Caller::Operator,
            &txn_id,
            "100.00".parse().unwrap(),
            "customer return".to_string(),
        )
        .await
        .unwrap();
    // the gateway may have executed it, so the reservation stands
    assert_eq!(refund.status, RefundStatus::Pending);
    assert!(refund.gateway_refund_id.is_none());

    let err = h
        .engine
        .request_refund(
            &Caller::Operator,
            &txn_id,
            "449.00".parse().unwrap(),
            "customer return".to_string(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    // what still fits next to the pending reservation goes through
    let refund = h
        .engine
        .request_refund(
            &Caller::Operator,
            &txn_id,
            "399.00".parse().unwrap(),
            "customer return".to_string(),
        )
        .await
        .unwrap();
    assert_eq!(refund.status, RefundStatus::Completed);
}
