//! Deposit polling against a scripted provider.

mod common;

use common::{funded_user, harness, incoming, receipt, MockProvider};
use crashline::{
    assign_deposit_address,
    config::CrashlineConfig,
    errors::ProviderError,
    provider::ProviderTransaction,
    DepositWatcher, Ledger, WithdrawalOutcome, WithdrawalPipeline,
};
use serde_json::json;
use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

fn watcher(ledger: &Ledger, provider: &Arc<MockProvider>) -> DepositWatcher {
    let config = CrashlineConfig::default();
    DepositWatcher::new(ledger.clone(), provider.clone(), &config.depositor, &config.provider)
}

fn user_with_address(ledger: &Ledger, name: &str, address: &str) -> u64 {
    let user = ledger.create_user(name).unwrap();
    ledger.record_deposit_address(user.id, address).unwrap();
    user.id
}

#[tokio::test]
async fn test_poll_credits_known_addresses_once() {
    let h = harness("deposit-seed", 1);
    let alice = user_with_address(&h.ledger, "alice", "bc1qalice");
    let provider = MockProvider::new();
    provider.push_listing(Ok(vec![
        incoming("hash-1", "bc1qalice", "0.00150000"),
        incoming("hash-2", "bc1qalice", "0.5"),
    ]));

    let watcher = watcher(&h.ledger, &provider);
    let first = watcher.poll_once().await.unwrap();
    assert_eq!(first.fetched, 2);
    assert_eq!(first.credited, 2);
    assert_eq!(h.ledger.get_user(alice).unwrap().balance, 150_000 + 50_000_000);

    let second = watcher.poll_once().await.unwrap();
    assert_eq!(second.candidates, 0);
    assert_eq!(h.ledger.get_user(alice).unwrap().balance, 150_000 + 50_000_000);
    assert!(watcher.processed().contains("hash-1"));

    let snapshot = h.ledger.metrics().snapshot();
    assert_eq!(snapshot.deposits_credited, 2);
    assert_eq!(snapshot.poll_cycles_ok, 2);
}

#[tokio::test]
async fn test_restarted_watcher_does_not_double_credit() {
    let h = harness("deposit-seed", 1);
    let bob = user_with_address(&h.ledger, "bob", "bc1qbob");
    let provider = MockProvider::new();
    provider.push_listing(Ok(vec![incoming("hash-restart", "bc1qbob", "0.001")]));

    watcher(&h.ledger, &provider).poll_once().await.unwrap();
    assert_eq!(h.ledger.get_user(bob).unwrap().balance, 100_000);

    // A new process starts with an empty recency set.
    let restarted = watcher(&h.ledger, &provider);
    assert!(restarted.processed().is_empty());
    let summary = restarted.poll_once().await.unwrap();
    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.credited, 0);
    assert_eq!(h.ledger.get_user(bob).unwrap().balance, 100_000);
}

#[tokio::test]
async fn test_withdrawal_to_another_users_address_is_credited() {
    let h = harness("deposit-seed", 1);
    let alice = funded_user(&h.ledger, "alice", 100_000);
    let bob = user_with_address(&h.ledger, "bob", "bc1qbob");
    let provider = MockProvider::new();
    provider.push_send(Ok(receipt("onchain-H")));

    let config = CrashlineConfig::default();
    let pipeline = WithdrawalPipeline::new(h.ledger.clone(), provider.clone(), &config.withdrawal, &config.provider);
    let outcome = pipeline.withdraw(alice, 50_100, "bc1qbob", "k1").await.unwrap();
    assert!(matches!(outcome, WithdrawalOutcome::Completed { ref tx_hash, .. } if tx_hash == "onchain-H"));

    // The same on-chain transfer shows up as bob's incoming deposit.
    provider.push_listing(Ok(vec![incoming("onchain-H", "bc1qbob", "0.000401")]));
    let summary = watcher(&h.ledger, &provider).poll_once().await.unwrap();
    assert_eq!(summary.credited, 1);
    assert_eq!(summary.duplicates, 0);
    assert_eq!(h.ledger.get_user(bob).unwrap().balance, 40_100);
    assert_eq!(h.ledger.get_user(alice).unwrap().balance, 49_900);
    assert!(h.ledger.is_deposit_recorded("onchain-H").unwrap());
    assert!(pipeline.unlinked_withdrawals().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_address_is_retried_after_mapping() {
    let h = harness("deposit-seed", 1);
    let provider = MockProvider::new();
    provider.push_listing(Ok(vec![incoming("hash-early", "bc1qlater", "0.002")]));
    let watcher = watcher(&h.ledger, &provider);

    let summary = watcher.poll_once().await.unwrap();
    assert_eq!(summary.unknown_address, 1);
    assert!(!watcher.processed().contains("hash-early"));

    let carol = user_with_address(&h.ledger, "carol", "bc1qlater");
    let summary = watcher.poll_once().await.unwrap();
    assert_eq!(summary.credited, 1);
    assert_eq!(h.ledger.get_user(carol).unwrap().balance, 200_000);
}

#[tokio::test]
async fn test_failed_credit_is_untracked_for_retry() {
    let h = harness("deposit-seed", 1);
    let dave = user_with_address(&h.ledger, "dave", "bc1qdave");
    let provider = MockProvider::new();
    // Fits in u64 minor units but exceeds the signed balance range.
    provider.push_listing(Ok(vec![incoming("hash-huge", "bc1qdave", "95000000000")]));
    let watcher = watcher(&h.ledger, &provider);

    let summary = watcher.poll_once().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert!(!watcher.processed().contains("hash-huge"));
    assert!(!h.ledger.is_deposit_recorded("hash-huge").unwrap());

    let summary = watcher.poll_once().await.unwrap();
    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(h.ledger.get_user(dave).unwrap().balance, 0);
    assert_eq!(h.ledger.metrics().snapshot().deposits_failed, 2);
}

#[tokio::test]
async fn test_non_incoming_transactions_are_ignored() {
    let h = harness("deposit-seed", 1);
    let erin = user_with_address(&h.ledger, "erin", "bc1qerin");
    let pending: ProviderTransaction = serde_json::from_value(json!({
        "id": "pending-1",
        "status": "pending",
        "amount": { "amount": "1.0", "currency": "BTC" },
        "to": { "address": "bc1qerin" },
    }))
    .unwrap();
    let outgoing: ProviderTransaction = serde_json::from_value(json!({
        "id": "send-1",
        "status": "completed",
        "amount": { "amount": "-0.5", "currency": "BTC" },
        "to": { "address": "bc1qerin" },
    }))
    .unwrap();
    let other_currency: ProviderTransaction = serde_json::from_value(json!({
        "id": "eth-1",
        "status": "completed",
        "amount": { "amount": "2.0", "currency": "ETH" },
        "to": { "address": "bc1qerin" },
    }))
    .unwrap();

    let provider = MockProvider::new();
    provider.push_listing(Ok(vec![pending, outgoing, other_currency]));
    let summary = watcher(&h.ledger, &provider).poll_once().await.unwrap();

    assert_eq!(summary.fetched, 3);
    assert_eq!(summary.candidates, 0);
    assert_eq!(h.ledger.get_user(erin).unwrap().balance, 0);
}

#[tokio::test]
async fn test_provider_failure_counts_failed_cycle() {
    let h = harness("deposit-seed", 1);
    let provider = MockProvider::new();
    provider.push_listing(Err(ProviderError::Transport("connection reset".to_string())));

    let result = watcher(&h.ledger, &provider).poll_once().await;
    assert!(matches!(result, Err(ProviderError::Transport(_))));

    let snapshot = h.ledger.metrics().snapshot();
    assert_eq!(snapshot.poll_cycles_failed, 1);
    assert_eq!(snapshot.poll_cycles_ok, 0);
}

#[tokio::test]
async fn test_spawned_loop_polls_until_stopped() {
    let h = harness("deposit-seed", 1);
    let frank = user_with_address(&h.ledger, "frank", "bc1qfrank");
    let provider = MockProvider::new();
    provider.push_listing(Ok(vec![incoming("hash-loop", "bc1qfrank", "0.0001")]));

    let mut config = CrashlineConfig::default();
    config.depositor.poll_interval_ms = 10;
    let watcher = DepositWatcher::new(h.ledger.clone(), provider.clone(), &config.depositor, &config.provider).spawn();

    tokio::time::sleep(Duration::from_millis(200)).await;
    watcher.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let calls = provider.list_calls.load(Ordering::SeqCst);
    assert!(calls >= 2, "expected repeated polls, got {}", calls);
    assert_eq!(h.ledger.get_user(frank).unwrap().balance, 10_000);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(provider.list_calls.load(Ordering::SeqCst), calls);
}

#[tokio::test]
async fn test_assign_deposit_address_maps_user() {
    let h = harness("deposit-seed", 1);
    let user = h.ledger.create_user("grace").unwrap();
    let provider = MockProvider::new();

    let address = assign_deposit_address(&h.ledger, provider.as_ref(), user.id, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(address, "bc1qgrace0");
    assert_eq!(h.ledger.resolve_deposit_address(&address).unwrap(), Some(user.id));
}
