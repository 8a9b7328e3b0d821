//! Concurrent ledger operations must never overdraw, double-credit or leave a
//! settlement half applied.

mod common;

use common::{funded_user, harness};
use crashline::{
    errors::LedgerError,
    types::{BonusEntry, FIRST_ROUND_ID},
    CreditOutcome,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_cash_out_succeeds_once() {
    let h = harness("concurrency-seed", 1);
    let round = h.ledger.create_round(FIRST_ROUND_ID).unwrap();
    let user = funded_user(&h.ledger, "racer", 1_000);
    let bet_id = h.ledger.place_bet(user, 1_000, None, round.id).unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ledger = h.ledger.clone();
        handles.push(tokio::task::spawn_blocking(move || ledger.cash_out(user, bet_id, 2_000)));
    }

    let mut successes = 0;
    let mut rejections = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => successes += 1,
            Err(LedgerError::AlreadyCashedOut { .. }) => rejections += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(rejections, 7);
    assert_eq!(h.ledger.get_user(user).unwrap().balance, 2_000);
    assert_eq!(h.ledger.metrics().snapshot().cash_outs, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bets_never_overdraw() {
    let h = harness("concurrency-seed", 1);
    let round = h.ledger.create_round(FIRST_ROUND_ID).unwrap();
    let user = funded_user(&h.ledger, "spender", 500);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let ledger = h.ledger.clone();
        handles.push(tokio::task::spawn_blocking(move || ledger.place_bet(user, 100, None, round.id)));
    }

    let mut placed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => placed += 1,
            Err(LedgerError::InsufficientFunds) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(placed, 5);
    assert_eq!(h.ledger.get_user(user).unwrap().balance, 0);
    assert_eq!(h.ledger.round_bets(round.id).unwrap().len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_deposit_credits_once() {
    let h = harness("concurrency-seed", 1);
    let user = h.ledger.create_user("depositor").unwrap().id;

    let mut handles = Vec::new();
    for _ in 0..6 {
        let ledger = h.ledger.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            ledger.credit(user, "onchain-abc", 25_000, "bc1qdeposit")
        }));
    }

    let mut credited = 0;
    for handle in handles {
        if let CreditOutcome::Credited { .. } = handle.await.unwrap().unwrap() {
            credited += 1;
        }
    }

    assert_eq!(credited, 1);
    assert_eq!(h.ledger.get_user(user).unwrap().balance, 25_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_withdrawals_with_same_key_debit_once() {
    let h = harness("concurrency-seed", 1);
    let user = funded_user(&h.ledger, "withdrawer", 10_000);

    let mut handles = Vec::new();
    for _ in 0..6 {
        let ledger = h.ledger.clone();
        handles.push(tokio::task::spawn_blocking(move || ledger.debit(user, 3_000, "bc1qout", "same-key")));
    }

    let mut debited = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => debited += 1,
            Err(LedgerError::DuplicateIdempotencyKey { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(debited, 1);
    assert_eq!(h.ledger.get_user(user).unwrap().balance, 7_000);
}

#[test]
fn test_settlement_rolls_back_on_unknown_bet() {
    let h = harness("settlement-seed", 1);
    let round = h.ledger.create_round(FIRST_ROUND_ID).unwrap();
    let alice = funded_user(&h.ledger, "alice", 100);
    let bob = funded_user(&h.ledger, "bob", 100);
    let bet_a = h.ledger.place_bet(alice, 100, None, round.id).unwrap();
    let bet_b = h.ledger.place_bet(bob, 100, None, round.id).unwrap();

    let entries = [
        BonusEntry { user_id: alice, bet_id: bet_a, amount: 150 },
        BonusEntry { user_id: bob, bet_id: bet_b, amount: 150 },
        BonusEntry { user_id: bob, bet_id: 9_999, amount: 150 },
    ];
    let err = h.ledger.settle_round(round.id, &entries).unwrap_err();
    assert!(matches!(err, LedgerError::SettlementMismatch { expected: 3, affected: 2 }));
    assert!(err.is_invariant_violation());

    assert_eq!(h.ledger.get_user(alice).unwrap().balance, 0);
    assert_eq!(h.ledger.get_user(bob).unwrap().balance, 0);
    assert!(!h.ledger.get_round(round.id).unwrap().unwrap().ended);
    assert!(h.ledger.round_history(10).unwrap().is_empty());

    h.ledger.settle_round(round.id, &entries[..2]).unwrap();
    assert_eq!(h.ledger.get_user(alice).unwrap().balance, 150);
    assert_eq!(h.ledger.get_user(bob).unwrap().balance, 150);
}

#[test]
fn test_cash_out_after_settlement_is_rejected() {
    let h = harness("settlement-seed", 1);
    let round = h.ledger.create_round(FIRST_ROUND_ID).unwrap();
    let user = funded_user(&h.ledger, "slow", 100);
    let bet_id = h.ledger.place_bet(user, 100, None, round.id).unwrap();

    h.ledger.settle_round(round.id, &[]).unwrap();
    assert!(matches!(
        h.ledger.cash_out(user, bet_id, 200),
        Err(LedgerError::RoundAlreadySettled { .. })
    ));
    assert!(matches!(
        h.ledger.place_bet(user, 1, None, round.id),
        Err(LedgerError::RoundAlreadySettled { .. })
    ));
    assert_eq!(h.ledger.get_user(user).unwrap().balance, 0);
}

#[test]
fn test_bankroll_tracks_house_position() {
    let h = harness("settlement-seed", 1);
    let round = h.ledger.create_round(FIRST_ROUND_ID).unwrap();
    let winner = funded_user(&h.ledger, "winner", 1_000);
    let loser = funded_user(&h.ledger, "loser", 1_000);

    let win = h.ledger.place_bet(winner, 1_000, None, round.id).unwrap();
    h.ledger.place_bet(loser, 1_000, None, round.id).unwrap();
    h.ledger.cash_out(winner, win, 1_500).unwrap();
    h.ledger.settle_round(round.id, &[]).unwrap();

    // House took 1000 from the loser and paid 500 to the winner.
    assert_eq!(h.ledger.bankroll().unwrap(), 500);
}
