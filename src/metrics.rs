//! Process-local settlement counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct LedgerMetrics {
    bets_placed: AtomicU64,
    cash_outs: AtomicU64,
    cash_out_rejections: AtomicU64,
    rounds_created: AtomicU64,
    rounds_settled: AtomicU64,
    bonuses_paid: AtomicU64,
    deposits_credited: AtomicU64,
    deposits_duplicate: AtomicU64,
    deposits_failed: AtomicU64,
    deposits_unknown_address: AtomicU64,
    withdrawals_completed: AtomicU64,
    withdrawals_pending: AtomicU64,
    withdrawals_queued: AtomicU64,
    withdrawals_rejected: AtomicU64,
    withdrawal_link_failures: AtomicU64,
    poll_cycles_ok: AtomicU64,
    poll_cycles_failed: AtomicU64,
}

/// Point-in-time copy of [`LedgerMetrics`].
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub bets_placed: u64,
    pub cash_outs: u64,
    pub cash_out_rejections: u64,
    pub rounds_created: u64,
    pub rounds_settled: u64,
    pub bonuses_paid: u64,
    pub deposits_credited: u64,
    pub deposits_duplicate: u64,
    pub deposits_failed: u64,
    pub deposits_unknown_address: u64,
    pub withdrawals_completed: u64,
    pub withdrawals_pending: u64,
    pub withdrawals_queued: u64,
    pub withdrawals_rejected: u64,
    pub withdrawal_link_failures: u64,
    pub poll_cycles_ok: u64,
    pub poll_cycles_failed: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl LedgerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bet_placed(&self) {
        bump(&self.bets_placed);
    }

    pub fn cash_out(&self) {
        bump(&self.cash_outs);
    }

    pub fn cash_out_rejected(&self) {
        bump(&self.cash_out_rejections);
    }

    pub fn round_created(&self) {
        bump(&self.rounds_created);
    }

    pub fn round_settled(&self, bonuses: usize) {
        bump(&self.rounds_settled);
        self.bonuses_paid.fetch_add(bonuses as u64, Ordering::Relaxed);
    }

    pub fn deposit_credited(&self) {
        bump(&self.deposits_credited);
    }

    pub fn deposit_duplicate(&self) {
        bump(&self.deposits_duplicate);
    }

    pub fn deposit_failed(&self) {
        bump(&self.deposits_failed);
    }

    pub fn deposit_unknown_address(&self) {
        bump(&self.deposits_unknown_address);
    }

    pub fn withdrawal_completed(&self) {
        bump(&self.withdrawals_completed);
    }

    pub fn withdrawal_pending(&self) {
        bump(&self.withdrawals_pending);
    }

    pub fn withdrawal_queued(&self) {
        bump(&self.withdrawals_queued);
    }

    pub fn withdrawal_rejected(&self) {
        bump(&self.withdrawals_rejected);
    }

    pub fn withdrawal_link_failed(&self) {
        bump(&self.withdrawal_link_failures);
    }

    pub fn poll_cycle(&self, ok: bool) {
        if ok {
            bump(&self.poll_cycles_ok);
        } else {
            bump(&self.poll_cycles_failed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            bets_placed: load(&self.bets_placed),
            cash_outs: load(&self.cash_outs),
            cash_out_rejections: load(&self.cash_out_rejections),
            rounds_created: load(&self.rounds_created),
            rounds_settled: load(&self.rounds_settled),
            bonuses_paid: load(&self.bonuses_paid),
            deposits_credited: load(&self.deposits_credited),
            deposits_duplicate: load(&self.deposits_duplicate),
            deposits_failed: load(&self.deposits_failed),
            deposits_unknown_address: load(&self.deposits_unknown_address),
            withdrawals_completed: load(&self.withdrawals_completed),
            withdrawals_pending: load(&self.withdrawals_pending),
            withdrawals_queued: load(&self.withdrawals_queued),
            withdrawals_rejected: load(&self.withdrawals_rejected),
            withdrawal_link_failures: load(&self.withdrawal_link_failures),
            poll_cycles_ok: load(&self.poll_cycles_ok),
            poll_cycles_failed: load(&self.poll_cycles_failed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = LedgerMetrics::new();
        metrics.bet_placed();
        metrics.bet_placed();
        metrics.round_settled(3);
        metrics.poll_cycle(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.bets_placed, 2);
        assert_eq!(snapshot.rounds_settled, 1);
        assert_eq!(snapshot.bonuses_paid, 3);
        assert_eq!(snapshot.poll_cycles_failed, 1);
        assert_eq!(snapshot.poll_cycles_ok, 0);
    }
}
