//! Round lifecycle: `Pending -> Betting -> Running -> Settled`.
//!
//! The in-memory state only gates which operations are accepted in which
//! phase. Balances, bets and the ended flag live in the ledger; the lock
//! around the state is never held across a ledger call.

use crate::{
    crash::Multiplier,
    errors::{LedgerError, RoundError},
    ledger::Ledger,
    types::{BonusEntry, Round, FIRST_ROUND_ID},
};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundPhase {
    Pending,
    Betting,
    Running,
    Settled,
}

impl RoundPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundPhase::Pending => "PENDING",
            RoundPhase::Betting => "BETTING",
            RoundPhase::Running => "RUNNING",
            RoundPhase::Settled => "SETTLED",
        }
    }
}

/// Public view of the current round. The crash point stays hidden until the
/// round has busted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RoundStatus {
    pub round_id: Option<u64>,
    pub phase: RoundPhase,
    pub multiplier: Multiplier,
    pub busted: bool,
    pub crash_point: Option<Multiplier>,
}

#[derive(Debug)]
struct LifecycleState {
    round: Option<Round>,
    phase: RoundPhase,
    multiplier: Multiplier,
    busted: bool,
    settling: bool,
}

impl LifecycleState {
    fn require(&self, expected: RoundPhase) -> Result<&Round, RoundError> {
        let round = self.round.as_ref().ok_or(RoundError::NoActiveRound)?;
        if self.phase != expected || self.settling {
            return Err(RoundError::WrongPhase {
                round_id: round.id,
                phase: self.phase.as_str(),
                expected: expected.as_str(),
            });
        }
        Ok(round)
    }
}

pub struct RoundLifecycle {
    ledger: Ledger,
    state: Mutex<LifecycleState>,
}

impl RoundLifecycle {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            ledger,
            state: Mutex::new(LifecycleState {
                round: None,
                phase: RoundPhase::Pending,
                multiplier: Multiplier::ONE,
                busted: false,
                settling: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, RoundError>
    where
        T: Send + 'static,
        F: FnOnce(Ledger) -> Result<T, LedgerError> + Send + 'static,
    {
        let ledger = self.ledger.clone();
        Ok(tokio::task::spawn_blocking(move || op(ledger))
            .await
            .map_err(|e| RoundError::Join(e.to_string()))??)
    }

    pub fn status(&self) -> RoundStatus {
        let state = self.state();
        RoundStatus {
            round_id: state.round.as_ref().map(|r| r.id),
            phase: state.phase,
            multiplier: state.multiplier,
            busted: state.busted,
            crash_point: state
                .round
                .as_ref()
                .filter(|_| state.busted || state.phase == RoundPhase::Settled)
                .map(|r| r.crash_point),
        }
    }

    /// Pick up a round left unsettled by a previous process so it can be
    /// settled. Returns the recovered round id.
    pub async fn recover(&self) -> Result<Option<u64>, RoundError> {
        let last = self.blocking(|ledger| ledger.last_round()).await?;
        let Some(round) = last.filter(|r| !r.ended) else {
            return Ok(None);
        };

        let mut state = self.state();
        if state.round.is_some() {
            return Ok(None);
        }
        tracing::warn!(round_id = round.id, "recovered unsettled round");
        let round_id = round.id;
        state.multiplier = round.crash_point;
        state.round = Some(round);
        state.phase = RoundPhase::Running;
        state.busted = true;
        Ok(Some(round_id))
    }

    /// `Pending|Settled -> Betting`: persist the next round from the chain.
    pub async fn create_round(&self) -> Result<Round, RoundError> {
        {
            let state = self.state();
            if let Some(round) = &state.round {
                if state.phase != RoundPhase::Settled {
                    return Err(RoundError::WrongPhase {
                        round_id: round.id,
                        phase: state.phase.as_str(),
                        expected: RoundPhase::Settled.as_str(),
                    });
                }
            }
        }

        let round = self
            .blocking(|ledger| {
                let next = ledger
                    .last_round()?
                    .map(|r| r.id + 1)
                    .unwrap_or(FIRST_ROUND_ID);
                ledger.create_round(next)
            })
            .await?;

        let mut state = self.state();
        state.round = Some(round.clone());
        state.phase = RoundPhase::Betting;
        state.multiplier = Multiplier::ONE;
        state.busted = false;
        state.settling = false;
        Ok(round)
    }

    /// Accepted only while betting is open.
    pub async fn place_bet(
        &self,
        user_id: u64,
        amount: u64,
        auto_cash_out: Option<Multiplier>,
    ) -> Result<u64, RoundError> {
        let round_id = self.state().require(RoundPhase::Betting)?.id;
        self.blocking(move |ledger| ledger.place_bet(user_id, amount, auto_cash_out, round_id))
            .await
    }

    /// `Betting -> Running`. A round whose crash point is 1.00x busts at once.
    pub fn start(&self) -> Result<(), RoundError> {
        let mut state = self.state();
        let crash_point = state.require(RoundPhase::Betting)?.crash_point;
        state.phase = RoundPhase::Running;
        state.multiplier = Multiplier::ONE;
        state.busted = crash_point <= Multiplier::ONE;
        Ok(())
    }

    /// Move the displayed multiplier forward. Returns `true` once the round has
    /// reached its crash point.
    pub fn advance(&self, multiplier: Multiplier) -> Result<bool, RoundError> {
        let mut state = self.state();
        let crash_point = state.require(RoundPhase::Running)?.crash_point;
        if state.busted {
            return Ok(true);
        }
        if multiplier >= crash_point {
            state.multiplier = crash_point;
            state.busted = true;
        } else if multiplier > state.multiplier {
            state.multiplier = multiplier;
        }
        Ok(state.busted)
    }

    /// Cash a bet out at the current multiplier. Returns the credited amount.
    pub async fn cash_out(&self, user_id: u64, bet_id: u64) -> Result<u64, RoundError> {
        let (round_id, at) = {
            let state = self.state();
            let round = state.require(RoundPhase::Running)?;
            if state.busted {
                return Err(RoundError::Busted {
                    round_id: round.id,
                    crash_point: round.crash_point.to_string(),
                });
            }
            (round.id, state.multiplier)
        };

        let bet = self.blocking(move |ledger| ledger.get_bet(bet_id)).await?;
        if bet.round_id != round_id || bet.user_id != user_id {
            return Err(LedgerError::BetNotFound { bet_id }.into());
        }
        if matches!(bet.auto_cash_out, Some(auto) if auto <= at) {
            return Err(RoundError::InvalidCashOut {
                requested: at.to_string(),
                reason: "auto cash out already reached",
            });
        }
        let credit = at.payout(bet.amount).ok_or(RoundError::InvalidCashOut {
            requested: at.to_string(),
            reason: "payout out of range",
        })?;

        self.blocking(move |ledger| ledger.cash_out(user_id, bet_id, credit))
            .await?;
        tracing::debug!(round_id, bet_id, at = %at, credit, "manual cash out");
        Ok(credit)
    }

    /// `Running -> Settled`: end the round and pay every auto cash-out below
    /// the crash point that was not cashed out by hand. Only allowed once the
    /// multiplier has reached the crash point. Runs at most once.
    pub async fn settle(&self) -> Result<Vec<BonusEntry>, RoundError> {
        let round = {
            let mut state = self.state();
            let round = state.require(RoundPhase::Running)?.clone();
            if !state.busted {
                return Err(RoundError::NotBusted {
                    round_id: round.id,
                    multiplier: state.multiplier.to_string(),
                });
            }
            state.settling = true;
            round
        };

        let result = self
            .blocking(move |ledger| {
                let bonuses = auto_cash_out_bonuses(&ledger, &round)?;
                ledger.settle_round(round.id, &bonuses)?;
                Ok(bonuses)
            })
            .await;

        let mut state = self.state();
        state.settling = false;
        match result {
            Ok(bonuses) => {
                state.phase = RoundPhase::Settled;
                state.busted = true;
                Ok(bonuses)
            }
            Err(RoundError::Ledger(LedgerError::RoundAlreadySettled { round_id })) => {
                state.phase = RoundPhase::Settled;
                Err(LedgerError::RoundAlreadySettled { round_id }.into())
            }
            Err(e) => Err(e),
        }
    }
}

fn auto_cash_out_bonuses(ledger: &Ledger, round: &Round) -> Result<Vec<BonusEntry>, LedgerError> {
    let mut bonuses = Vec::new();
    for bet in ledger.round_bets(round.id)? {
        let Some(auto) = bet.auto_cash_out else {
            continue;
        };
        if bet.is_settled() || auto >= round.crash_point {
            continue;
        }
        let amount = auto
            .payout(bet.amount)
            .ok_or_else(|| LedgerError::InvalidAmount(format!("bonus overflow for bet {}", bet.id)))?;
        bonuses.push(BonusEntry {
            user_id: bet.user_id,
            bet_id: bet.id,
            amount,
        });
    }
    Ok(bonuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{chain::HashChainGenerator, crash::CrashResolver, metrics::LedgerMetrics, storage::LedgerStore};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn lifecycle(dir: &TempDir, seed: &str, rounds: u64) -> (RoundLifecycle, Ledger) {
        let store = LedgerStore::open_path(dir.path()).unwrap();
        HashChainGenerator::new(store.clone(), CrashResolver::default(), 100)
            .extend(FIRST_ROUND_ID - 1, rounds, seed)
            .unwrap();
        let ledger = Ledger::new(store, CrashResolver::default(), Arc::new(LedgerMetrics::new()));
        (RoundLifecycle::new(ledger.clone()), ledger)
    }

    #[tokio::test]
    async fn test_phase_transitions_are_enforced() {
        let dir = TempDir::new().unwrap();
        let (rounds, ledger) = lifecycle(&dir, "scenario-2117", 2);
        let user = ledger.create_user("phase").unwrap();
        ledger.credit(user.id, "fund", 1_000, "addr").unwrap();

        assert!(matches!(rounds.place_bet(user.id, 10, None).await, Err(RoundError::NoActiveRound)));
        assert!(matches!(rounds.start(), Err(RoundError::NoActiveRound)));

        let round = rounds.create_round().await.unwrap();
        assert_eq!(round.id, FIRST_ROUND_ID);
        assert_eq!(rounds.status().phase, RoundPhase::Betting);
        assert!(rounds.status().crash_point.is_none());
        assert!(matches!(rounds.create_round().await, Err(RoundError::WrongPhase { .. })));
        assert!(matches!(rounds.settle().await, Err(RoundError::WrongPhase { .. })));

        rounds.place_bet(user.id, 10, None).await.unwrap();
        rounds.start().unwrap();
        assert!(matches!(rounds.place_bet(user.id, 10, None).await, Err(RoundError::WrongPhase { .. })));

        assert!(rounds.advance(round.crash_point).unwrap());
        rounds.settle().await.unwrap();
        assert_eq!(rounds.status().phase, RoundPhase::Settled);
        assert!(matches!(rounds.settle().await, Err(RoundError::WrongPhase { .. })));
        assert!(matches!(rounds.cash_out(user.id, 1).await, Err(RoundError::WrongPhase { .. })));

        assert_eq!(rounds.create_round().await.unwrap().id, FIRST_ROUND_ID + 1);
    }

    #[tokio::test]
    async fn test_manual_cash_out_before_crash() {
        let dir = TempDir::new().unwrap();
        let (rounds, ledger) = lifecycle(&dir, "scenario-2117", 1);
        let user = ledger.create_user("manual").unwrap();
        ledger.credit(user.id, "fund", 100, "addr").unwrap();

        rounds.create_round().await.unwrap();
        let bet_id = rounds.place_bet(user.id, 100, None).await.unwrap();
        rounds.start().unwrap();
        assert!(!rounds.advance(Multiplier::from_hundredths(150)).unwrap());

        assert_eq!(rounds.cash_out(user.id, bet_id).await.unwrap(), 150);
        assert!(matches!(
            rounds.cash_out(user.id, bet_id).await,
            Err(RoundError::Ledger(LedgerError::AlreadyCashedOut { .. }))
        ));

        assert!(rounds.advance(Multiplier::from_hundredths(400)).unwrap());
        assert_eq!(rounds.status().crash_point, Some(Multiplier::from_hundredths(350)));
        assert!(rounds.settle().await.unwrap().is_empty());
        assert_eq!(ledger.get_user(user.id).unwrap().balance, 150);
    }

    #[tokio::test]
    async fn test_settle_waits_for_the_crash_point() {
        let dir = TempDir::new().unwrap();
        let (rounds, ledger) = lifecycle(&dir, "scenario-2117", 1);
        let user = ledger.create_user("early").unwrap();
        ledger.credit(user.id, "fund", 100, "addr").unwrap();

        let round = rounds.create_round().await.unwrap();
        let bet_id = rounds.place_bet(user.id, 100, None).await.unwrap();
        rounds.start().unwrap();
        assert!(!rounds.advance(Multiplier::from_hundredths(120)).unwrap());

        assert!(matches!(
            rounds.settle().await,
            Err(RoundError::NotBusted { round_id, .. }) if round_id == round.id
        ));
        assert_eq!(rounds.status().phase, RoundPhase::Running);
        assert!(!ledger.get_round(round.id).unwrap().unwrap().ended);

        // The cash-out window is still open.
        assert_eq!(rounds.cash_out(user.id, bet_id).await.unwrap(), 120);
        assert!(rounds.advance(Multiplier::from_hundredths(350)).unwrap());
        rounds.settle().await.unwrap();
        assert_eq!(ledger.get_user(user.id).unwrap().balance, 120);
    }

    #[tokio::test]
    async fn test_cash_out_rejected_after_bust() {
        let dir = TempDir::new().unwrap();
        let (rounds, ledger) = lifecycle(&dir, "scenario-2117", 1);
        let user = ledger.create_user("late").unwrap();
        ledger.credit(user.id, "fund", 100, "addr").unwrap();

        rounds.create_round().await.unwrap();
        let bet_id = rounds.place_bet(user.id, 100, Some(Multiplier::from_hundredths(500))).await.unwrap();
        rounds.start().unwrap();
        assert!(rounds.advance(Multiplier::from_hundredths(350)).unwrap());

        assert!(matches!(rounds.cash_out(user.id, bet_id).await, Err(RoundError::Busted { .. })));
        assert!(rounds.settle().await.unwrap().is_empty());
        assert_eq!(ledger.get_user(user.id).unwrap().balance, 0);
    }

    #[tokio::test]
    async fn test_recover_unsettled_round() {
        let dir = TempDir::new().unwrap();
        let (rounds, ledger) = lifecycle(&dir, "scenario-2117", 1);
        let user = ledger.create_user("crash").unwrap();
        ledger.credit(user.id, "fund", 100, "addr").unwrap();
        rounds.create_round().await.unwrap();
        rounds.place_bet(user.id, 100, Some(Multiplier::from_hundredths(200))).await.unwrap();
        drop(rounds);

        let restarted = RoundLifecycle::new(ledger.clone());
        assert_eq!(restarted.recover().await.unwrap(), Some(FIRST_ROUND_ID));
        let bonuses = restarted.settle().await.unwrap();
        assert_eq!(bonuses.len(), 1);
        assert_eq!(ledger.get_user(user.id).unwrap().balance, 200);
    }
}
