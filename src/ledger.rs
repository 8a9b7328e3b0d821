//! Atomic balance, bet, round and funding operations.
//!
//! Each public operation runs in exactly one store transaction. Concurrency
//! control is the store's row locking plus its check and unique constraints;
//! nothing here takes an application-level lock. Constraint violations come
//! back from the store by class and are translated into named rejections.

use crate::{
    crash::{CrashResolver, Multiplier},
    errors::{LedgerError, LedgerResult, StoreError},
    metrics::LedgerMetrics,
    storage::{
        keys, LedgerStore, StoreTxn, BALANCE_NON_NEGATIVE, DEPOSIT_ADDRESS_UNIQUE, DEPOSIT_TX_UNIQUE,
        IDEMPOTENCY_KEY_UNIQUE, ROUND_ID_UNIQUE, USERNAME_UNIQUE, WITHDRAWAL_TX_UNIQUE,
    },
    types::{
        now_millis, Bet, BonusEntry, Funding, FundingDirection, PlayerSummary, Round, RoundSummary, Session,
        User, FIRST_ROUND_ID,
    },
};
use std::{collections::BTreeMap, sync::Arc};

const USER_SEQUENCE: &str = "user";
const BET_SEQUENCE: &str = "bet";
const FUNDING_SEQUENCE: &str = "funding";

/// Outcome of [`Ledger::credit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreditOutcome {
    Credited { funding_id: u64 },
    /// The external transaction was credited before; nothing changed.
    AlreadyRecorded,
}

fn balance_error(e: StoreError) -> LedgerError {
    match e {
        StoreError::CheckViolation { constraint: BALANCE_NON_NEGATIVE } => LedgerError::InsufficientFunds,
        other => LedgerError::Store(other),
    }
}

fn signed(amount: u64) -> LedgerResult<i64> {
    if amount == 0 {
        return Err(LedgerError::InvalidAmount("amount must be positive".to_string()));
    }
    i64::try_from(amount).map_err(|_| LedgerError::InvalidAmount(format!("{} exceeds balance range", amount)))
}

/// Settlement ledger over the durable store.
#[derive(Clone)]
pub struct Ledger {
    store: LedgerStore,
    resolver: CrashResolver,
    metrics: Arc<LedgerMetrics>,
}

impl Ledger {
    pub fn new(store: LedgerStore, resolver: CrashResolver, metrics: Arc<LedgerMetrics>) -> Self {
        Self { store, resolver, metrics }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn resolver(&self) -> &CrashResolver {
        &self.resolver
    }

    pub fn metrics(&self) -> &Arc<LedgerMetrics> {
        &self.metrics
    }

    // --- users & sessions ---

    pub fn create_user(&self, username: &str) -> LedgerResult<User> {
        let username = username.trim();
        if username.is_empty() {
            return Err(LedgerError::InvalidAmount("username must not be empty".to_string()));
        }

        let txn = self.store.begin();
        let id = txn.next_sequence(USER_SEQUENCE)?;
        txn.insert_unique(USERNAME_UNIQUE, &keys::username(username), &id.to_be_bytes())
            .map_err(|e| match e {
                StoreError::UniqueViolation { .. } => LedgerError::UsernameTaken {
                    username: username.to_string(),
                },
                other => other.into(),
            })?;

        let user = User {
            id,
            username: username.to_string(),
            balance: 0,
            created_at: now_millis(),
        };
        txn.put(&keys::user(id), &user)?;
        txn.commit()?;

        tracing::info!(user_id = id, username = %user.username, "user created");
        Ok(user)
    }

    pub fn get_user(&self, user_id: u64) -> LedgerResult<User> {
        self.store
            .get_json(&keys::user(user_id))?
            .ok_or(LedgerError::UserNotFound)
    }

    /// Case-insensitive lookup.
    pub fn get_user_by_name(&self, username: &str) -> LedgerResult<User> {
        let user_id = self
            .store
            .get_u64(&keys::username(username.trim()))?
            .ok_or(LedgerError::UserNotFound)?;
        self.get_user(user_id)
    }

    pub fn create_session(&self, user_id: u64, one_time: bool) -> LedgerResult<String> {
        let txn = self.store.begin();
        if txn.get::<User>(&keys::user(user_id))?.is_none() {
            return Err(LedgerError::UserNotFound);
        }
        let session = Session {
            token: uuid::Uuid::new_v4().to_string(),
            user_id,
            one_time,
            expired_at: None,
        };
        txn.put(&keys::session(&session.token), &session)?;
        txn.commit()?;
        Ok(session.token)
    }

    /// Consume a one-time session token and return its user.
    pub fn validate_one_time_token(&self, token: &str) -> LedgerResult<User> {
        let txn = self.store.begin();
        let key = keys::session(token);
        let mut session = match txn.lock::<Session>(&key)? {
            Some(session) if session.one_time && session.expired_at.is_none() => session,
            _ => return Err(LedgerError::NotValidToken),
        };
        let user = txn
            .get::<User>(&keys::user(session.user_id))?
            .ok_or(LedgerError::UserNotFound)?;

        session.expired_at = Some(now_millis());
        txn.put(&key, &session)?;
        txn.commit()?;
        Ok(user)
    }

    // --- deposit addresses ---

    pub fn record_deposit_address(&self, user_id: u64, address: &str) -> LedgerResult<()> {
        let txn = self.store.begin();
        if txn.get::<User>(&keys::user(user_id))?.is_none() {
            return Err(LedgerError::UserNotFound);
        }
        txn.insert_unique(DEPOSIT_ADDRESS_UNIQUE, &keys::deposit_address(address), &user_id.to_be_bytes())
            .map_err(|e| match e {
                StoreError::UniqueViolation { .. } => LedgerError::AddressTaken {
                    address: address.to_string(),
                },
                other => other.into(),
            })?;
        txn.commit()?;
        Ok(())
    }

    pub fn resolve_deposit_address(&self, address: &str) -> LedgerResult<Option<u64>> {
        Ok(self.store.get_u64(&keys::deposit_address(address))?)
    }

    // --- rounds & bets ---

    /// Persist the next round from its precommitted hash.
    pub fn create_round(&self, round_id: u64) -> LedgerResult<Round> {
        let txn = self.store.begin();

        let expected = match txn.lock_u64(keys::LAST_ROUND)? {
            Some(last) => last + 1,
            None => FIRST_ROUND_ID,
        };
        if round_id != expected {
            return Err(LedgerError::RoundOutOfSequence { round_id, expected });
        }

        let hash = txn
            .lock_hash(&keys::chain_hash(round_id))?
            .ok_or(LedgerError::NoPrecomputedHash { round_id })?;

        let round = Round {
            id: round_id,
            hash,
            crash_point: self.resolver.crash_point(&hash),
            ended: false,
            created_at: now_millis(),
        };
        let row = serde_json::to_vec(&round).map_err(|e| StoreError::Corrupted {
            key: format!("round:{}", round_id),
            reason: e.to_string(),
        })?;
        txn.insert_unique(ROUND_ID_UNIQUE, &keys::round(round_id), &row)?;
        txn.put_u64(keys::LAST_ROUND, round_id)?;
        txn.commit()?;

        self.metrics.round_created();
        tracing::info!(round_id, crash_point = %round.crash_point, "round created");
        Ok(round)
    }

    pub fn get_round(&self, round_id: u64) -> LedgerResult<Option<Round>> {
        Ok(self.store.get_json(&keys::round(round_id))?)
    }

    /// Latest created round, if any.
    pub fn last_round(&self) -> LedgerResult<Option<Round>> {
        match self.store.get_u64(keys::LAST_ROUND)? {
            Some(round_id) => self
                .get_round(round_id)?
                .map(Some)
                .ok_or_else(|| LedgerError::MissingRow(format!("round {}", round_id))),
            None => Ok(None),
        }
    }

    /// Debit the stake and record the bet.
    pub fn place_bet(
        &self,
        user_id: u64,
        amount: u64,
        auto_cash_out: Option<Multiplier>,
        round_id: u64,
    ) -> LedgerResult<u64> {
        let delta = signed(amount)?;
        if matches!(auto_cash_out, Some(m) if m <= Multiplier::ONE) {
            return Err(LedgerError::InvalidAmount("auto cash out must exceed 1.00x".to_string()));
        }

        let txn = self.store.begin();
        let round = txn
            .get::<Round>(&keys::round(round_id))?
            .ok_or_else(|| LedgerError::MissingRow(format!("round {}", round_id)))?;
        if round.ended {
            return Err(LedgerError::RoundAlreadySettled { round_id });
        }

        // Sequence row before user row, the same order credit and debit use.
        let bet_id = txn.next_sequence(BET_SEQUENCE)?;
        txn.adjust_balance(user_id, -delta)
            .map_err(balance_error)?
            .ok_or(LedgerError::UserNotFound)?;

        let bet = Bet {
            id: bet_id,
            user_id,
            round_id,
            amount,
            auto_cash_out,
            cash_out: None,
            bonus: None,
        };
        txn.put(&keys::bet(bet.id), &bet)?;
        txn.put_raw(&keys::round_bet(round_id, bet.id), &[])?;
        txn.commit()?;

        self.metrics.bet_placed();
        tracing::debug!(user_id, round_id, bet_id = bet.id, amount, "bet placed");
        Ok(bet.id)
    }

    /// Credit `amount` and mark the bet cashed out. Only the first of any
    /// number of concurrent calls for the same bet succeeds.
    pub fn cash_out(&self, user_id: u64, bet_id: u64, amount: u64) -> LedgerResult<()> {
        let delta = signed(amount)?;
        let result = self.apply_cash_out(user_id, bet_id, delta);
        if matches!(result, Err(LedgerError::AlreadyCashedOut { .. })) {
            self.metrics.cash_out_rejected();
        }
        result
    }

    fn apply_cash_out(&self, user_id: u64, bet_id: u64, delta: i64) -> LedgerResult<()> {
        let txn = self.store.begin();
        let key = keys::bet(bet_id);
        let mut bet = match txn.lock::<Bet>(&key)? {
            Some(bet) if bet.user_id == user_id => bet,
            _ => return Err(LedgerError::BetNotFound { bet_id }),
        };
        if bet.is_settled() {
            return Err(LedgerError::AlreadyCashedOut { bet_id });
        }
        if self.round_ended(&txn, bet.round_id)? {
            return Err(LedgerError::RoundAlreadySettled { round_id: bet.round_id });
        }

        txn.adjust_balance(user_id, delta)
            .map_err(balance_error)?
            .ok_or(LedgerError::UserNotFound)?;
        bet.cash_out = Some(delta as u64);
        txn.put(&key, &bet)?;
        txn.commit()?;

        self.metrics.cash_out();
        tracing::debug!(user_id, bet_id, amount = delta, "bet cashed out");
        Ok(())
    }

    fn round_ended(&self, txn: &StoreTxn<'_>, round_id: u64) -> LedgerResult<bool> {
        Ok(txn
            .get::<Round>(&keys::round(round_id))?
            .map(|r| r.ended)
            .unwrap_or(false))
    }

    /// End the round and apply every bonus, or nothing at all.
    pub fn settle_round(&self, round_id: u64, bonuses: &[BonusEntry]) -> LedgerResult<()> {
        if let Some(entry) = bonuses.iter().find(|b| b.amount == 0) {
            return Err(LedgerError::InvalidAmount(format!("zero bonus for bet {}", entry.bet_id)));
        }

        let txn = self.store.begin();
        let round_key = keys::round(round_id);
        let mut round = txn
            .lock::<Round>(&round_key)?
            .ok_or_else(|| LedgerError::MissingRow(format!("round {}", round_id)))?;
        if round.ended {
            return Err(LedgerError::RoundAlreadySettled { round_id });
        }
        round.ended = true;
        txn.put(&round_key, &round)?;

        let mut affected = 0;
        for entry in bonuses {
            if self.apply_bonus(&txn, round_id, entry)? {
                affected += 1;
            }
        }
        if affected != bonuses.len() {
            tracing::error!(
                round_id,
                expected = bonuses.len(),
                affected,
                "settlement row count mismatch, rolling back"
            );
            return Err(LedgerError::SettlementMismatch {
                expected: bonuses.len(),
                affected,
            });
        }
        txn.commit()?;

        self.metrics.round_settled(bonuses.len());
        tracing::info!(round_id, bonuses = bonuses.len(), "round settled");
        Ok(())
    }

    /// Returns whether the entry matched exactly one open bet and user.
    fn apply_bonus(&self, txn: &StoreTxn<'_>, round_id: u64, entry: &BonusEntry) -> LedgerResult<bool> {
        let key = keys::bet(entry.bet_id);
        let mut bet = match txn.lock::<Bet>(&key)? {
            Some(bet) if bet.user_id == entry.user_id && bet.round_id == round_id && !bet.is_settled() => bet,
            _ => return Ok(false),
        };
        let delta = signed(entry.amount)?;
        if txn.adjust_balance(entry.user_id, delta).map_err(balance_error)?.is_none() {
            return Ok(false);
        }
        bet.bonus = Some(entry.amount);
        txn.put(&key, &bet)?;
        Ok(true)
    }

    pub fn get_bet(&self, bet_id: u64) -> LedgerResult<Bet> {
        self.store
            .get_json(&keys::bet(bet_id))?
            .ok_or(LedgerError::BetNotFound { bet_id })
    }

    /// Bets on a round in placement order.
    pub fn round_bets(&self, round_id: u64) -> LedgerResult<Vec<Bet>> {
        let index = self
            .store
            .scan_prefix(&keys::round_bets_prefix(round_id), usize::MAX)?;
        index
            .iter()
            .filter_map(|(key, _)| keys::trailing_id(key))
            .map(|bet_id| self.get_bet(bet_id))
            .collect()
    }

    // --- fundings ---

    /// Credit an observed deposit. Safe to repeat with the same external id.
    pub fn credit(&self, user_id: u64, external_tx_id: &str, amount: u64, address: &str) -> LedgerResult<CreditOutcome> {
        let delta = signed(amount)?;

        let txn = self.store.begin();
        let funding_id = txn.next_sequence(FUNDING_SEQUENCE)?;
        match txn.insert_unique(
            DEPOSIT_TX_UNIQUE,
            &keys::funding_deposit_tx(external_tx_id),
            &funding_id.to_be_bytes(),
        ) {
            Ok(()) => {}
            Err(StoreError::UniqueViolation { .. }) => {
                tracing::debug!(external_tx_id, "deposit already recorded");
                return Ok(CreditOutcome::AlreadyRecorded);
            }
            Err(e) => return Err(e.into()),
        }

        txn.adjust_balance(user_id, delta)
            .map_err(balance_error)?
            .ok_or(LedgerError::UserNotFound)?;
        let funding = Funding {
            id: funding_id,
            user_id,
            direction: FundingDirection::Deposit,
            amount,
            address: address.to_string(),
            external_tx_id: Some(external_tx_id.to_string()),
            idempotency_key: None,
            created_at: now_millis(),
            payout_sent: false,
            payout_tx_id: None,
        };
        txn.put(&keys::funding(funding_id), &funding)?;
        txn.commit()?;

        tracing::info!(user_id, funding_id, external_tx_id, amount, "deposit credited");
        Ok(CreditOutcome::Credited { funding_id })
    }

    pub fn is_deposit_recorded(&self, external_tx_id: &str) -> LedgerResult<bool> {
        Ok(self
            .store
            .get_raw(&keys::funding_deposit_tx(external_tx_id))?
            .is_some())
    }

    /// Debit a withdrawal and record it under the caller's idempotency key.
    pub fn debit(&self, user_id: u64, amount: u64, address: &str, idempotency_key: &str) -> LedgerResult<u64> {
        let delta = signed(amount)?;

        let txn = self.store.begin();
        let funding_id = txn.next_sequence(FUNDING_SEQUENCE)?;
        txn.insert_unique(
            IDEMPOTENCY_KEY_UNIQUE,
            &keys::funding_idempotency(idempotency_key),
            &funding_id.to_be_bytes(),
        )
        .map_err(|e| match e {
            StoreError::UniqueViolation { .. } => LedgerError::DuplicateIdempotencyKey {
                key: idempotency_key.to_string(),
            },
            other => other.into(),
        })?;

        txn.adjust_balance(user_id, -delta)
            .map_err(balance_error)?
            .ok_or(LedgerError::UserNotFound)?;
        let funding = Funding {
            id: funding_id,
            user_id,
            direction: FundingDirection::Withdrawal,
            amount,
            address: address.to_string(),
            external_tx_id: None,
            idempotency_key: Some(idempotency_key.to_string()),
            created_at: now_millis(),
            payout_sent: false,
            payout_tx_id: None,
        };
        txn.put(&keys::funding(funding_id), &funding)?;
        txn.commit()?;

        tracing::info!(user_id, funding_id, amount, "withdrawal debited");
        Ok(funding_id)
    }

    /// Mark a withdrawal as paid out by the provider, keeping the reported hash
    /// if there is one. Committed on its own so a failed link never leaves the
    /// row looking unsent.
    pub fn record_payout(&self, funding_id: u64, tx_hash: Option<&str>) -> LedgerResult<()> {
        let txn = self.store.begin();
        let key = keys::funding(funding_id);
        let mut funding = txn
            .lock::<Funding>(&key)?
            .ok_or(LedgerError::FundingNotFound { funding_id })?;

        funding.payout_sent = true;
        if let Some(hash) = tx_hash {
            funding.payout_tx_id = Some(hash.to_string());
        }
        txn.put(&key, &funding)?;
        txn.commit()?;

        tracing::info!(funding_id, tx_hash, "payout recorded");
        Ok(())
    }

    /// Attach the provider's transaction id to a funding row. Repeating with the
    /// same id is a no-op.
    pub fn link_withdrawal(&self, funding_id: u64, external_tx_id: &str) -> LedgerResult<()> {
        let txn = self.store.begin();
        let key = keys::funding(funding_id);
        let mut funding = txn
            .lock::<Funding>(&key)?
            .ok_or(LedgerError::FundingNotFound { funding_id })?;

        match funding.external_tx_id.as_deref() {
            Some(existing) if existing == external_tx_id => return Ok(()),
            Some(existing) => {
                return Err(LedgerError::AlreadyLinked {
                    funding_id,
                    external_tx_id: existing.to_string(),
                })
            }
            None => {}
        }

        txn.insert_unique(
            WITHDRAWAL_TX_UNIQUE,
            &keys::funding_withdrawal_tx(external_tx_id),
            &funding_id.to_be_bytes(),
        )
        .map_err(|e| match e {
            StoreError::UniqueViolation { .. } => LedgerError::DuplicateExternalTx {
                external_tx_id: external_tx_id.to_string(),
            },
            other => other.into(),
        })?;
        funding.external_tx_id = Some(external_tx_id.to_string());
        funding.payout_sent = true;
        funding.payout_tx_id = Some(external_tx_id.to_string());
        txn.put(&key, &funding)?;
        txn.commit()?;
        Ok(())
    }

    pub fn get_funding(&self, funding_id: u64) -> LedgerResult<Funding> {
        self.store
            .get_json(&keys::funding(funding_id))?
            .ok_or(LedgerError::FundingNotFound { funding_id })
    }

    /// Debited withdrawals still waiting for a provider transaction id.
    pub fn unlinked_withdrawals(&self) -> LedgerResult<Vec<Funding>> {
        Ok(self
            .store
            .scan_json::<Funding>(keys::FUNDING, usize::MAX)?
            .into_iter()
            .filter(|f| f.direction == FundingDirection::Withdrawal && !f.is_linked())
            .collect())
    }

    // --- read side ---

    /// Most recent ended rounds, newest first.
    pub fn round_history(&self, limit: usize) -> LedgerResult<Vec<RoundSummary>> {
        let rounds = self
            .store
            .scan_json_reverse::<Round, _>(keys::ROUND, limit, |round| round.ended)?;

        let mut usernames: BTreeMap<u64, String> = BTreeMap::new();
        let mut history = Vec::with_capacity(rounds.len());
        for round in rounds {
            let mut players = BTreeMap::new();
            for bet in self.round_bets(round.id)? {
                let username = match usernames.get(&bet.user_id) {
                    Some(name) => name.clone(),
                    None => {
                        let name = self.get_user(bet.user_id)?.username;
                        usernames.insert(bet.user_id, name.clone());
                        name
                    }
                };
                players.insert(
                    username,
                    PlayerSummary {
                        bet: bet.amount,
                        stopped_at: bet.stopped_at(),
                        bonus: bet.bonus,
                    },
                );
            }
            history.push(RoundSummary {
                round_id: round.id,
                hash: round.hash,
                crash_point: round.crash_point,
                created_at: round.created_at,
                players,
            });
        }
        Ok(history)
    }

    /// Deposits minus withdrawals minus what the house owes its users.
    pub fn bankroll(&self) -> LedgerResult<i128> {
        let fundings: i128 = self
            .store
            .scan_json::<Funding>(keys::FUNDING, usize::MAX)?
            .iter()
            .map(Funding::signed_amount)
            .sum();
        let balances: i128 = self
            .store
            .scan_json::<User>(keys::USER, usize::MAX)?
            .iter()
            .map(|u| u.balance as i128)
            .sum();
        Ok(fundings - balances)
    }
}
