//! Ledger data model: users, rounds, bets, fundings and sessions.

use crate::crash::{Multiplier, RoundHash};
use serde::{Deserialize, Serialize};

/// Rounds are numbered gaplessly from this offset.
pub const FIRST_ROUND_ID: u64 = 1_000_000;

/// Account holding a balance in minor currency units (satoshis).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: u64,
    pub username: String,
    pub balance: i64,
    pub created_at: i64,
}

/// A played round with its committed hash and derived crash point.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Round {
    pub id: u64,
    pub hash: RoundHash,
    pub crash_point: Multiplier,
    pub ended: bool,
    pub created_at: i64,
}

/// A user's wager on one round.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bet {
    pub id: u64,
    pub user_id: u64,
    pub round_id: u64,
    pub amount: u64,
    pub auto_cash_out: Option<Multiplier>,
    /// Amount credited on cash out, set at most once.
    pub cash_out: Option<u64>,
    /// Amount credited at settlement, set at most once.
    pub bonus: Option<u64>,
}

impl Bet {
    pub fn is_settled(&self) -> bool {
        self.cash_out.is_some() || self.bonus.is_some()
    }

    /// Multiplier the bet stopped at, derived from whichever credit applied.
    pub fn stopped_at(&self) -> Option<Multiplier> {
        let credited = self.cash_out.or(self.bonus)?;
        if self.amount == 0 {
            return None;
        }
        Some(Multiplier::from_hundredths(
            (credited as u128 * 100 / self.amount as u128) as u64,
        ))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FundingDirection {
    Deposit,
    Withdrawal,
}

/// Money moving in or out of the system.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Funding {
    pub id: u64,
    pub user_id: u64,
    pub direction: FundingDirection,
    /// Gross amount moved on the ledger.
    pub amount: u64,
    pub address: String,
    /// Provider transaction id, set once the external transfer is known.
    pub external_tx_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: i64,
    /// The provider accepted the payout. Set before the link is attempted.
    #[serde(default)]
    pub payout_sent: bool,
    /// Hash the provider reported for the payout, kept until it is linked.
    #[serde(default)]
    pub payout_tx_id: Option<String>,
}

impl Funding {
    pub fn is_linked(&self) -> bool {
        self.external_tx_id.is_some()
    }

    /// Paid out on the provider side but not yet linked on the ledger.
    pub fn awaiting_link(&self) -> bool {
        self.payout_sent && !self.is_linked()
    }

    /// Signed effect on the house's liabilities.
    pub fn signed_amount(&self) -> i128 {
        match self.direction {
            FundingDirection::Deposit => self.amount as i128,
            FundingDirection::Withdrawal => -(self.amount as i128),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user_id: u64,
    pub one_time: bool,
    pub expired_at: Option<i64>,
}

/// Auto cash-out credit applied at settlement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BonusEntry {
    pub user_id: u64,
    pub bet_id: u64,
    pub amount: u64,
}

/// Read-side projection of one player's bet in an ended round.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerSummary {
    pub bet: u64,
    pub stopped_at: Option<Multiplier>,
    pub bonus: Option<u64>,
}

/// Read-side projection of an ended round.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundSummary {
    pub round_id: u64,
    pub hash: RoundHash,
    pub crash_point: Multiplier,
    pub created_at: i64,
    pub players: std::collections::BTreeMap<String, PlayerSummary>,
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
