//! Error types for the Crashline settlement core
//!
//! Storage errors keep constraint violations distinguishable by class so the
//! ledger can translate them into named domain rejections instead of generic
//! failures.

use thiserror::Error;

/// Root error type for all Crashline operations
#[derive(Debug, Error)]
pub enum CrashlineError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Hash chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Payment provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Round error: {0}")]
    Round(#[from] RoundError),

    #[error("Withdrawal error: {0}")]
    Withdrawal(#[from] WithdrawalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

/// Configuration and validation errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

/// Errors surfaced by the durable store.
///
/// `CheckViolation` and `UniqueViolation` carry the constraint name so callers
/// can tell which rule rejected the write.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("check constraint violated: {constraint}")]
    CheckViolation { constraint: &'static str },

    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: &'static str },

    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("corrupted row at {key}: {reason}")]
    Corrupted { key: String, reason: String },

    #[error("database error: {0}")]
    Backend(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        match e.kind() {
            rocksdb::ErrorKind::Busy
            | rocksdb::ErrorKind::TimedOut
            | rocksdb::ErrorKind::TryAgain => StoreError::Conflict(e.to_string()),
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

/// Ledger operation failures: named domain rejections plus invariant violations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("bet {bet_id} already cashed out")]
    AlreadyCashedOut { bet_id: u64 },

    #[error("no precomputed hash for round {round_id}")]
    NoPrecomputedHash { round_id: u64 },

    #[error("duplicate idempotency key: {key}")]
    DuplicateIdempotencyKey { key: String },

    #[error("user does not exist")]
    UserNotFound,

    #[error("username already taken: {username}")]
    UsernameTaken { username: String },

    #[error("not a valid token")]
    NotValidToken,

    #[error("bet {bet_id} not found")]
    BetNotFound { bet_id: u64 },

    #[error("funding {funding_id} not found")]
    FundingNotFound { funding_id: u64 },

    #[error("round {round_id} already settled")]
    RoundAlreadySettled { round_id: u64 },

    #[error("deposit address already assigned: {address}")]
    AddressTaken { address: String },

    #[error("funding {funding_id} already linked to {external_tx_id}")]
    AlreadyLinked { funding_id: u64, external_tx_id: String },

    #[error("external transaction {external_tx_id} already recorded")]
    DuplicateExternalTx { external_tx_id: String },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("settlement row count mismatch: expected {expected}, affected {affected}")]
    SettlementMismatch { expected: usize, affected: usize },

    #[error("round {round_id} out of sequence (expected {expected})")]
    RoundOutOfSequence { round_id: u64, expected: u64 },

    #[error("missing row: {0}")]
    MissingRow(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Stable code reported to callers.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            LedgerError::AlreadyCashedOut { .. } => "ALREADY_CASHED_OUT",
            LedgerError::NoPrecomputedHash { .. } => "NO_PRECOMPUTED_HASH",
            LedgerError::DuplicateIdempotencyKey { .. } => "DUPLICATE_IDEMPOTENCY_KEY",
            LedgerError::UserNotFound => "USER_NOT_FOUND",
            LedgerError::UsernameTaken { .. } => "USERNAME_TAKEN",
            LedgerError::NotValidToken => "NOT_VALID_TOKEN",
            LedgerError::BetNotFound { .. } => "BET_NOT_FOUND",
            LedgerError::FundingNotFound { .. } => "FUNDING_NOT_FOUND",
            LedgerError::RoundAlreadySettled { .. } => "ROUND_ALREADY_SETTLED",
            LedgerError::AddressTaken { .. } => "ADDRESS_TAKEN",
            LedgerError::AlreadyLinked { .. } => "ALREADY_LINKED",
            LedgerError::DuplicateExternalTx { .. } => "DUPLICATE_EXTERNAL_TX",
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::SettlementMismatch { .. } => "SETTLEMENT_MISMATCH",
            LedgerError::RoundOutOfSequence { .. } => "ROUND_OUT_OF_SEQUENCE",
            LedgerError::MissingRow(_) => "MISSING_ROW",
            LedgerError::Store(_) => "STORAGE_FAILURE",
        }
    }

    /// Invariant violations abort the enclosing operation and are never retried
    /// as ordinary rejections.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            LedgerError::SettlementMismatch { .. }
                | LedgerError::RoundOutOfSequence { .. }
                | LedgerError::MissingRow(_)
                | LedgerError::NoPrecomputedHash { .. }
        )
    }
}

/// Hash chain generation and verification errors
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid round hash '{value}': {reason}")]
    InvalidHash { value: String, reason: String },

    #[error("segment must contain at least one round")]
    EmptySegment,

    #[error("chain head is at round {head}, cannot extend from {from}")]
    NotAtHead { head: u64, from: u64 },

    #[error("seed does not reproduce the stored hash for round {round_id}")]
    SeedMismatch { round_id: u64 },

    #[error("segment in progress ends at round {in_progress}, requested {requested}")]
    SegmentMismatch { in_progress: u64, requested: u64 },

    #[error("broken link between rounds {round_id} and {next}")]
    BrokenLink { round_id: u64, next: u64 },

    #[error("{count} rounds after round {from} fall outside the round id range")]
    RangeOverflow { from: u64, count: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors returned by the external payment provider client.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider rejected request ({code}): {message}")]
    Api { code: String, message: String },

    #[error("provider transport failure: {0}")]
    Transport(String),

    #[error("provider call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("unable to parse provider response: {0}")]
    Parse(String),
}

impl ProviderError {
    /// Provider code meaning the payout account lacks liquidity.
    pub const INSUFFICIENT_FUNDS_CODE: &'static str = "insufficient_funds";

    pub fn is_insufficient_liquidity(&self) -> bool {
        matches!(self, ProviderError::Api { code, .. } if code.eq_ignore_ascii_case(Self::INSUFFICIENT_FUNDS_CODE))
    }
}

/// Round lifecycle errors
#[derive(Debug, Error)]
pub enum RoundError {
    #[error("round {round_id} is {phase}, expected {expected}")]
    WrongPhase {
        round_id: u64,
        phase: &'static str,
        expected: &'static str,
    },

    #[error("no active round")]
    NoActiveRound,

    #[error("round {round_id} busted at {crash_point}")]
    Busted { round_id: u64, crash_point: String },

    #[error("round {round_id} is still running at {multiplier}")]
    NotBusted { round_id: u64, multiplier: String },

    #[error("cash out at {requested} not allowed: {reason}")]
    InvalidCashOut { requested: String, reason: &'static str },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("blocking task failed: {0}")]
    Join(String),
}

/// Withdrawal pipeline failures that are not caller-facing states.
#[derive(Debug, Error)]
pub enum WithdrawalError {
    #[error("amount {amount} below minimum withdrawal {minimum}")]
    BelowMinimum { amount: u64, minimum: u64 },

    #[error("funding {funding_id} is not a withdrawal")]
    NotAWithdrawal { funding_id: u64 },

    #[error("payout sent but funding {funding_id} could not be linked to {tx_hash}: {source}")]
    LinkFailed {
        funding_id: u64,
        tx_hash: String,
        #[source]
        source: LedgerError,
    },

    #[error("provider response for funding {funding_id} carried no transaction id")]
    MissingTransactionId { funding_id: u64 },

    #[error("payout sent for funding {funding_id} but could not be recorded: {source}")]
    PayoutNotRecorded {
        funding_id: u64,
        #[source]
        source: LedgerError,
    },

    #[error("funding {funding_id} was paid out without a transaction id; relink it with the network hash")]
    PayoutUnconfirmed { funding_id: u64 },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("blocking task failed: {0}")]
    Join(String),
}

/// Convenience type alias for Results
pub type CrashlineResult<T> = Result<T, CrashlineError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type LedgerResult<T> = Result<T, LedgerError>;
pub type ChainResult<T> = Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_ledger_error_codes() {
        assert_eq!(LedgerError::InsufficientFunds.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(
            LedgerError::AlreadyCashedOut { bet_id: 7 }.code(),
            "ALREADY_CASHED_OUT"
        );
        assert_eq!(
            LedgerError::DuplicateIdempotencyKey { key: "k".into() }.code(),
            "DUPLICATE_IDEMPOTENCY_KEY"
        );
    }

    #[test]
    fn test_invariant_classification() {
        assert!(LedgerError::SettlementMismatch { expected: 2, affected: 1 }.is_invariant_violation());
        assert!(!LedgerError::InsufficientFunds.is_invariant_violation());
    }

    #[test]
    fn test_liquidity_classification_ignores_case() {
        let err = ProviderError::Api {
            code: "INSUFFICIENT_FUNDS".into(),
            message: "not enough BTC".into(),
        };
        assert!(err.is_insufficient_liquidity());
        assert!(!ProviderError::Timeout { timeout_ms: 10 }.is_insufficient_liquidity());
    }

    #[test]
    fn test_error_conversion_and_source() {
        let root: CrashlineError = ConfigurationError::ValidationFailed("test".into()).into();
        assert!(root.to_string().contains("Configuration error"));
        assert!(root.source().is_some());
    }
}
