//! Crashline - settlement core for a provably-fair crash game
//!
//! Round outcomes come from a precomputed SHA-256 hash chain published in
//! reverse, so every played round can be checked against the one after it.
//! All balance movement goes through the [`Ledger`], which runs each operation
//! in a single RocksDB transaction and leans on row locks and uniqueness
//! constraints for concurrency safety. Deposits are discovered by polling the
//! payment provider and withdrawals are paid out through it.

pub mod api;
pub mod chain;
pub mod config;
pub mod crash;
pub mod depositor;
pub mod errors;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod provider;
pub mod retry;
pub mod round;
pub mod storage;
pub mod types;
pub mod withdrawal;

pub use chain::{ChainReport, ChainSegment, HashChainGenerator};
pub use config::{ConfigLoader, CrashlineConfig};
pub use crash::{CrashResolver, Multiplier, RoundHash};
pub use depositor::{assign_deposit_address, DepositWatcher, PollSummary};
pub use errors::{CrashlineError, CrashlineResult, LedgerError};
pub use ledger::{CreditOutcome, Ledger};
pub use metrics::LedgerMetrics;
pub use provider::PaymentProvider;
pub use round::{RoundLifecycle, RoundPhase};
pub use storage::LedgerStore;
pub use withdrawal::{WithdrawalOutcome, WithdrawalPipeline};
