//! Withdrawal pipeline: debit, pay out, reconcile.
//!
//! The ledger is debited before the provider is called, so every failure after
//! the debit leaves a withdrawal funding row with no external transaction id.
//! Such rows are retried through [`WithdrawalPipeline::retry_withdrawal`],
//! never by debiting again.
//!
//! Once the provider accepts a payout the row is marked sent, with the hash if
//! one came back, before the link is written. A retry on a sent row only
//! relinks; it never calls the provider again.

use crate::{
    config::{ProviderConfig, WithdrawalConfig},
    errors::{LedgerError, LedgerResult, ProviderError, StoreError, WithdrawalError},
    ledger::Ledger,
    metrics::LedgerMetrics,
    provider::{format_amount, PaymentProvider, SendRequest},
    retry::RetryPolicy,
    types::{Funding, FundingDirection},
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};

/// Caller-facing result of a withdrawal attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawalOutcome {
    Completed { funding_id: u64, tx_hash: String },
    AlreadyCompleted { funding_id: u64, tx_hash: String },
    NotEnoughMoney,
    DuplicateWithdrawal,
    /// Provider lacks liquidity; the debit stands until a retry pays it.
    Pending { funding_id: u64 },
    /// Payout outcome unknown; reconciled out of band.
    FundingQueued { funding_id: u64 },
}

impl WithdrawalOutcome {
    pub fn code(&self) -> &'static str {
        match self {
            WithdrawalOutcome::Completed { .. } => "COMPLETED",
            WithdrawalOutcome::AlreadyCompleted { .. } => "ALREADY_COMPLETED",
            WithdrawalOutcome::NotEnoughMoney => "NOT_ENOUGH_MONEY",
            WithdrawalOutcome::DuplicateWithdrawal => "DUPLICATE_WITHDRAWAL",
            WithdrawalOutcome::Pending { .. } => "PENDING",
            WithdrawalOutcome::FundingQueued { .. } => "FUNDING_QUEUED",
        }
    }
}

fn link_is_retryable(error: &LedgerError) -> bool {
    !matches!(
        error,
        LedgerError::AlreadyLinked { .. }
            | LedgerError::DuplicateExternalTx { .. }
            | LedgerError::FundingNotFound { .. }
    )
}

pub struct WithdrawalPipeline {
    ledger: Ledger,
    provider: Arc<dyn PaymentProvider>,
    metrics: Arc<LedgerMetrics>,
    network_fee: u64,
    min_withdrawal: u64,
    currency: String,
    provider_timeout: Duration,
    link_retry: RetryPolicy,
}

impl WithdrawalPipeline {
    pub fn new(
        ledger: Ledger,
        provider: Arc<dyn PaymentProvider>,
        config: &WithdrawalConfig,
        provider_config: &ProviderConfig,
    ) -> Self {
        let metrics = ledger.metrics().clone();
        Self {
            ledger,
            provider,
            metrics,
            network_fee: config.network_fee,
            min_withdrawal: config.min_withdrawal,
            currency: config.currency.clone(),
            provider_timeout: Duration::from_millis(provider_config.timeout_ms),
            link_retry: RetryPolicy::link(config.link_retry_attempts, config.link_retry_base_delay_ms),
        }
    }

    /// Debit `amount` (fee included) and send the net amount to `address`.
    pub async fn withdraw(
        &self,
        user_id: u64,
        amount: u64,
        address: &str,
        idempotency_key: &str,
    ) -> Result<WithdrawalOutcome, WithdrawalError> {
        if amount < self.min_withdrawal {
            return Err(WithdrawalError::BelowMinimum {
                amount,
                minimum: self.min_withdrawal,
            });
        }

        let ledger = self.ledger.clone();
        let (destination, key) = (address.to_string(), idempotency_key.to_string());
        let debit = tokio::task::spawn_blocking(move || ledger.debit(user_id, amount, &destination, &key))
            .await
            .map_err(|e| WithdrawalError::Join(e.to_string()))?;

        let funding_id = match debit {
            Ok(funding_id) => funding_id,
            Err(LedgerError::InsufficientFunds) => {
                self.metrics.withdrawal_rejected();
                return Ok(WithdrawalOutcome::NotEnoughMoney);
            }
            Err(LedgerError::DuplicateIdempotencyKey { .. }) => {
                self.metrics.withdrawal_rejected();
                return Ok(WithdrawalOutcome::DuplicateWithdrawal);
            }
            Err(e) => return Err(e.into()),
        };

        self.pay(funding_id, amount, address).await
    }

    /// Finish an existing unlinked withdrawal row. Rows the provider already
    /// paid are relinked with the recorded hash; only unsent rows are paid again.
    pub async fn retry_withdrawal(&self, funding_id: u64) -> Result<WithdrawalOutcome, WithdrawalError> {
        let funding = self.load_withdrawal(funding_id).await?;
        if let Some(tx_hash) = funding.external_tx_id {
            return Ok(WithdrawalOutcome::AlreadyCompleted { funding_id, tx_hash });
        }

        if funding.payout_sent {
            let Some(tx_hash) = funding.payout_tx_id else {
                return Err(WithdrawalError::PayoutUnconfirmed { funding_id });
            };
            tracing::info!(funding_id, tx_hash = %tx_hash, "payout already sent, relinking");
            return self.complete(funding_id, tx_hash).await;
        }

        tracing::info!(funding_id, "retrying withdrawal payout");
        self.pay(funding_id, funding.amount, &funding.address).await
    }

    /// Link a paid-out withdrawal to a hash found by reconciliation, for rows
    /// whose provider response was lost or carried no usable id.
    pub async fn relink(&self, funding_id: u64, tx_hash: &str) -> Result<WithdrawalOutcome, WithdrawalError> {
        let funding = self.load_withdrawal(funding_id).await?;
        if let Some(existing) = funding.external_tx_id {
            return Ok(WithdrawalOutcome::AlreadyCompleted {
                funding_id,
                tx_hash: existing,
            });
        }

        let hash = tx_hash.to_string();
        self.record(funding_id, move |ledger| ledger.record_payout(funding_id, Some(&hash)))
            .await
            .map_err(|source| WithdrawalError::PayoutNotRecorded { funding_id, source })?;
        tracing::info!(funding_id, tx_hash, "relinking withdrawal by hand");
        self.complete(funding_id, tx_hash.to_string()).await
    }

    /// Withdrawals debited but not yet linked to a provider transaction.
    pub async fn unlinked_withdrawals(&self) -> Result<Vec<Funding>, WithdrawalError> {
        let ledger = self.ledger.clone();
        Ok(tokio::task::spawn_blocking(move || ledger.unlinked_withdrawals())
            .await
            .map_err(|e| WithdrawalError::Join(e.to_string()))??)
    }

    async fn load_withdrawal(&self, funding_id: u64) -> Result<Funding, WithdrawalError> {
        let ledger = self.ledger.clone();
        let funding = tokio::task::spawn_blocking(move || ledger.get_funding(funding_id))
            .await
            .map_err(|e| WithdrawalError::Join(e.to_string()))??;
        if funding.direction != FundingDirection::Withdrawal {
            return Err(WithdrawalError::NotAWithdrawal { funding_id });
        }
        Ok(funding)
    }

    async fn pay(&self, funding_id: u64, gross: u64, address: &str) -> Result<WithdrawalOutcome, WithdrawalError> {
        let request = SendRequest {
            to: address.to_string(),
            amount: format_amount(gross.saturating_sub(self.network_fee)),
            currency: self.currency.clone(),
            idempotency_key: format!("funding-{}", funding_id),
        };

        let sent = match tokio::time::timeout(self.provider_timeout, self.provider.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                timeout_ms: self.provider_timeout.as_millis() as u64,
            }),
        };

        let receipt = match sent {
            Ok(receipt) => receipt,
            Err(e) if e.is_insufficient_liquidity() => {
                tracing::warn!(funding_id, error = %e, "provider lacks liquidity, withdrawal pending");
                self.metrics.withdrawal_pending();
                return Ok(WithdrawalOutcome::Pending { funding_id });
            }
            Err(e) => {
                tracing::warn!(funding_id, error = %e, "payout failed, withdrawal queued");
                self.metrics.withdrawal_queued();
                return Ok(WithdrawalOutcome::FundingQueued { funding_id });
            }
        };

        let tx_hash = receipt.transaction_hash();
        let recorded = tx_hash.clone();
        if let Err(source) = self
            .record(funding_id, move |ledger| ledger.record_payout(funding_id, recorded.as_deref()))
            .await
        {
            tracing::error!(funding_id, tx_hash = ?tx_hash, error = %source, "payout sent but not recorded");
            self.metrics.withdrawal_link_failed();
            return Err(WithdrawalError::PayoutNotRecorded { funding_id, source });
        }

        let Some(tx_hash) = tx_hash else {
            tracing::error!(funding_id, "payout sent but provider returned no transaction id");
            self.metrics.withdrawal_link_failed();
            return Err(WithdrawalError::MissingTransactionId { funding_id });
        };

        self.complete(funding_id, tx_hash).await
    }

    async fn complete(&self, funding_id: u64, tx_hash: String) -> Result<WithdrawalOutcome, WithdrawalError> {
        let hash = tx_hash.clone();
        if let Err(source) = self
            .record(funding_id, move |ledger| ledger.link_withdrawal(funding_id, &hash))
            .await
        {
            tracing::error!(funding_id, tx_hash = %tx_hash, error = %source, "could not link sent payout to its funding row");
            self.metrics.withdrawal_link_failed();
            return Err(WithdrawalError::LinkFailed {
                funding_id,
                tx_hash,
                source,
            });
        }

        self.metrics.withdrawal_completed();
        tracing::info!(funding_id, tx_hash = %tx_hash, "withdrawal completed");
        Ok(WithdrawalOutcome::Completed { funding_id, tx_hash })
    }

    /// Run a funding row write on the blocking pool under the link retry policy.
    async fn record<F>(&self, funding_id: u64, write: F) -> LedgerResult<()>
    where
        F: Fn(&Ledger) -> LedgerResult<()> + Clone + Send + 'static,
    {
        self.link_retry
            .retry_async_if(
                |attempt| {
                    let ledger = self.ledger.clone();
                    let write = write.clone();
                    async move {
                        if attempt > 0 {
                            tracing::warn!(funding_id, attempt, "retrying funding row write");
                        }
                        tokio::task::spawn_blocking(move || write(&ledger))
                            .await
                            .unwrap_or_else(|e| Err(LedgerError::Store(StoreError::Backend(e.to_string()))))
                    }
                },
                link_is_retryable,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_codes() {
        assert_eq!(WithdrawalOutcome::NotEnoughMoney.code(), "NOT_ENOUGH_MONEY");
        assert_eq!(WithdrawalOutcome::DuplicateWithdrawal.code(), "DUPLICATE_WITHDRAWAL");
        assert_eq!(WithdrawalOutcome::Pending { funding_id: 1 }.code(), "PENDING");
        assert_eq!(WithdrawalOutcome::FundingQueued { funding_id: 1 }.code(), "FUNDING_QUEUED");
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(WithdrawalOutcome::Pending { funding_id: 7 }).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["funding_id"], 7);
    }

    #[test]
    fn test_link_errors_that_are_final() {
        assert!(!link_is_retryable(&LedgerError::FundingNotFound { funding_id: 1 }));
        assert!(link_is_retryable(&LedgerError::Store(StoreError::Conflict("busy".into()))));
    }
}
