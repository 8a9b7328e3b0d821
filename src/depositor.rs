//! Deposit watcher: polls the provider and credits incoming payments.
//!
//! Goals:
//! - Credit each external transaction at most once. The unique external id in
//!   the store is the guarantee; the in-memory recency set only saves work.
//! - Never overlap polls. The next cycle is scheduled after the previous one,
//!   including its credit fan-out, has fully finished.
//! - A failed cycle logs and waits for the next tick; it never retries inline.

use crate::{
    config::{DepositorConfig, ProviderConfig},
    errors::{CrashlineError, CrashlineResult, ProviderError},
    ledger::{CreditOutcome, Ledger},
    metrics::LedgerMetrics,
    provider::{PageParams, PaymentProvider, ProviderTransaction},
};
use futures::future::join_all;
use lru::LruCache;
use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{Notify, Semaphore};

/// Bounded set of external ids already handled, oldest evicted first.
pub struct ProcessedTransactions {
    inner: Mutex<LruCache<String, ()>>,
}

impl ProcessedTransactions {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, LruCache<String, ()>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns `false` if the id was already tracked. Lookups never refresh an
    /// entry, so eviction follows insertion order.
    pub fn track(&self, id: &str) -> bool {
        let mut cache = self.cache();
        if cache.contains(id) {
            return false;
        }
        cache.put(id.to_string(), ());
        true
    }

    pub fn untrack(&self, id: &str) {
        self.cache().pop(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.cache().contains(id)
    }

    pub fn len(&self) -> usize {
        self.cache().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-transaction result of one poll cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DepositOutcome {
    Credited { funding_id: u64 },
    AlreadyRecorded,
    UnknownAddress,
    Failed(String),
}

/// Counts for one completed poll cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub fetched: usize,
    pub candidates: usize,
    pub credited: usize,
    pub duplicates: usize,
    pub unknown_address: usize,
    pub failed: usize,
}

struct Candidate {
    tx_id: String,
    address: String,
    amount: u64,
}

pub struct DepositWatcher {
    ledger: Ledger,
    provider: Arc<dyn PaymentProvider>,
    processed: Arc<ProcessedTransactions>,
    metrics: Arc<LedgerMetrics>,
    currency: String,
    page: PageParams,
    poll_interval: Duration,
    provider_timeout: Duration,
    max_concurrency: usize,
    running: Arc<AtomicBool>,
    shutdown: Notify,
}

impl DepositWatcher {
    pub fn new(
        ledger: Ledger,
        provider: Arc<dyn PaymentProvider>,
        depositor: &DepositorConfig,
        provider_config: &ProviderConfig,
    ) -> Self {
        let metrics = ledger.metrics().clone();
        Self {
            ledger,
            provider,
            processed: Arc::new(ProcessedTransactions::new(depositor.max_tracked_transactions)),
            metrics,
            currency: depositor.currency.clone(),
            page: PageParams {
                limit: depositor.page_limit,
                max_pages: provider_config.max_pages,
            },
            poll_interval: Duration::from_millis(depositor.poll_interval_ms),
            provider_timeout: Duration::from_millis(provider_config.timeout_ms),
            max_concurrency: depositor.concurrency.max(1),
            running: Arc::new(AtomicBool::new(true)),
            shutdown: Notify::new(),
        }
    }

    /// Start the self-rescheduling poll loop.
    pub fn spawn(self) -> Arc<Self> {
        let watcher = Arc::new(self);
        watcher.clone().spawn_task();
        watcher
    }

    fn spawn_task(self: Arc<Self>) {
        tokio::spawn(async move {
            tracing::info!(interval_ms = self.poll_interval.as_millis() as u64, "deposit watcher started");

            while self.running.load(Ordering::SeqCst) {
                // Errors are logged inside; the loop only waits for the next tick.
                let _ = self.poll_once().await;

                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = self.shutdown.notified() => {}
                }
            }

            tracing::info!("deposit watcher stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    pub fn processed(&self) -> &ProcessedTransactions {
        &self.processed
    }

    /// One full cycle: fetch, filter, credit with bounded fan-out.
    pub async fn poll_once(&self) -> Result<PollSummary, ProviderError> {
        let transactions = match self.fetch().await {
            Ok(transactions) => transactions,
            Err(e) => {
                tracing::warn!(error = %e, "unable to fetch provider transactions");
                self.metrics.poll_cycle(false);
                return Err(e);
            }
        };

        let candidates = self.select_candidates(&transactions);
        let mut summary = PollSummary {
            fetched: transactions.len(),
            candidates: candidates.len(),
            ..Default::default()
        };

        for outcome in self.credit_all(candidates).await {
            match outcome {
                DepositOutcome::Credited { .. } => summary.credited += 1,
                DepositOutcome::AlreadyRecorded => summary.duplicates += 1,
                DepositOutcome::UnknownAddress => summary.unknown_address += 1,
                DepositOutcome::Failed(_) => summary.failed += 1,
            }
        }

        if summary.failed > 0 {
            tracing::warn!(failed = summary.failed, "some deposits could not be credited, will retry next poll");
        }
        tracing::debug!(?summary, "poll cycle complete");
        self.metrics.poll_cycle(true);
        Ok(summary)
    }

    async fn fetch(&self) -> Result<Vec<ProviderTransaction>, ProviderError> {
        match tokio::time::timeout(self.provider_timeout, self.provider.list_transactions(self.page)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                timeout_ms: self.provider_timeout.as_millis() as u64,
            }),
        }
    }

    /// Incoming, identifiable transactions not yet tracked. Each one returned
    /// is tracked before any credit starts.
    fn select_candidates(&self, transactions: &[ProviderTransaction]) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for tx in transactions {
            if !tx.is_incoming(&self.currency) {
                continue;
            }
            let Some(tx_id) = tx.transaction_hash() else {
                continue;
            };
            if self.processed.contains(&tx_id) {
                continue;
            }
            let (Some(address), Some(amount)) = (tx.destination_address(), tx.satoshis()) else {
                continue;
            };
            if !self.processed.track(&tx_id) {
                continue;
            }
            candidates.push(Candidate { tx_id, address, amount });
        }
        candidates
    }

    async fn credit_all(&self, candidates: Vec<Candidate>) -> Vec<DepositOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut handles = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::warn!(error = %e, "deposit semaphore closed");
                    self.processed.untrack(&candidate.tx_id);
                    continue;
                }
            };
            let ledger = self.ledger.clone();
            let processed = self.processed.clone();
            let metrics = self.metrics.clone();

            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                credit_one(&ledger, &processed, &metrics, &candidate)
            }));
        }

        join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap_or_else(|e| DepositOutcome::Failed(e.to_string())))
            .collect()
    }
}

fn credit_one(
    ledger: &Ledger,
    processed: &ProcessedTransactions,
    metrics: &LedgerMetrics,
    candidate: &Candidate,
) -> DepositOutcome {
    let result = ledger.resolve_deposit_address(&candidate.address).and_then(|user_id| match user_id {
        Some(user_id) => ledger
            .credit(user_id, &candidate.tx_id, candidate.amount, &candidate.address)
            .map(Some),
        None => Ok(None),
    });

    match result {
        Ok(Some(CreditOutcome::Credited { funding_id })) => {
            metrics.deposit_credited();
            DepositOutcome::Credited { funding_id }
        }
        Ok(Some(CreditOutcome::AlreadyRecorded)) => {
            metrics.deposit_duplicate();
            DepositOutcome::AlreadyRecorded
        }
        Ok(None) => {
            processed.untrack(&candidate.tx_id);
            metrics.deposit_unknown_address();
            tracing::warn!(
                tx_id = %candidate.tx_id,
                address = %candidate.address,
                "deposit to unknown address"
            );
            DepositOutcome::UnknownAddress
        }
        Err(e) => {
            processed.untrack(&candidate.tx_id);
            metrics.deposit_failed();
            tracing::warn!(tx_id = %candidate.tx_id, error = %e, "deposit credit failed");
            DepositOutcome::Failed(e.to_string())
        }
    }
}

/// Create a provider address for the user and map it to them.
pub async fn assign_deposit_address(
    ledger: &Ledger,
    provider: &dyn PaymentProvider,
    user_id: u64,
    timeout: Duration,
) -> CrashlineResult<String> {
    let lookup = ledger.clone();
    let user = tokio::task::spawn_blocking(move || lookup.get_user(user_id))
        .await
        .map_err(|e| CrashlineError::Task(e.to_string()))??;

    let address = tokio::time::timeout(timeout, provider.create_address(&user.username))
        .await
        .map_err(|_| ProviderError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        })??
        .address;
    if address.trim().is_empty() {
        return Err(ProviderError::Parse("provider returned an empty address".to_string()).into());
    }

    let store = ledger.clone();
    let recorded = address.clone();
    tokio::task::spawn_blocking(move || store.record_deposit_address(user_id, &recorded))
        .await
        .map_err(|e| CrashlineError::Task(e.to_string()))??;

    tracing::info!(user_id, address = %address, "deposit address assigned");
    Ok(address)
}
