#![allow(dead_code)]

use async_trait::async_trait;
use crashline::{
    errors::ProviderError,
    provider::{PageParams, PaymentProvider, ProviderAddress, ProviderTransaction, SendReceipt, SendRequest},
    types::FIRST_ROUND_ID,
    CrashResolver, HashChainGenerator, Ledger, LedgerMetrics, LedgerStore,
};
use serde_json::json;
use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tempfile::TempDir;

pub struct Harness {
    pub dir: TempDir,
    pub ledger: Ledger,
    pub chain: Arc<HashChainGenerator>,
}

/// Fresh store with `rounds` precomputed from `seed`.
pub fn harness(seed: &str, rounds: u64) -> Harness {
    let dir = TempDir::new().unwrap();
    let (ledger, chain) = open(dir.path());
    chain.extend(FIRST_ROUND_ID - 1, rounds, seed).unwrap();
    Harness { dir, ledger, chain }
}

pub fn open(path: &Path) -> (Ledger, Arc<HashChainGenerator>) {
    let store = LedgerStore::open_path(path).unwrap();
    let resolver = CrashResolver::default();
    let chain = Arc::new(HashChainGenerator::new(store.clone(), resolver, 4));
    let ledger = Ledger::new(store, resolver, Arc::new(LedgerMetrics::new()));
    (ledger, chain)
}

pub fn funded_user(ledger: &Ledger, name: &str, amount: u64) -> u64 {
    let user = ledger.create_user(name).unwrap();
    if amount > 0 {
        ledger
            .credit(user.id, &format!("initial-{}", name), amount, "initial")
            .unwrap();
    }
    user.id
}

/// Provider transaction as the listing endpoint returns it.
pub fn incoming(hash: &str, address: &str, amount: &str) -> ProviderTransaction {
    serde_json::from_value(json!({
        "id": format!("cb-{}", hash),
        "status": "completed",
        "amount": { "amount": amount, "currency": "BTC" },
        "network": { "hash": hash },
        "to": { "address": address },
    }))
    .unwrap()
}

/// Scripted provider. Listing results are consumed in order and the last one
/// repeats; send results likewise.
#[derive(Default)]
pub struct MockProvider {
    listings: Mutex<VecDeque<Result<Vec<ProviderTransaction>, ProviderError>>>,
    sends: Mutex<VecDeque<Result<SendReceipt, ProviderError>>>,
    pub sent: Mutex<Vec<SendRequest>>,
    pub list_calls: AtomicUsize,
    addresses: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_listing(&self, result: Result<Vec<ProviderTransaction>, ProviderError>) {
        self.listings.lock().unwrap().push_back(result);
    }

    pub fn push_send(&self, result: Result<SendReceipt, ProviderError>) {
        self.sends.lock().unwrap().push_back(result);
    }

    pub fn sent_requests(&self) -> Vec<SendRequest> {
        self.sent.lock().unwrap().clone()
    }
}

fn next<T: Clone>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
    let mut queue = queue.lock().unwrap();
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

pub fn receipt(hash: &str) -> SendReceipt {
    serde_json::from_value(json!({ "id": format!("cb-{}", hash), "network": { "hash": hash } })).unwrap()
}

pub fn provider_api_error(code: &str) -> ProviderError {
    ProviderError::Api {
        code: code.to_string(),
        message: format!("scripted {}", code),
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    async fn list_transactions(&self, _page: PageParams) -> Result<Vec<ProviderTransaction>, ProviderError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        next(&self.listings).unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn send(&self, request: SendRequest) -> Result<SendReceipt, ProviderError> {
        self.sent.lock().unwrap().push(request);
        next(&self.sends).unwrap_or_else(|| Err(ProviderError::Transport("no scripted send".to_string())))
    }

    async fn create_address(&self, name: &str) -> Result<ProviderAddress, ProviderError> {
        let n = self.addresses.fetch_add(1, Ordering::SeqCst);
        Ok(ProviderAddress {
            id: Some(format!("addr-{}", n)),
            address: format!("bc1q{}{}", name, n),
            name: Some(name.to_string()),
        })
    }
}
