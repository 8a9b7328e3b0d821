//! Payment provider interface.
//!
//! The provider's REST client lives outside this crate. What the settlement
//! core needs is the trait below plus a tolerant decoding of the transaction
//! records it returns, whose shape varies between API versions.

use crate::errors::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Minor units per whole coin.
pub const SATOSHIS_PER_COIN: u64 = 100_000_000;
const DECIMALS: usize = 8;

/// Paging bounds for one `list_transactions` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageParams {
    pub limit: u32,
    pub max_pages: u32,
}

impl Default for PageParams {
    fn default() -> Self {
        Self { limit: 100, max_pages: 5 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendRequest {
    pub to: String,
    /// Decimal coin amount with exactly eight fractional digits.
    pub amount: String,
    pub currency: String,
    /// Stable per funding row so a resend cannot pay twice.
    pub idempotency_key: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInfo {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
}

impl NetworkInfo {
    fn best_hash(&self) -> Option<&str> {
        non_empty(self.hash.as_deref()).or_else(|| non_empty(self.transaction_hash.as_deref()))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendReceipt {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub network: Option<NetworkInfo>,
}

impl SendReceipt {
    /// On-chain hash when known, otherwise the provider's own id.
    pub fn transaction_hash(&self) -> Option<String> {
        self.network
            .as_ref()
            .and_then(NetworkInfo::best_hash)
            .or_else(|| non_empty(self.id.as_deref()))
            .map(str::to_string)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderAddress {
    #[serde(default)]
    pub id: Option<String>,
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AmountValue {
    Text(String),
    Number(serde_json::Number),
}

impl AmountValue {
    fn as_decimal(&self) -> String {
        match self {
            AmountValue::Text(text) => text.trim().to_string(),
            AmountValue::Number(number) => number.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TransactionAmount {
    Money {
        #[serde(default, alias = "value")]
        amount: Option<AmountValue>,
        #[serde(default, alias = "currency_code", alias = "currencyCode")]
        currency: Option<String>,
    },
    Bare(AmountValue),
}

impl TransactionAmount {
    fn value(&self) -> Option<&AmountValue> {
        match self {
            TransactionAmount::Money { amount, .. } => amount.as_ref(),
            TransactionAmount::Bare(value) => Some(value),
        }
    }

    fn currency(&self) -> Option<&str> {
        match self {
            TransactionAmount::Money { currency, .. } => non_empty(currency.as_deref()),
            TransactionAmount::Bare(_) => None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressRef {
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum DestinationEntry {
    Plain(String),
    Object(AddressRef),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Destination {
    Plain(String),
    Many(Vec<DestinationEntry>),
    Object(AddressRef),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionDetails {
    #[serde(default)]
    pub coinbase_address: Option<String>,
    #[serde(default)]
    pub to: Option<AddressRef>,
}

/// One transaction record as listed by the provider.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderTransaction {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub amount: Option<TransactionAmount>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub to: Option<Destination>,
    #[serde(default)]
    pub network: Option<NetworkInfo>,
    #[serde(default)]
    pub details: Option<TransactionDetails>,
}

impl ProviderTransaction {
    /// Confirmed, positive, in the expected currency. Missing currency or
    /// status fields are not held against the record.
    pub fn is_incoming(&self, currency: &str) -> bool {
        let Some(amount) = &self.amount else {
            return false;
        };
        if let Some(tx_currency) = amount.currency() {
            if !tx_currency.eq_ignore_ascii_case(currency) {
                return false;
            }
        }
        if let Some(status) = non_empty(self.status.as_deref()) {
            if !status.eq_ignore_ascii_case("completed") {
                return false;
            }
        }
        matches!(self.satoshis(), Some(value) if value > 0)
    }

    /// Amount in minor units; `None` if absent, negative or malformed.
    pub fn satoshis(&self) -> Option<u64> {
        let value = self.amount.as_ref()?.value()?;
        parse_amount(&value.as_decimal())
    }

    /// Network hash, falling back to the provider id.
    pub fn transaction_hash(&self) -> Option<String> {
        self.network
            .as_ref()
            .and_then(NetworkInfo::best_hash)
            .or_else(|| non_empty(self.id.as_deref()))
            .map(str::to_string)
    }

    pub fn destination_address(&self) -> Option<String> {
        if let Some(address) = non_empty(self.address.as_deref()) {
            return Some(address.to_string());
        }

        let from_to = match &self.to {
            Some(Destination::Plain(address)) => non_empty(Some(address.as_str())),
            Some(Destination::Many(entries)) => match entries.first() {
                Some(DestinationEntry::Plain(address)) => non_empty(Some(address.as_str())),
                Some(DestinationEntry::Object(r)) => non_empty(r.address.as_deref()),
                None => None,
            },
            Some(Destination::Object(r)) => non_empty(r.address.as_deref()),
            None => None,
        };
        if let Some(address) = from_to {
            return Some(address.to_string());
        }

        let details = self.details.as_ref()?;
        non_empty(details.coinbase_address.as_deref())
            .or_else(|| details.to.as_ref().and_then(|r| non_empty(r.address.as_deref())))
            .map(str::to_string)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Parse a decimal coin amount into minor units without floating point.
/// Digits past the eighth decimal are truncated.
pub fn parse_amount(text: &str) -> Option<u64> {
    let text = text.trim();
    let text = text.strip_prefix('+').unwrap_or(text);
    let (whole, frac) = text.split_once('.').unwrap_or((text, ""));
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut frac_digits: String = frac.chars().take(DECIMALS).collect();
    while frac_digits.len() < DECIMALS {
        frac_digits.push('0');
    }
    let frac: u64 = frac_digits.parse().ok()?;

    whole.checked_mul(SATOSHIS_PER_COIN)?.checked_add(frac)
}

/// Format minor units as a decimal coin amount with eight fractional digits.
pub fn format_amount(satoshis: u64) -> String {
    format!(
        "{}.{:0width$}",
        satoshis / SATOSHIS_PER_COIN,
        satoshis % SATOSHIS_PER_COIN,
        width = DECIMALS
    )
}

/// External payment provider as seen by the settlement core.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Recent account transactions, newest first, bounded by `page.max_pages`.
    async fn list_transactions(&self, page: PageParams) -> Result<Vec<ProviderTransaction>, ProviderError>;

    async fn send(&self, request: SendRequest) -> Result<SendReceipt, ProviderError>;

    async fn create_address(&self, label: &str) -> Result<ProviderAddress, ProviderError>;
}
