//! Transactional ledger store on RocksDB
//!
//! Every multi-row operation runs inside one pessimistic RocksDB transaction.
//! Rows touched by a write are locked with `get_for_update`, so concurrent
//! writers to the same user, bet or funding row are serialized by the store.
//! Balance non-negativity and the uniqueness rules are enforced here, inside
//! the same transaction as the write that would break them.

use crate::{
    config::{CompressionType, StorageConfig},
    crash::RoundHash,
    errors::{StoreError, StoreResult},
    types::User,
};
use rocksdb::{
    Direction, IteratorMode, Options, Transaction, TransactionDB, TransactionDBOptions,
    TransactionOptions, WriteOptions,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{path::Path, sync::Arc};

pub const BALANCE_NON_NEGATIVE: &str = "users_balance_non_negative";
pub const USERNAME_UNIQUE: &str = "users_username_lower_unique";
pub const DEPOSIT_TX_UNIQUE: &str = "fundings_deposit_tx_unique";
pub const WITHDRAWAL_TX_UNIQUE: &str = "fundings_withdrawal_tx_unique";
pub const IDEMPOTENCY_KEY_UNIQUE: &str = "fundings_idempotency_key_unique";
pub const DEPOSIT_ADDRESS_UNIQUE: &str = "deposit_addresses_unique";
pub const ROUND_ID_UNIQUE: &str = "rounds_pkey";

/// Key layout. Numeric suffixes are big-endian so prefix scans run in id order.
pub mod keys {
    pub const USER: &[u8] = b"user:id:";
    pub const USERNAME: &[u8] = b"user:name:";
    pub const SESSION: &[u8] = b"session:";
    pub const ROUND: &[u8] = b"round:id:";
    pub const ROUND_BETS: &[u8] = b"round:bets:";
    pub const BET: &[u8] = b"bet:id:";
    pub const FUNDING: &[u8] = b"funding:id:";
    pub const FUNDING_DEPOSIT_TX: &[u8] = b"funding:dep:";
    pub const FUNDING_WITHDRAWAL_TX: &[u8] = b"funding:wd:";
    pub const FUNDING_IDEMPOTENCY: &[u8] = b"funding:key:";
    pub const DEPOSIT_ADDRESS: &[u8] = b"address:";
    pub const CHAIN_HASH: &[u8] = b"chain:hash:";
    pub const CHAIN_SEGMENT: &[u8] = b"chain:segment:";
    pub const LAST_ROUND: &[u8] = b"round:last";
    pub const SEQUENCE: &[u8] = b"seq:";

    pub fn with_id(prefix: &[u8], id: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + 8);
        key.extend_from_slice(prefix);
        key.extend_from_slice(&id.to_be_bytes());
        key
    }

    pub fn with_str(prefix: &[u8], value: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + value.len());
        key.extend_from_slice(prefix);
        key.extend_from_slice(value.as_bytes());
        key
    }

    pub fn user(id: u64) -> Vec<u8> {
        with_id(USER, id)
    }

    /// Usernames are unique case-insensitively.
    pub fn username(name: &str) -> Vec<u8> {
        with_str(USERNAME, &name.to_lowercase())
    }

    pub fn session(token: &str) -> Vec<u8> {
        with_str(SESSION, token)
    }

    pub fn round(id: u64) -> Vec<u8> {
        with_id(ROUND, id)
    }

    pub fn round_bets_prefix(round_id: u64) -> Vec<u8> {
        with_id(ROUND_BETS, round_id)
    }

    pub fn round_bet(round_id: u64, bet_id: u64) -> Vec<u8> {
        let mut key = round_bets_prefix(round_id);
        key.extend_from_slice(&bet_id.to_be_bytes());
        key
    }

    pub fn bet(id: u64) -> Vec<u8> {
        with_id(BET, id)
    }

    pub fn funding(id: u64) -> Vec<u8> {
        with_id(FUNDING, id)
    }

    /// Deposits and withdrawal links can carry the same network hash, so
    /// each direction has its own keyspace.
    pub fn funding_deposit_tx(external_tx_id: &str) -> Vec<u8> {
        with_str(FUNDING_DEPOSIT_TX, external_tx_id)
    }

    pub fn funding_withdrawal_tx(external_tx_id: &str) -> Vec<u8> {
        with_str(FUNDING_WITHDRAWAL_TX, external_tx_id)
    }

    pub fn funding_idempotency(key: &str) -> Vec<u8> {
        with_str(FUNDING_IDEMPOTENCY, key)
    }

    pub fn deposit_address(address: &str) -> Vec<u8> {
        with_str(DEPOSIT_ADDRESS, address)
    }

    pub fn chain_hash(round_id: u64) -> Vec<u8> {
        with_id(CHAIN_HASH, round_id)
    }

    pub fn chain_segment(first_round_id: u64) -> Vec<u8> {
        with_id(CHAIN_SEGMENT, first_round_id)
    }

    pub fn sequence(name: &str) -> Vec<u8> {
        with_str(SEQUENCE, name)
    }

    /// Trailing big-endian id of a key built with [`with_id`].
    pub fn trailing_id(key: &[u8]) -> Option<u64> {
        let start = key.len().checked_sub(8)?;
        let bytes: [u8; 8] = key[start..].try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }
}

fn decode<T: DeserializeOwned>(key: &[u8], bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupted {
        key: String::from_utf8_lossy(key).to_string(),
        reason: e.to_string(),
    })
}

fn encode<T: Serialize>(key: &[u8], value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Corrupted {
        key: String::from_utf8_lossy(key).to_string(),
        reason: e.to_string(),
    })
}

fn parse_u64(key: &[u8], bytes: &[u8]) -> StoreResult<u64> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| StoreError::Corrupted {
        key: String::from_utf8_lossy(key).to_string(),
        reason: format!("expected 8 bytes, found {}", bytes.len()),
    })?;
    Ok(u64::from_be_bytes(array))
}

pub(crate) fn parse_hash(key: &[u8], bytes: &[u8]) -> StoreResult<RoundHash> {
    let array: [u8; 32] = bytes.try_into().map_err(|_| StoreError::Corrupted {
        key: String::from_utf8_lossy(key).to_string(),
        reason: format!("expected 32 byte hash, found {}", bytes.len()),
    })?;
    Ok(RoundHash::new(array))
}

/// Durable ledger store.
#[derive(Clone)]
pub struct LedgerStore {
    db: Arc<TransactionDB>,
}

impl LedgerStore {
    pub fn open(config: &StorageConfig) -> StoreResult<Self> {
        if config.clear_on_start {
            let _ = std::fs::remove_dir_all(&config.data_directory);
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        opts.set_max_write_buffer_number(config.max_write_buffer_number);
        opts.set_compression_type(match config.compression_type {
            CompressionType::None => rocksdb::DBCompressionType::None,
            CompressionType::Snappy => rocksdb::DBCompressionType::Snappy,
            CompressionType::Lz4 => rocksdb::DBCompressionType::Lz4,
            CompressionType::Zstd => rocksdb::DBCompressionType::Zstd,
        });

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_default_lock_timeout(config.lock_timeout_ms);
        txn_db_opts.set_txn_lock_timeout(config.lock_timeout_ms);

        let db: TransactionDB = TransactionDB::open(&opts, &txn_db_opts, &config.data_directory)?;
        tracing::debug!(path = %config.data_directory, "ledger store opened");

        Ok(Self { db: Arc::new(db) })
    }

    /// Open with default tuning at `path`, keeping existing data.
    pub fn open_path<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::open(&StorageConfig {
            data_directory: path.as_ref().to_string_lossy().to_string(),
            clear_on_start: false,
            ..Default::default()
        })
    }

    /// Start a transaction. Dropping it without [`StoreTxn::commit`] rolls back.
    pub fn begin(&self) -> StoreTxn<'_> {
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_deadlock_detect(true);
        StoreTxn {
            txn: self.db.transaction_opt(&WriteOptions::default(), &txn_opts),
        }
    }

    pub fn get_raw(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> StoreResult<Option<T>> {
        match self.db.get(key)? {
            Some(bytes) => decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_u64(&self, key: &[u8]) -> StoreResult<Option<u64>> {
        match self.db.get(key)? {
            Some(bytes) => parse_u64(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn round_hash(&self, round_id: u64) -> StoreResult<Option<RoundHash>> {
        let key = keys::chain_hash(round_id);
        match self.db.get(&key)? {
            Some(bytes) => parse_hash(&key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Rows under `prefix` in ascending key order.
    pub fn scan_prefix(&self, prefix: &[u8], limit: usize) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_from(prefix, prefix, limit)
    }

    /// Rows under `prefix` starting at `start`, ascending.
    pub fn scan_from(&self, prefix: &[u8], start: &[u8], limit: usize) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut rows = Vec::new();
        for item in self.db.iterator(IteratorMode::From(start, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) || rows.len() >= limit {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    /// Rows under `prefix` in descending key order.
    pub fn scan_prefix_reverse(&self, prefix: &[u8], limit: usize) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut upper = prefix.to_vec();
        upper.extend_from_slice(&[0xff; 16]);

        let mut rows = Vec::new();
        for item in self.db.iterator(IteratorMode::From(&upper, Direction::Reverse)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) || rows.len() >= limit {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    /// Newest-first decoded rows under `prefix` accepted by `keep`, up to `limit`.
    pub fn scan_json_reverse<T, F>(&self, prefix: &[u8], limit: usize, mut keep: F) -> StoreResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: FnMut(&T) -> bool,
    {
        let mut upper = prefix.to_vec();
        upper.extend_from_slice(&[0xff; 16]);

        let mut rows = Vec::new();
        for item in self.db.iterator(IteratorMode::From(&upper, Direction::Reverse)) {
            let (key, value) = item?;
            if !key.starts_with(prefix) || rows.len() >= limit {
                break;
            }
            let row: T = decode(&key, &value)?;
            if keep(&row) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Decoded JSON rows under `prefix`.
    pub fn scan_json<T: DeserializeOwned>(&self, prefix: &[u8], limit: usize) -> StoreResult<Vec<T>> {
        self.scan_prefix(prefix, limit)?
            .into_iter()
            .map(|(key, value)| decode(&key, &value))
            .collect()
    }
}

/// One all-or-nothing unit of work against the store.
pub struct StoreTxn<'a> {
    txn: Transaction<'a, TransactionDB>,
}

impl<'a> StoreTxn<'a> {
    /// Read without taking a lock.
    pub fn get<T: DeserializeOwned>(&self, key: &[u8]) -> StoreResult<Option<T>> {
        match self.txn.get(key)? {
            Some(bytes) => decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Read and take an exclusive row lock until commit or rollback.
    pub fn lock<T: DeserializeOwned>(&self, key: &[u8]) -> StoreResult<Option<T>> {
        match self.txn.get_for_update(key, true)? {
            Some(bytes) => decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn lock_raw(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.txn.get_for_update(key, true)?)
    }

    pub fn lock_u64(&self, key: &[u8]) -> StoreResult<Option<u64>> {
        match self.txn.get_for_update(key, true)? {
            Some(bytes) => parse_u64(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn lock_hash(&self, key: &[u8]) -> StoreResult<Option<RoundHash>> {
        match self.txn.get_for_update(key, true)? {
            Some(bytes) => parse_hash(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(&self, key: &[u8], value: &T) -> StoreResult<()> {
        let bytes = encode(key, value)?;
        Ok(self.txn.put(key, bytes)?)
    }

    pub fn put_raw(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        Ok(self.txn.put(key, value)?)
    }

    pub fn put_u64(&self, key: &[u8], value: u64) -> StoreResult<()> {
        Ok(self.txn.put(key, value.to_be_bytes())?)
    }

    pub fn delete(&self, key: &[u8]) -> StoreResult<()> {
        Ok(self.txn.delete(key)?)
    }

    /// Claim `key` for `value`, failing if any row already holds it.
    pub fn insert_unique(&self, constraint: &'static str, key: &[u8], value: &[u8]) -> StoreResult<()> {
        if self.txn.get_for_update(key, true)?.is_some() {
            return Err(StoreError::UniqueViolation { constraint });
        }
        Ok(self.txn.put(key, value)?)
    }

    /// Next value of a named gapless sequence, starting at 1.
    pub fn next_sequence(&self, name: &str) -> StoreResult<u64> {
        let key = keys::sequence(name);
        let next = self.lock_u64(&key)?.unwrap_or(0) + 1;
        self.put_u64(&key, next)?;
        Ok(next)
    }

    /// Apply `delta` to a user's balance. Rejects the write with a check
    /// violation if the balance would drop below zero.
    pub fn adjust_balance(&self, user_id: u64, delta: i64) -> StoreResult<Option<User>> {
        let key = keys::user(user_id);
        let Some(mut user) = self.lock::<User>(&key)? else {
            return Ok(None);
        };

        let balance = user
            .balance
            .checked_add(delta)
            .ok_or(StoreError::CheckViolation { constraint: BALANCE_NON_NEGATIVE })?;
        if balance < 0 {
            return Err(StoreError::CheckViolation { constraint: BALANCE_NON_NEGATIVE });
        }

        user.balance = balance;
        self.put(&key, &user)?;
        Ok(Some(user))
    }

    pub fn commit(self) -> StoreResult<()> {
        Ok(self.txn.commit()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> LedgerStore {
        LedgerStore::open_path(dir.path()).unwrap()
    }

    fn seed_user(store: &LedgerStore, id: u64, balance: i64) {
        let txn = store.begin();
        txn.put(
            &keys::user(id),
            &User { id, username: format!("user{}", id), balance, created_at: 0 },
        )
        .unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_balance_check_rejects_overdraft() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        seed_user(&store, 1, 50);

        let txn = store.begin();
        let err = txn.adjust_balance(1, -51).unwrap_err();
        assert!(matches!(err, StoreError::CheckViolation { constraint: BALANCE_NON_NEGATIVE }));
        drop(txn);

        let user: User = store.get_json(&keys::user(1)).unwrap().unwrap();
        assert_eq!(user.balance, 50);
    }

    #[test]
    fn test_uncommitted_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        seed_user(&store, 1, 10);

        {
            let txn = store.begin();
            txn.adjust_balance(1, 90).unwrap();
            txn.insert_unique(DEPOSIT_TX_UNIQUE, &keys::funding_deposit_tx("tx"), b"1").unwrap();
        }

        let user: User = store.get_json(&keys::user(1)).unwrap().unwrap();
        assert_eq!(user.balance, 10);
        assert!(store.get_raw(&keys::funding_deposit_tx("tx")).unwrap().is_none());
    }

    #[test]
    fn test_unique_constraint() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let txn = store.begin();
        txn.insert_unique(IDEMPOTENCY_KEY_UNIQUE, &keys::funding_idempotency("k1"), b"1").unwrap();
        txn.commit().unwrap();

        let txn = store.begin();
        let err = txn
            .insert_unique(IDEMPOTENCY_KEY_UNIQUE, &keys::funding_idempotency("k1"), b"2")
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { constraint: IDEMPOTENCY_KEY_UNIQUE }));
    }

    #[test]
    fn test_sequences_are_gapless() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let txn = store.begin();
        assert_eq!(txn.next_sequence("bet").unwrap(), 1);
        assert_eq!(txn.next_sequence("bet").unwrap(), 2);
        txn.commit().unwrap();

        let txn = store.begin();
        assert_eq!(txn.next_sequence("bet").unwrap(), 3);
    }

    #[test]
    fn test_prefix_scans_respect_order_and_bounds() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let txn = store.begin();
        for bet_id in [3u64, 1, 2] {
            txn.put_raw(&keys::round_bet(7, bet_id), b"").unwrap();
        }
        txn.put_raw(&keys::round_bet(8, 1), b"").unwrap();
        txn.commit().unwrap();

        let forward: Vec<u64> = store
            .scan_prefix(&keys::round_bets_prefix(7), 10)
            .unwrap()
            .iter()
            .filter_map(|(k, _)| keys::trailing_id(k))
            .collect();
        assert_eq!(forward, vec![1, 2, 3]);

        let reverse: Vec<u64> = store
            .scan_prefix_reverse(&keys::round_bets_prefix(7), 2)
            .unwrap()
            .iter()
            .filter_map(|(k, _)| keys::trailing_id(k))
            .collect();
        assert_eq!(reverse, vec![3, 2]);
    }
}
