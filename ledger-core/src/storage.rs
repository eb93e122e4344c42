//! Persistence layer
//!
//! The engine only sees the [`Store`] / [`StoreTransaction`] contract.
//! [`RocksStore`] implements it on RocksDB, staging every write of a
//! transaction in one `WriteBatch` so a commit is all-or-nothing.
//!
//! # Column Families
//!
//! - `users` - Account owners (key: username)
//! - `contracts` - Instruments (key: ticker)
//! - `postings` - Committed postings (key: posting_id)
//! - `journals` - Journal headers (key: journal_id, UUIDv7 so keys sort by time)
//! - `indices` - `username | posting_id -> empty`

use crate::{
    error::{StoreError, StoreResult},
    types::{ContractRecord, Journal, JournalHeader, PostingRecord, UserRecord},
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction as ScanDirection,
    IteratorMode, Options, WriteBatch, DB,
};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_USERS: &str = "users";
const CF_CONTRACTS: &str = "contracts";
const CF_POSTINGS: &str = "postings";
const CF_JOURNALS: &str = "journals";
const CF_INDICES: &str = "indices";

/// Persistence collaborator
pub trait Store: Send + Sync + 'static {
    /// Open a transactional scope; nothing is visible until it commits
    fn begin_transaction(&self) -> StoreResult<Box<dyn StoreTransaction + '_>>;
}

/// Writes staged inside one transaction
pub trait StoreTransaction {
    /// Look up an account owner
    fn resolve_user(&self, username: &str) -> StoreResult<UserRecord>;

    /// Look up an instrument by ticker
    fn resolve_contract(&self, ticker: &str) -> StoreResult<ContractRecord>;

    /// Stage postings
    fn insert_postings(&mut self, postings: &[PostingRecord]) -> StoreResult<()>;

    /// Stage the journal header
    fn insert_journal(&mut self, header: &JournalHeader) -> StoreResult<()>;

    /// Apply every staged write atomically
    fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Discard every staged write
    fn rollback(self: Box<Self>);
}

/// Guard that ends a transaction exactly once
///
/// Either [`TransactionScope::commit`] consumes it, or dropping it rolls
/// back. Covers early `?` returns and unwinding alike.
pub struct TransactionScope<'a> {
    inner: Option<Box<dyn StoreTransaction + 'a>>,
}

impl<'a> TransactionScope<'a> {
    /// Begin a transaction on `store`
    pub fn begin(store: &'a dyn Store) -> StoreResult<Self> {
        Ok(Self {
            inner: Some(store.begin_transaction()?),
        })
    }

    fn txn(&self) -> StoreResult<&(dyn StoreTransaction + 'a)> {
        self.inner
            .as_deref()
            .ok_or_else(|| StoreError::Operational("transaction already finished".to_string()))
    }

    fn txn_mut(&mut self) -> StoreResult<&mut (dyn StoreTransaction + 'a)> {
        match self.inner.as_deref_mut() {
            Some(txn) => Ok(txn),
            None => Err(StoreError::Operational(
                "transaction already finished".to_string(),
            )),
        }
    }

    /// See [`StoreTransaction::resolve_user`]
    pub fn resolve_user(&self, username: &str) -> StoreResult<UserRecord> {
        self.txn()?.resolve_user(username)
    }

    /// See [`StoreTransaction::resolve_contract`]
    pub fn resolve_contract(&self, ticker: &str) -> StoreResult<ContractRecord> {
        self.txn()?.resolve_contract(ticker)
    }

    /// See [`StoreTransaction::insert_postings`]
    pub fn insert_postings(&mut self, postings: &[PostingRecord]) -> StoreResult<()> {
        self.txn_mut()?.insert_postings(postings)
    }

    /// See [`StoreTransaction::insert_journal`]
    pub fn insert_journal(&mut self, header: &JournalHeader) -> StoreResult<()> {
        self.txn_mut()?.insert_journal(header)
    }

    /// Commit and consume the scope
    pub fn commit(mut self) -> StoreResult<()> {
        match self.inner.take() {
            Some(txn) => txn.commit(),
            None => Err(StoreError::Operational(
                "transaction already finished".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for TransactionScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("open", &self.inner.is_some())
            .finish()
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if let Some(txn) = self.inner.take() {
            tracing::debug!("Rolling back uncommitted transaction");
            txn.rollback();
        }
    }
}

/// Storage wrapper for RocksDB
pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    /// Open or create database
    pub fn open(config: &Config) -> StoreResult<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_USERS, Self::cf_options_lookup()),
            ColumnFamilyDescriptor::new(CF_CONTRACTS, Self::cf_options_lookup()),
            ColumnFamilyDescriptor::new(CF_POSTINGS, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_JOURNALS, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_lookup()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB ledger store");

        Ok(Self { db: Arc::new(db) })
    }

    // Column family options

    fn cf_options_log() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_lookup() -> Options {
        let mut opts = Options::default();
        // Point lookups on every commit, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> StoreResult<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Operational(format!("Column family {} not found", name)))
    }

    fn get<T: serde::de::DeserializeOwned>(&self, cf: &str, key: &[u8]) -> StoreResult<Option<T>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    // Reference data

    /// Register an account owner; returns the existing record if present
    pub fn register_user(&self, username: &str) -> StoreResult<UserRecord> {
        if let Some(user) = self.get::<UserRecord>(CF_USERS, username.as_bytes())? {
            return Ok(user);
        }

        let user = UserRecord {
            user_id: Uuid::now_v7(),
            username: username.to_string(),
        };
        let cf = self.cf_handle(CF_USERS)?;
        self.db
            .put_cf(cf, username.as_bytes(), bincode::serialize(&user)?)?;

        tracing::info!(username, user_id = %user.user_id, "User registered");
        Ok(user)
    }

    /// Register an instrument; returns the existing record if present
    pub fn register_contract(&self, ticker: &str) -> StoreResult<ContractRecord> {
        if let Some(contract) = self.get::<ContractRecord>(CF_CONTRACTS, ticker.as_bytes())? {
            return Ok(contract);
        }

        let contract = ContractRecord {
            contract_id: Uuid::now_v7(),
            ticker: ticker.to_string(),
        };
        let cf = self.cf_handle(CF_CONTRACTS)?;
        self.db
            .put_cf(cf, ticker.as_bytes(), bincode::serialize(&contract)?)?;

        tracing::info!(ticker, contract_id = %contract.contract_id, "Contract registered");
        Ok(contract)
    }

    // Reads

    /// Get posting by id
    pub fn get_posting(&self, posting_id: Uuid) -> StoreResult<Option<PostingRecord>> {
        self.get(CF_POSTINGS, posting_id.as_bytes())
    }

    /// Get journal by id, with its postings
    pub fn get_journal(&self, journal_id: Uuid) -> StoreResult<Option<Journal>> {
        match self.get::<JournalHeader>(CF_JOURNALS, journal_id.as_bytes())? {
            Some(header) => self.assemble(header).map(Some),
            None => Ok(None),
        }
    }

    /// All journals, oldest first
    pub fn journals(&self) -> StoreResult<Vec<Journal>> {
        let cf = self.cf_handle(CF_JOURNALS)?;

        let mut journals = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let header: JournalHeader = bincode::deserialize(&value)?;
            journals.push(self.assemble(header)?);
        }

        Ok(journals)
    }

    /// All committed postings, in key order
    pub fn postings(&self) -> StoreResult<Vec<PostingRecord>> {
        let cf = self.cf_handle(CF_POSTINGS)?;

        let mut postings = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            postings.push(bincode::deserialize(&value)?);
        }

        Ok(postings)
    }

    /// Postings of one user (via index)
    pub fn user_postings(&self, username: &str) -> StoreResult<Vec<PostingRecord>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let prefix = Self::index_prefix_user(username);

        let iter = self
            .db
            .iterator_cf(cf_indices, IteratorMode::From(prefix.as_slice(), ScanDirection::Forward));

        let mut postings = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            // A longer username sharing this prefix is not ours
            let Ok(id_bytes) = <[u8; 16]>::try_from(&key[prefix.len()..]) else {
                continue;
            };

            let posting_id = Uuid::from_bytes(id_bytes);
            let posting = self.get_posting(posting_id)?.ok_or_else(|| {
                StoreError::Operational(format!("Index points at missing posting {}", posting_id))
            })?;
            postings.push(posting);
        }

        Ok(postings)
    }

    fn assemble(&self, header: JournalHeader) -> StoreResult<Journal> {
        let mut postings = Vec::with_capacity(header.posting_ids.len());
        for posting_id in &header.posting_ids {
            let posting = self.get_posting(*posting_id)?.ok_or_else(|| {
                StoreError::Operational(format!(
                    "Journal {} references missing posting {}",
                    header.journal_id, posting_id
                ))
            })?;
            postings.push(posting);
        }

        Ok(Journal {
            journal_id: header.journal_id,
            journal_type: header.journal_type,
            timestamp: header.timestamp,
            postings,
        })
    }

    // Index key helpers

    fn index_prefix_user(username: &str) -> Vec<u8> {
        let mut key = username.as_bytes().to_vec();
        key.push(b'|');
        key
    }

    fn index_key_user_posting(username: &str, posting_id: Uuid) -> Vec<u8> {
        let mut key = Self::index_prefix_user(username);
        key.extend_from_slice(posting_id.as_bytes());
        key
    }
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.db.path())
            .finish()
    }
}

impl Store for RocksStore {
    fn begin_transaction(&self) -> StoreResult<Box<dyn StoreTransaction + '_>> {
        Ok(Box::new(RocksTransaction {
            store: self,
            batch: WriteBatch::default(),
        }))
    }
}

/// Transaction staging writes into a single `WriteBatch`
struct RocksTransaction<'a> {
    store: &'a RocksStore,
    batch: WriteBatch,
}

impl StoreTransaction for RocksTransaction<'_> {
    fn resolve_user(&self, username: &str) -> StoreResult<UserRecord> {
        self.store
            .get(CF_USERS, username.as_bytes())?
            .ok_or_else(|| StoreError::UnknownUser(username.to_string()))
    }

    fn resolve_contract(&self, ticker: &str) -> StoreResult<ContractRecord> {
        self.store
            .get(CF_CONTRACTS, ticker.as_bytes())?
            .ok_or_else(|| StoreError::UnknownContract(ticker.to_string()))
    }

    fn insert_postings(&mut self, postings: &[PostingRecord]) -> StoreResult<()> {
        let cf_postings = self.store.cf_handle(CF_POSTINGS)?;
        let cf_indices = self.store.cf_handle(CF_INDICES)?;

        for posting in postings {
            let value = bincode::serialize(posting)?;
            self.batch
                .put_cf(cf_postings, posting.posting_id.as_bytes(), &value);

            let idx = RocksStore::index_key_user_posting(&posting.username, posting.posting_id);
            self.batch.put_cf(cf_indices, &idx, b"");
        }

        Ok(())
    }

    fn insert_journal(&mut self, header: &JournalHeader) -> StoreResult<()> {
        let cf = self.store.cf_handle(CF_JOURNALS)?;
        let value = bincode::serialize(header)?;
        self.batch.put_cf(cf, header.journal_id.as_bytes(), &value);
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        let staged = this.batch.len();
        this.store.db.write(this.batch)?;
        tracing::debug!(staged, "Transaction committed");
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        tracing::debug!(discarded = self.batch.len(), "Transaction rolled back");
    }
}
