//! Local view of the chain: scan pointer, recent header cache, retry bookkeeping.
//!
//! [`BlockchainDai`] is the persistence contract the scanner consumes, so a
//! host application can plug in its own store. [`BlockchainLocal`] is the
//! default implementation over the SQLite bucket store in [`crate::db`].

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use log::{error, info};
use rusqlite::Connection;

use crate::{
    db::{self, ChainCacheError, ChainCacheResult, Store},
    models::{BlockHeader, Transaction, UnscanRecord},
    scan::config::DEFAULT_BLOCK_CACHE_SIZE,
};

/// Persistence operations the scanner needs from its local chain cache.
///
/// Every failure is reported as a [`ChainCacheError`]; the scanner treats it as a
/// reason to abort the current tick without advancing.
#[async_trait]
pub trait BlockchainDai: Send + Sync {
    async fn save_current_block_head(&self, header: &BlockHeader) -> ChainCacheResult<()>;

    async fn get_current_block_head(&self, symbol: &str) -> ChainCacheResult<Option<BlockHeader>>;

    /// Adds `header` to the bounded header cache, evicting the oldest entry when full.
    async fn save_local_block_head(&self, header: &BlockHeader) -> ChainCacheResult<()>;

    async fn get_local_block_head_by_height(&self, height: u64, symbol: &str) -> ChainCacheResult<Option<BlockHeader>>;

    async fn save_unscan_record(&self, record: &UnscanRecord) -> ChainCacheResult<()>;

    async fn delete_unscan_record_by_height(&self, height: u64, symbol: &str) -> ChainCacheResult<()>;

    async fn delete_unscan_record_by_id(&self, id: &str, symbol: &str) -> ChainCacheResult<()>;

    async fn get_unscan_records(&self, symbol: &str) -> ChainCacheResult<Vec<UnscanRecord>>;

    /// Changes the header cache capacity of `symbol`; applied on the next save.
    async fn set_max_block_cache(&self, size: u64, symbol: &str) -> ChainCacheResult<()>;

    async fn save_transaction(&self, tx: &Transaction) -> ChainCacheResult<()>;

    async fn get_transactions_by_tx_id(&self, tx_id: &str, symbol: &str) -> ChainCacheResult<Vec<Transaction>>;

    async fn delete_transactions_by_height(&self, height: u64, symbol: &str) -> ChainCacheResult<()>;
}

/// [`BlockchainDai`] backed by the SQLite bucket store.
///
/// Database work runs on the blocking thread pool so the scan loop never blocks
/// a runtime worker.
#[derive(Clone)]
pub struct BlockchainLocal {
    store: Store,
    default_cache_size: u64,
    cache_sizes: Arc<RwLock<HashMap<String, u64>>>,
}

impl BlockchainLocal {
    pub fn open(db_path: impl AsRef<Path>, keep_open: bool) -> ChainCacheResult<Self> {
        let store = Store::open(db_path, keep_open)?;
        Ok(Self::with_store(store, DEFAULT_BLOCK_CACHE_SIZE))
    }

    pub fn with_store(store: Store, default_cache_size: u64) -> Self {
        Self {
            store,
            default_cache_size,
            cache_sizes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn block_cache_size(&self, symbol: &str) -> u64 {
        let sizes = self.cache_sizes.read().unwrap_or_else(|e| e.into_inner());
        sizes.get(symbol).copied().unwrap_or(self.default_cache_size)
    }

    /// Number of headers currently held by the header cache of `symbol`.
    pub async fn count_cached_block_heads(&self, symbol: &str) -> ChainCacheResult<u64> {
        let symbol = symbol.to_string();
        self.run(move |conn| db::count_cached_block_heads(conn, &symbol)).await
    }

    /// Changes the header cache capacity and applies it to the stored cache now
    /// rather than on the next save.
    pub async fn resize_block_cache(&self, size: u64, symbol: &str) -> ChainCacheResult<()> {
        self.set_max_block_cache(size, symbol).await?;
        let symbol = symbol.to_string();
        self.run(move |conn| db::resize_block_cache(conn, &symbol, size)).await
    }

    /// Capacity recorded by the last write to the header cache of `symbol`.
    pub async fn stored_block_cache_size(&self, symbol: &str) -> ChainCacheResult<Option<u64>> {
        let symbol = symbol.to_string();
        self.run(move |conn| db::get_block_cache_capacity(conn, &symbol)).await
    }

    /// Adopts the capacity stored with the header cache of `symbol`, or `fallback`
    /// when nothing has been cached yet, and returns the size now in effect.
    pub async fn restore_block_cache_size(&self, symbol: &str, fallback: u64) -> ChainCacheResult<u64> {
        let size = self.stored_block_cache_size(symbol).await?.unwrap_or(fallback);
        self.set_max_block_cache(size, symbol).await?;
        Ok(size)
    }

    async fn run<T, F>(&self, f: F) -> ChainCacheResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> ChainCacheResult<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.with_transaction(f))
            .await
            .map_err(|e| {
                error!("Chain cache task failed: {}", e);
                ChainCacheError::Task(e.to_string())
            })?
    }
}

#[async_trait]
impl BlockchainDai for BlockchainLocal {
    async fn save_current_block_head(&self, header: &BlockHeader) -> ChainCacheResult<()> {
        let header = header.clone();
        self.run(move |conn| db::save_current_block_head(conn, &header)).await
    }

    async fn get_current_block_head(&self, symbol: &str) -> ChainCacheResult<Option<BlockHeader>> {
        let symbol = symbol.to_string();
        self.run(move |conn| db::get_current_block_head(conn, &symbol)).await
    }

    async fn save_local_block_head(&self, header: &BlockHeader) -> ChainCacheResult<()> {
        let capacity = self.block_cache_size(&header.symbol);
        let header = header.clone();
        self.run(move |conn| db::save_local_block_head(conn, &header, capacity))
            .await
    }

    async fn get_local_block_head_by_height(&self, height: u64, symbol: &str) -> ChainCacheResult<Option<BlockHeader>> {
        let symbol = symbol.to_string();
        self.run(move |conn| db::get_local_block_head_by_height(conn, &symbol, height))
            .await
    }

    async fn save_unscan_record(&self, record: &UnscanRecord) -> ChainCacheResult<()> {
        let record = record.clone();
        self.run(move |conn| db::save_unscan_record(conn, &record)).await
    }

    async fn delete_unscan_record_by_height(&self, height: u64, symbol: &str) -> ChainCacheResult<()> {
        let symbol = symbol.to_string();
        self.run(move |conn| db::delete_unscan_record_by_height(conn, &symbol, height).map(|_| ()))
            .await
    }

    async fn delete_unscan_record_by_id(&self, id: &str, symbol: &str) -> ChainCacheResult<()> {
        let id = id.to_string();
        let symbol = symbol.to_string();
        self.run(move |conn| db::delete_unscan_record_by_id(conn, &symbol, &id).map(|_| ()))
            .await
    }

    async fn get_unscan_records(&self, symbol: &str) -> ChainCacheResult<Vec<UnscanRecord>> {
        let symbol = symbol.to_string();
        self.run(move |conn| db::get_unscan_records(conn, &symbol)).await
    }

    async fn set_max_block_cache(&self, size: u64, symbol: &str) -> ChainCacheResult<()> {
        if size == 0 {
            return Err(ChainCacheError::InvalidInput(
                "block cache size must be greater than zero".to_string(),
            ));
        }
        let mut sizes = self.cache_sizes.write().unwrap_or_else(|e| e.into_inner());
        sizes.insert(symbol.to_string(), size);
        info!(symbol = symbol, size = size; "Block head cache size updated");
        Ok(())
    }

    async fn save_transaction(&self, tx: &Transaction) -> ChainCacheResult<()> {
        let tx = tx.clone();
        self.run(move |conn| db::save_transaction(conn, &tx)).await
    }

    async fn get_transactions_by_tx_id(&self, tx_id: &str, symbol: &str) -> ChainCacheResult<Vec<Transaction>> {
        let tx_id = tx_id.to_string();
        let symbol = symbol.to_string();
        self.run(move |conn| db::get_transactions_by_tx_id(conn, &symbol, &tx_id))
            .await
    }

    async fn delete_transactions_by_height(&self, height: u64, symbol: &str) -> ChainCacheResult<()> {
        let symbol = symbol.to_string();
        self.run(move |conn| db::delete_transactions_by_height(conn, &symbol, height).map(|_| ()))
            .await
    }
}
