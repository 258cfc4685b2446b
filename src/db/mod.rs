//! SQLite storage for the local chain cache.
//!
//! The database realises a small embedded key-value store: every row of the
//! `buckets` table is a `(symbol, bucket, key) -> value` entry, and the modules
//! below implement one bucket family each on top of [`buckets`]. All functions
//! take a plain [`rusqlite::Connection`] so callers decide on transactions.

use std::{
    collections::HashMap,
    env::current_dir,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock, Mutex},
    time::Duration,
};

use include_dir::{Dir, include_dir};
use log::{debug, info};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use rusqlite_migration::Migrations;

pub mod error;
pub use error::{ChainCacheError, ChainCacheResult};

pub mod buckets;

mod block_cache;
pub use block_cache::{
    count_cached_block_heads, get_block_cache_capacity, get_local_block_head_by_height, resize_block_cache,
    save_local_block_head,
};

mod current_block;
pub use current_block::{get_current_block_head, save_current_block_head};

mod unscan_records;
pub use unscan_records::{
    delete_unscan_record_by_height, delete_unscan_record_by_id, get_unscan_records, save_unscan_record,
};

mod transactions;
pub use transactions::{delete_transactions_by_height, get_transactions_by_tx_id, save_transaction};

pub type SqlitePool = Pool<SqliteConnectionManager>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_POOL_SIZE: u32 = 4;

static MIGRATIONS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/migrations");

/// One lock per database file, held while a connection to that file is opened.
static OPEN_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

fn open_lock(path: &Path) -> Arc<Mutex<()>> {
    let mut locks = OPEN_LOCKS.lock().unwrap_or_else(|e| e.into_inner());
    locks.entry(path.to_path_buf()).or_default().clone()
}

fn resolve_path(db_path: impl AsRef<Path>) -> ChainCacheResult<PathBuf> {
    let mut path = db_path.as_ref().to_path_buf();
    if path.is_relative() {
        path = current_dir()?.join(path);
    }
    let parent = path
        .parent()
        .ok_or_else(|| ChainCacheError::InvalidInput("Invalid database file path".to_string()))?;
    std::fs::create_dir_all(parent)?;
    Ok(path)
}

fn configure_connection(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
}

fn run_migrations(conn: &mut Connection) -> ChainCacheResult<()> {
    let migrations = Migrations::from_directory(&MIGRATIONS_DIR)?;
    migrations.to_latest(conn)?;
    Ok(())
}

/// Opens (creating if needed) the database at `db_path` as a connection pool and
/// brings its schema up to date.
pub fn init_db(db_path: impl AsRef<Path>) -> ChainCacheResult<SqlitePool> {
    let path = resolve_path(db_path)?;
    let lock = open_lock(&path);
    let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

    debug!(path:% = path.display(); "Opening chain cache pool");
    let manager = SqliteConnectionManager::file(&path).with_init(configure_connection);
    let pool = Pool::builder().max_size(MAX_POOL_SIZE).build(manager)?;

    let mut conn = pool.get()?;
    run_migrations(&mut conn)?;

    info!(path:% = path.display(); "Chain cache database ready");
    Ok(pool)
}

/// How the chain cache reaches its database file.
#[derive(Clone)]
pub enum Store {
    /// A pool of connections kept open for the lifetime of the store.
    KeepOpen(SqlitePool),
    /// A short-lived connection opened for every call.
    PerCall { path: PathBuf, lock: Arc<Mutex<()>> },
}

impl Store {
    pub fn open(db_path: impl AsRef<Path>, keep_open: bool) -> ChainCacheResult<Self> {
        if keep_open {
            return Ok(Store::KeepOpen(init_db(db_path)?));
        }

        let path = resolve_path(db_path)?;
        let lock = open_lock(&path);
        {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            let mut conn = Connection::open(&path)?;
            configure_connection(&mut conn)?;
            run_migrations(&mut conn)?;
        }
        Ok(Store::PerCall { path, lock })
    }

    /// Runs `f` on a connection, inside a transaction that is committed when `f` succeeds.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Connection) -> ChainCacheResult<T>) -> ChainCacheResult<T> {
        match self {
            Store::KeepOpen(pool) => {
                let mut conn = pool.get()?;
                let tx = conn.transaction()?;
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            },
            Store::PerCall { path, lock } => {
                let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
                let mut conn = Connection::open(path)?;
                configure_connection(&mut conn)?;
                let tx = conn.transaction()?;
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            },
        }
    }
}
