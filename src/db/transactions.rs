use rusqlite::{Connection, types::Value};

use crate::db::{
    ChainCacheResult,
    buckets::{self, TRANSACTION_BUCKET},
};
use crate::models::Transaction;

pub fn save_transaction(conn: &Connection, tx: &Transaction) -> ChainCacheResult<()> {
    buckets::put(conn, &tx.symbol, TRANSACTION_BUCKET, &tx.storage_id(), tx)
}

/// Returns every stored view of `tx_id`, one per account it touched.
pub fn get_transactions_by_tx_id(conn: &Connection, symbol: &str, tx_id: &str) -> ChainCacheResult<Vec<Transaction>> {
    buckets::find_by_field(conn, symbol, TRANSACTION_BUCKET, "tx_id", &Value::Text(tx_id.to_string()))
}

pub fn delete_transactions_by_height(conn: &Connection, symbol: &str, height: u64) -> ChainCacheResult<usize> {
    buckets::delete_by_field(
        conn,
        symbol,
        TRANSACTION_BUCKET,
        "block_height",
        &Value::Integer(height as i64),
    )
}
