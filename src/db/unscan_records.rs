use log::debug;
use rusqlite::{Connection, types::Value};

use crate::db::{
    ChainCacheResult,
    buckets::{self, UNSCAN_RECORD_BUCKET},
};
use crate::models::UnscanRecord;

/// Stores `record` under its deterministic id; recording the same failure again
/// replaces the previous row.
pub fn save_unscan_record(conn: &Connection, record: &UnscanRecord) -> ChainCacheResult<()> {
    debug!(
        symbol = &*record.symbol,
        height = record.block_height,
        tx_id = &*record.tx_id,
        reason = &*record.reason;
        "DB: Saving unscan record"
    );
    buckets::put(conn, &record.symbol, UNSCAN_RECORD_BUCKET, &record.id, record)
}

pub fn get_unscan_records(conn: &Connection, symbol: &str) -> ChainCacheResult<Vec<UnscanRecord>> {
    let mut records: Vec<UnscanRecord> = buckets::entries(conn, symbol, UNSCAN_RECORD_BUCKET)?
        .into_iter()
        .map(|(_, record)| record)
        .collect();
    records.sort_by(|a, b| a.block_height.cmp(&b.block_height).then_with(|| a.tx_id.cmp(&b.tx_id)));
    Ok(records)
}

pub fn delete_unscan_record_by_height(conn: &Connection, symbol: &str, height: u64) -> ChainCacheResult<usize> {
    let count = buckets::delete_by_field(
        conn,
        symbol,
        UNSCAN_RECORD_BUCKET,
        "block_height",
        &Value::Integer(height as i64),
    )?;
    if count > 0 {
        debug!(symbol = symbol, height = height, count = count; "DB: Deleted unscan records by height");
    }
    Ok(count)
}

pub fn delete_unscan_record_by_id(conn: &Connection, symbol: &str, id: &str) -> ChainCacheResult<usize> {
    buckets::delete(conn, symbol, UNSCAN_RECORD_BUCKET, id)
}
