use log::debug;
use rusqlite::Connection;

use crate::db::{
    ChainCacheResult,
    buckets::{self, BLOCKCHAIN_BUCKET, CURRENT_BLOCK_HEADER_KEY},
};
use crate::models::BlockHeader;

/// Overwrites the scan pointer of `header.symbol`.
pub fn save_current_block_head(conn: &Connection, header: &BlockHeader) -> ChainCacheResult<()> {
    debug!(
        symbol = &*header.symbol,
        height = header.height;
        "DB: Saving current block head"
    );
    buckets::put(conn, &header.symbol, BLOCKCHAIN_BUCKET, CURRENT_BLOCK_HEADER_KEY, header)
}

pub fn get_current_block_head(conn: &Connection, symbol: &str) -> ChainCacheResult<Option<BlockHeader>> {
    buckets::get(conn, symbol, BLOCKCHAIN_BUCKET, CURRENT_BLOCK_HEADER_KEY)
}
