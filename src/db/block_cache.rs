//! Ring buffer of recently scanned block headers.
//!
//! Slots `0..capacity` live in `block_index_bucket` as `block_cache_index_<slot> -> height`,
//! the headers themselves in `block_cache_bucket` as `<height> -> header`.
//! `current_block_increase_index` holds the slot written last. Saving a new height
//! advances to the next slot, evicts the header previously stored there, and takes
//! the slot over, so the cache never holds more than `capacity` headers.

use log::{debug, trace};
use rusqlite::Connection;

use crate::db::{
    ChainCacheError, ChainCacheResult,
    buckets::{
        self, BLOCK_CACHE_BUCKET, BLOCK_CACHE_CAPACITY_KEY, BLOCK_CACHE_INDEX_PREFIX, BLOCK_INDEX_BUCKET,
        CURRENT_BLOCK_INCREASE_INDEX_KEY, block_cache_index_key,
    },
};
use crate::models::BlockHeader;

pub fn save_local_block_head(conn: &Connection, header: &BlockHeader, capacity: u64) -> ChainCacheResult<()> {
    if capacity == 0 {
        return Err(ChainCacheError::InvalidInput(
            "block cache capacity must be greater than zero".to_string(),
        ));
    }

    let symbol = header.symbol.as_str();
    let height_key = header.height.to_string();

    // A height already in the cache keeps its slot.
    if buckets::get::<BlockHeader>(conn, symbol, BLOCK_CACHE_BUCKET, &height_key)?.is_some() {
        trace!(symbol = symbol, height = header.height; "DB: Overwriting cached block head");
        return buckets::put(conn, symbol, BLOCK_CACHE_BUCKET, &height_key, header);
    }

    if get_block_cache_capacity(conn, symbol)? != Some(capacity) {
        resize_block_cache(conn, symbol, capacity)?;
    }

    let last_slot: Option<u64> = buckets::get(conn, symbol, BLOCK_INDEX_BUCKET, CURRENT_BLOCK_INCREASE_INDEX_KEY)?;
    let slot = match last_slot {
        Some(last) => (last + 1) % capacity,
        None => 0,
    };

    let slot_key = block_cache_index_key(slot);
    if let Some(old_height) = buckets::get::<u64>(conn, symbol, BLOCK_INDEX_BUCKET, &slot_key)? {
        debug!(
            symbol = symbol,
            slot = slot,
            evicted_height = old_height,
            height = header.height;
            "DB: Evicting cached block head"
        );
        buckets::delete(conn, symbol, BLOCK_CACHE_BUCKET, &old_height.to_string())?;
    }

    buckets::put(conn, symbol, BLOCK_CACHE_BUCKET, &height_key, header)?;
    buckets::put(conn, symbol, BLOCK_INDEX_BUCKET, &slot_key, &header.height)?;
    buckets::put(conn, symbol, BLOCK_INDEX_BUCKET, CURRENT_BLOCK_INCREASE_INDEX_KEY, &slot)?;

    Ok(())
}

pub fn get_block_cache_capacity(conn: &Connection, symbol: &str) -> ChainCacheResult<Option<u64>> {
    buckets::get(conn, symbol, BLOCK_INDEX_BUCKET, BLOCK_CACHE_CAPACITY_KEY)
}

/// Stores `capacity` as the ring buffer size.
///
/// The cached headers are compacted by age into slots `0..n`, keeping the newest
/// `capacity` of them, so a smaller capacity evicts right away and a larger one
/// leaves the free slots ahead of the write index.
pub fn resize_block_cache(conn: &Connection, symbol: &str, capacity: u64) -> ChainCacheResult<()> {
    if capacity == 0 {
        return Err(ChainCacheError::InvalidInput(
            "block cache capacity must be greater than zero".to_string(),
        ));
    }
    match get_block_cache_capacity(conn, symbol)? {
        Some(previous) if previous != capacity => compact_slots(conn, symbol, previous, capacity)?,
        _ => {},
    }
    buckets::put(conn, symbol, BLOCK_INDEX_BUCKET, BLOCK_CACHE_CAPACITY_KEY, &capacity)
}

/// Heights of the occupied slots, newest first, walking back from the write index.
fn heights_by_recency(conn: &Connection, symbol: &str, previous_capacity: u64) -> ChainCacheResult<Vec<(u64, u64)>> {
    let mut slots: Vec<(u64, u64)> = buckets::entries::<serde_json::Value>(conn, symbol, BLOCK_INDEX_BUCKET)?
        .into_iter()
        .filter_map(|(key, value)| {
            let slot = key.strip_prefix(BLOCK_CACHE_INDEX_PREFIX)?.parse::<u64>().ok()?;
            Some((slot, value.as_u64()?))
        })
        .collect();

    let ring = slots
        .iter()
        .map(|(slot, _)| slot + 1)
        .max()
        .unwrap_or(0)
        .max(previous_capacity);
    let last: Option<u64> = buckets::get(conn, symbol, BLOCK_INDEX_BUCKET, CURRENT_BLOCK_INCREASE_INDEX_KEY)?;
    let last = last.unwrap_or(ring.saturating_sub(1));

    // Distance behind the write index: 0 is the slot written last.
    slots.sort_by_key(|(slot, _)| (last + ring - slot) % ring.max(1));
    Ok(slots)
}

fn compact_slots(conn: &Connection, symbol: &str, previous_capacity: u64, capacity: u64) -> ChainCacheResult<()> {
    let slots = heights_by_recency(conn, symbol, previous_capacity)?;
    let keep = slots.len().min(capacity as usize);

    for (rank, (slot, height)) in slots.iter().enumerate() {
        buckets::delete(conn, symbol, BLOCK_INDEX_BUCKET, &block_cache_index_key(*slot))?;
        if rank >= keep {
            debug!(symbol = symbol, evicted_height = *height, capacity = capacity; "DB: Evicting cached block head");
            buckets::delete(conn, symbol, BLOCK_CACHE_BUCKET, &height.to_string())?;
        }
    }

    // Oldest kept header goes to slot 0, the newest to slot `keep - 1`.
    for (slot, (_, height)) in slots[..keep].iter().rev().enumerate() {
        buckets::put(conn, symbol, BLOCK_INDEX_BUCKET, &block_cache_index_key(slot as u64), height)?;
    }
    match keep.checked_sub(1) {
        Some(newest) => buckets::put(
            conn,
            symbol,
            BLOCK_INDEX_BUCKET,
            CURRENT_BLOCK_INCREASE_INDEX_KEY,
            &(newest as u64),
        )?,
        None => {
            buckets::delete(conn, symbol, BLOCK_INDEX_BUCKET, CURRENT_BLOCK_INCREASE_INDEX_KEY)?;
        },
    }

    debug!(
        symbol = symbol,
        previous_capacity = previous_capacity,
        capacity = capacity,
        kept = keep;
        "DB: Resized block head cache"
    );
    Ok(())
}

/// Returns the cached header at `height`, or `None` when it was never cached or has been evicted.
pub fn get_local_block_head_by_height(
    conn: &Connection,
    symbol: &str,
    height: u64,
) -> ChainCacheResult<Option<BlockHeader>> {
    buckets::get(conn, symbol, BLOCK_CACHE_BUCKET, &height.to_string())
}

pub fn count_cached_block_heads(conn: &Connection, symbol: &str) -> ChainCacheResult<u64> {
    buckets::count(conn, symbol, BLOCK_CACHE_BUCKET)
}
