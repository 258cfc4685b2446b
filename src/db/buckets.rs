use rusqlite::{Connection, OptionalExtension, named_params};
use serde::{Serialize, de::DeserializeOwned};

use crate::db::ChainCacheResult;

pub const BLOCKCHAIN_BUCKET: &str = "blockchain";
pub const BLOCK_INDEX_BUCKET: &str = "block_index_bucket";
pub const BLOCK_CACHE_BUCKET: &str = "block_cache_bucket";
pub const UNSCAN_RECORD_BUCKET: &str = "unscan_record_bucket";
pub const TRANSACTION_BUCKET: &str = "transaction_bucket";

pub const CURRENT_BLOCK_HEADER_KEY: &str = "current_block_header";
pub const CURRENT_BLOCK_INCREASE_INDEX_KEY: &str = "current_block_increase_index";
pub const BLOCK_CACHE_CAPACITY_KEY: &str = "block_cache_capacity";
pub const BLOCK_CACHE_INDEX_PREFIX: &str = "block_cache_index_";

pub fn block_cache_index_key(slot: u64) -> String {
    format!("{}{}", BLOCK_CACHE_INDEX_PREFIX, slot)
}

/// Inserts or overwrites `key` in `bucket`.
pub fn put<T: Serialize>(conn: &Connection, symbol: &str, bucket: &str, key: &str, value: &T) -> ChainCacheResult<()> {
    let value = serde_json::to_string(value)?;
    conn.execute(
        r#"
        INSERT INTO buckets (symbol, bucket, key, value, updated_at)
        VALUES (:symbol, :bucket, :key, :value, datetime('now'))
        ON CONFLICT (symbol, bucket, key)
        DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
        named_params! {
            ":symbol": symbol,
            ":bucket": bucket,
            ":key": key,
            ":value": value,
        },
    )?;
    Ok(())
}

pub fn get<T: DeserializeOwned>(conn: &Connection, symbol: &str, bucket: &str, key: &str) -> ChainCacheResult<Option<T>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT value
        FROM buckets
        WHERE symbol = :symbol AND bucket = :bucket AND key = :key
        "#,
    )?;

    let raw: Option<String> = stmt
        .query_row(
            named_params! { ":symbol": symbol, ":bucket": bucket, ":key": key },
            |row| row.get(0),
        )
        .optional()?;

    raw.map(|v| serde_json::from_str(&v)).transpose().map_err(Into::into)
}

pub fn delete(conn: &Connection, symbol: &str, bucket: &str, key: &str) -> ChainCacheResult<usize> {
    let count = conn.execute(
        "DELETE FROM buckets WHERE symbol = :symbol AND bucket = :bucket AND key = :key",
        named_params! { ":symbol": symbol, ":bucket": bucket, ":key": key },
    )?;
    Ok(count)
}

/// Returns every `(key, value)` of `bucket`, ordered by key.
pub fn entries<T: DeserializeOwned>(conn: &Connection, symbol: &str, bucket: &str) -> ChainCacheResult<Vec<(String, T)>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT key, value
        FROM buckets
        WHERE symbol = :symbol AND bucket = :bucket
        ORDER BY key ASC
        "#,
    )?;

    let rows = stmt.query_map(named_params! { ":symbol": symbol, ":bucket": bucket }, |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut items = Vec::new();
    for row in rows {
        let (key, raw) = row?;
        items.push((key, serde_json::from_str(&raw)?));
    }
    Ok(items)
}

/// Returns the values of `bucket` whose JSON field `field` equals `value`.
pub fn find_by_field<T: DeserializeOwned>(
    conn: &Connection,
    symbol: &str,
    bucket: &str,
    field: &str,
    value: &rusqlite::types::Value,
) -> ChainCacheResult<Vec<T>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT value
        FROM buckets
        WHERE symbol = :symbol AND bucket = :bucket AND json_extract(value, :path) = :value
        ORDER BY key ASC
        "#,
    )?;

    let path = format!("$.{}", field);
    let rows = stmt.query_map(
        named_params! { ":symbol": symbol, ":bucket": bucket, ":path": path, ":value": value },
        |row| row.get::<_, String>(0),
    )?;

    let mut items = Vec::new();
    for row in rows {
        items.push(serde_json::from_str(&row?)?);
    }
    Ok(items)
}

/// Deletes the values of `bucket` whose JSON field `field` equals `value`.
pub fn delete_by_field(
    conn: &Connection,
    symbol: &str,
    bucket: &str,
    field: &str,
    value: &rusqlite::types::Value,
) -> ChainCacheResult<usize> {
    let path = format!("$.{}", field);
    let count = conn.execute(
        r#"
        DELETE FROM buckets
        WHERE symbol = :symbol AND bucket = :bucket AND json_extract(value, :path) = :value
        "#,
        named_params! { ":symbol": symbol, ":bucket": bucket, ":path": path, ":value": value },
    )?;
    Ok(count)
}

pub fn count(conn: &Connection, symbol: &str, bucket: &str) -> ChainCacheResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM buckets WHERE symbol = :symbol AND bucket = :bucket",
        named_params! { ":symbol": symbol, ":bucket": bucket },
        |row| row.get(0),
    )?;
    Ok(count as u64)
}
