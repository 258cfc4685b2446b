//! Data models shared by the scanner, the local chain cache and observers.
//!
//! # Key Types
//!
//! - [`BlockHeader`] - A block header as seen by the scanner; also the scan pointer record
//! - [`UnscanRecord`] - A block or transaction whose extraction failed and must be retried
//! - [`TxExtractData`] - The relevant inputs/outputs of one transaction for one source key
//! - [`BlockchainSyncStatus`] - Local scan progress against the remote chain tip
//! - [`AssetsAccount`], [`Address`], [`SmartContract`] - Scan target payloads

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod account;
pub use account::{Address, AssetsAccount, Balance, SmartContract};
pub mod transaction;
pub use transaction::{Transaction, TxExtractData, TxInput, TxOutput};

/// Reason prefix for failures that will never succeed on retry.
///
/// Records whose reason starts with this prefix are dropped by the failed-record
/// rescan instead of being retried.
pub const TX_NOT_FOUND_REASON: &str = "transaction not found";

/// Header of a block on the remote chain.
///
/// The same record is used for the cached ring buffer entries and for the
/// singleton "current" scan pointer of a symbol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: String,
    pub previous_hash: String,
    pub height: u64,
    pub confirmations: u64,
    pub merkle_root: String,
    /// Block timestamp in seconds since the unix epoch.
    pub time: u64,
    pub version: u64,
    /// Set when the header has been discarded by a chain reorganization.
    pub fork: bool,
    pub symbol: String,
}

impl BlockHeader {
    /// A header that only knows its position, used when seeding the scan pointer.
    pub fn pointer(symbol: &str, height: u64, hash: String) -> Self {
        Self {
            hash,
            height,
            symbol: symbol.to_string(),
            ..Default::default()
        }
    }

    /// Height a scan resumes at when this header is the scan pointer.
    pub fn next_height(&self) -> u64 {
        self.height.saturating_add(1)
    }
}

/// A persisted marker for a block (empty `tx_id`) or a transaction that failed
/// extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnscanRecord {
    pub id: String,
    pub block_height: u64,
    pub tx_id: String,
    pub reason: String,
    pub symbol: String,
}

impl UnscanRecord {
    pub fn new(block_height: u64, tx_id: &str, reason: &str, symbol: &str) -> Self {
        Self {
            id: unscan_record_id(symbol, block_height, tx_id),
            block_height,
            tx_id: tx_id.to_string(),
            reason: reason.to_string(),
            symbol: symbol.to_string(),
        }
    }

    /// Whether this record failed for the whole block rather than a single transaction.
    pub fn is_block_level(&self) -> bool {
        self.tx_id.is_empty()
    }

    /// Whether retrying this record can never succeed.
    pub fn is_permanent(&self) -> bool {
        self.reason.starts_with(TX_NOT_FOUND_REASON)
    }
}

/// Deterministic id of an unscanned record, so recording the same failure twice
/// overwrites the first row.
pub fn unscan_record_id(symbol: &str, block_height: u64, tx_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(symbol.as_bytes());
    hasher.update(block_height.to_be_bytes());
    hasher.update(tx_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Local scan progress compared with the remote chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainSyncStatus {
    pub network_block_height: u64,
    pub current_block_height: u64,
    pub syncing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unscan_record_id_is_deterministic() {
        let a = UnscanRecord::new(100, "tx1", "rpc timeout", "BTC");
        let b = UnscanRecord::new(100, "tx1", "another reason", "BTC");
        assert_eq!(a.id, b.id);

        let other_height = UnscanRecord::new(101, "tx1", "rpc timeout", "BTC");
        let other_symbol = UnscanRecord::new(100, "tx1", "rpc timeout", "LTC");
        assert_ne!(a.id, other_height.id);
        assert_ne!(a.id, other_symbol.id);
    }

    #[test]
    fn permanent_reason_is_detected() {
        let record = UnscanRecord::new(7, "abc", &format!("{}: abc", TX_NOT_FOUND_REASON), "ETH");
        assert!(record.is_permanent());
        assert!(!record.is_block_level());

        let block = UnscanRecord::new(7, "", "connection reset", "ETH");
        assert!(!block.is_permanent());
        assert!(block.is_block_level());
    }

    #[test]
    fn next_height_saturates_at_the_top() {
        assert_eq!(BlockHeader::pointer("BTC", 104, "h104".to_string()).next_height(), 105);
        assert_eq!(BlockHeader::pointer("BTC", u64::MAX, String::new()).next_height(), u64::MAX);
    }
}
