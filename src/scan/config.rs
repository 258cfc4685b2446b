use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default period between two scan ticks (5 seconds).
pub const DEFAULT_SCAN_PERIOD: Duration = Duration::from_secs(5);

/// Default capacity of the local block header ring buffer.
pub const DEFAULT_BLOCK_CACHE_SIZE: u64 = 1000;

/// Number of heights the scan pointer is moved back when a fork is detected.
pub const ROLLBACK_DEPTH: u64 = 2;

/// Default number of concurrent transaction extraction workers per block.
pub const DEFAULT_EXTRACT_WORKERS: usize = 8;

/// Scanner settings for one chain.
///
/// # Example
///
/// ```rust,ignore
/// use crate::scan::ScannerConfig;
///
/// let config = ScannerConfig {
///     symbol: "BTC".to_string(),
///     scan_period_secs: 10,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Chain symbol every persisted record is scoped to.
    pub symbol: String,
    /// Seconds between two scan ticks.
    pub scan_period_secs: u64,
    /// Capacity of the header cache used for fork detection.
    pub block_cache_size: u64,
    /// Concurrent extraction workers used for the transactions of one block.
    pub extract_workers: usize,
    /// Whether every tick ends by retrying the unscanned records.
    pub rescan_failed_records: bool,
    /// Whether extracted transactions are also stored in the local chain cache.
    pub save_transactions: bool,
    /// Keep the database open between calls instead of opening it per call.
    pub keep_open: bool,
}

impl ScannerConfig {
    pub fn scan_period(&self) -> Duration {
        if self.scan_period_secs == 0 {
            DEFAULT_SCAN_PERIOD
        } else {
            Duration::from_secs(self.scan_period_secs)
        }
    }

    pub fn extract_workers(&self) -> usize {
        self.extract_workers.max(1)
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            scan_period_secs: DEFAULT_SCAN_PERIOD.as_secs(),
            block_cache_size: DEFAULT_BLOCK_CACHE_SIZE,
            extract_workers: DEFAULT_EXTRACT_WORKERS,
            rescan_failed_records: true,
            save_transactions: false,
            keep_open: true,
        }
    }
}
