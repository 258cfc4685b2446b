pub mod address;
pub mod chain_cache;
pub mod cli;
pub mod concurrency;
pub mod config;
pub mod db;
pub mod log;
pub mod models;
pub mod scan;

pub use crate::chain_cache::{BlockchainDai, BlockchainLocal};
pub use crate::db::init_db;
pub use crate::scan::{BlockScanner, ScanError};
