pub mod config;
mod notify;
mod observer;
mod scanner;
mod source;
mod target;
mod types;

pub use config::ScannerConfig;
pub use notify::Notification;
pub use observer::{BlockScanNotificationObject, ObserverRegistry, SharedObserver};
pub use scanner::{BlockScanner, ExtractedData, ScannerState};
pub use source::{Block, BlockSource, ExtractError, SourceError, TransactionExtractor};
pub use target::{BlockScanTargetFuncV2, ScanTargetInfo, ScanTargetParam, ScanTargetResult, ScanTargetType};
pub use types::{ScanError, TickOutcome};
