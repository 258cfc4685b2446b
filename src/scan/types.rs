use thiserror::Error;

use crate::{
    db::ChainCacheError,
    scan::source::{ExtractError, SourceError},
};

/// Errors that can occur during blockchain scanning operations.
///
/// None of them is fatal to the host process: the periodic loop logs the error
/// and tries again on the next tick.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The scanner is missing a collaborator it needs to run.
    ///
    /// Returned synchronously by `run` when no scan target resolver or no
    /// local chain cache has been configured.
    #[error("Scanner is not configured: {0}")]
    Configuration(String),

    /// The scanner has been closed and accepts no further work.
    #[error("Block scanner is closed")]
    Closed,

    /// The block source failed; the failure is recorded for a later retry.
    #[error("Block source error: {0}")]
    Fetch(#[from] SourceError),

    /// The local chain cache failed; the scan pointer is left untouched.
    #[error("Chain cache error: {0}")]
    Persistence(#[from] ChainCacheError),

    /// Transaction extraction failed outside of a block scan.
    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("Invalid block height: {0}")]
    InvalidHeight(u64),

    /// An unexpected failure, e.g. a panicked scan task.
    #[error("Fatal error: {0}")]
    Fatal(#[from] anyhow::Error),
}

/// What a single scan tick ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The local pointer already matched the chain height.
    CaughtUp { height: u64 },
    /// Heights were scanned and the pointer advanced to `height`.
    Advanced { height: u64 },
    /// A fork was found at `detected_at` and the pointer rewound to `height`.
    RolledBack { detected_at: u64, height: u64 },
}
