//! Chain specific collaborators the scanner drives.
//!
//! A chain adapter implements [`BlockSource`] over its node RPC and
//! [`TransactionExtractor`] over its transaction format. The scanner only relies
//! on the behaviour described by these traits.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    models::{Balance, BlockHeader, TxExtractData},
    scan::target::BlockScanTargetFuncV2,
};

#[derive(Debug, Error)]
pub enum SourceError {
    /// The node could not answer; retrying later may succeed.
    #[error("Transient block source failure: {0}")]
    Transient(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation not supported by this block source: {0}")]
    Unsupported(&'static str),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    /// The transaction does not exist on the node. Retrying cannot succeed.
    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("extraction failed for {tx_id}: {reason}")]
    Failed { tx_id: String, reason: String },
}

/// A block as returned by the node: its header and the ids of its transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub tx_ids: Vec<String>,
}

/// Read access to a remote chain.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn get_block_by_height(&self, height: u64) -> Result<Block, SourceError>;

    /// Height of the current chain tip.
    async fn get_current_height(&self) -> Result<u64, SourceError>;

    async fn get_block_hash(&self, height: u64) -> Result<String, SourceError>;

    async fn get_balance_by_address(&self, _addresses: &[String]) -> Result<Vec<Balance>, SourceError> {
        Err(SourceError::Unsupported("get_balance_by_address"))
    }
}

/// Decodes one transaction and keeps the parts relevant to tracked targets.
///
/// The result is keyed by source key, so data belonging to two accounts is never
/// merged. `header` is absent when the transaction is looked up outside of a
/// block scan.
#[async_trait]
pub trait TransactionExtractor: Send + Sync {
    async fn extract_transaction(
        &self,
        tx_id: &str,
        header: Option<&BlockHeader>,
        resolver: &BlockScanTargetFuncV2,
    ) -> Result<HashMap<String, Vec<TxExtractData>>, ExtractError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TX_NOT_FOUND_REASON, UnscanRecord};

    #[test]
    fn test_not_found_is_recorded_as_permanent() {
        let err = ExtractError::TransactionNotFound("deadbeef".to_string());
        let record = UnscanRecord::new(10, "deadbeef", &err.to_string(), "BTC");
        assert!(err.to_string().starts_with(TX_NOT_FOUND_REASON));
        assert!(record.is_permanent());

        let err = ExtractError::Failed {
            tx_id: "deadbeef".to_string(),
            reason: "rpc timeout".to_string(),
        };
        let record = UnscanRecord::new(10, "deadbeef", &err.to_string(), "BTC");
        assert!(!record.is_permanent());
    }
}
