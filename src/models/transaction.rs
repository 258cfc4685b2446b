use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A spend found in a transaction that debits a tracked address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub tx_id: String,
    pub index: u64,
    /// Transaction and output index being spent, for UTXO chains.
    pub source_tx_id: String,
    pub source_index: u64,
    pub address: String,
    pub amount: String,
    pub symbol: String,
    pub block_height: u64,
    pub block_hash: String,
}

/// A receipt found in a transaction that credits a tracked address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub tx_id: String,
    pub index: u64,
    pub address: String,
    pub amount: String,
    pub symbol: String,
    pub block_height: u64,
    pub block_hash: String,
}

/// Summary of a transaction from the point of view of one source key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: String,
    /// Account or wallet the transaction belongs to.
    pub account_id: String,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub amount: String,
    pub fees: String,
    pub decimals: u32,
    pub block_height: u64,
    pub block_hash: String,
    pub confirm_time: u64,
    pub status: String,
    pub symbol: String,
}

impl Transaction {
    /// Storage id, unique per (symbol, account, transaction).
    pub fn storage_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.symbol.as_bytes());
        hasher.update(b"/");
        hasher.update(self.account_id.as_bytes());
        hasher.update(b"/");
        hasher.update(self.tx_id.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Everything extracted from one relevant transaction for one source key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxExtractData {
    pub tx_inputs: Vec<TxInput>,
    pub tx_outputs: Vec<TxOutput>,
    pub transaction: Option<Transaction>,
}
