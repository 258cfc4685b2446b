use serde::{Deserialize, Serialize};

/// An HD account on a chain, identified by its source key (`account_id`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetsAccount {
    pub account_id: String,
    pub wallet_id: String,
    pub alias: String,
    pub symbol: String,
    /// Hex encoded account level extended public key.
    pub public_key: String,
    pub hd_path: String,
    /// Next unused child index.
    pub address_index: u64,
    pub is_testnet: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub account_id: String,
    pub symbol: String,
    pub address: String,
    /// Hex encoded child public key.
    pub public_key: String,
    pub index: u64,
    pub hd_path: String,
    pub is_testnet: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartContract {
    pub contract_id: String,
    pub symbol: String,
    pub address: String,
    pub token: String,
    pub name: String,
    pub decimals: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub symbol: String,
    pub account_id: String,
    pub address: String,
    pub balance: String,
    pub confirm_balance: String,
    pub unconfirm_balance: String,
}
