use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::{Address, AssetsAccount, SmartContract};

/// Kind of chain level identifier handed to the scan target resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanTargetType {
    AccountAddress,
    AccountAlias,
    AddressPublicKey,
    AddressMemo,
    ContractAddress,
    ContractAlias,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTargetParam {
    pub scan_target: String,
    pub symbol: String,
    pub scan_target_type: ScanTargetType,
}

impl ScanTargetParam {
    pub fn new(scan_target: impl Into<String>, symbol: impl Into<String>, scan_target_type: ScanTargetType) -> Self {
        Self {
            scan_target: scan_target.into(),
            symbol: symbol.into(),
            scan_target_type,
        }
    }
}

/// Payload attached to a tracked target, depending on its [`ScanTargetType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanTargetInfo {
    Address(Address),
    Account(AssetsAccount),
    SmartContract(SmartContract),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTargetResult {
    /// Account or wallet the target belongs to.
    pub source_key: String,
    pub exist: bool,
    pub target_info: Option<ScanTargetInfo>,
}

impl ScanTargetResult {
    pub fn not_found() -> Self {
        Self::default()
    }

    pub fn found(source_key: impl Into<String>, target_info: Option<ScanTargetInfo>) -> Self {
        Self {
            source_key: source_key.into(),
            exist: true,
            target_info,
        }
    }
}

/// Resolves a chain identifier to the source key that owns it.
///
/// Called for every address found while scanning, so it must be cheap and must
/// not block.
pub type BlockScanTargetFuncV2 = Arc<dyn Fn(ScanTargetParam) -> ScanTargetResult + Send + Sync>;
