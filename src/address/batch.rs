use std::sync::Arc;

use log::{debug, info};
use thiserror::Error;

use crate::{
    concurrency::run_bounded,
    log::mask_string,
    models::{Address, AssetsAccount},
};

#[derive(Debug, Error)]
pub enum DeriveError {
    #[error("Invalid account public key: {0}")]
    InvalidPublicKey(String),

    #[error("Failed to derive child key {index}: {reason}")]
    Derivation { index: u64, reason: String },

    #[error("Failed to encode address: {0}")]
    Encoding(String),

    #[error("Derivation worker failed: {0}")]
    Task(String),
}

/// Chain specific key derivation and address encoding.
///
/// Both calls are CPU bound and run on the blocking thread pool.
pub trait AddressDecoder: Send + Sync {
    /// Child public key at `index` below the account key.
    fn derive_child_public_key(&self, account: &AssetsAccount, index: u64) -> Result<Vec<u8>, DeriveError>;

    fn public_key_to_address(&self, public_key: &[u8], is_testnet: bool) -> Result<String, DeriveError>;
}

fn derive_address(account: &AssetsAccount, decoder: &dyn AddressDecoder, index: u64) -> Result<Address, DeriveError> {
    let public_key = decoder.derive_child_public_key(account, index)?;
    let address = decoder.public_key_to_address(&public_key, account.is_testnet)?;
    Ok(Address {
        account_id: account.account_id.clone(),
        symbol: account.symbol.clone(),
        address,
        public_key: hex::encode(&public_key),
        index,
        hd_path: format!("{}/{}", account.hd_path, index),
        is_testnet: account.is_testnet,
    })
}

/// Derives `count` consecutive addresses of `account`, starting at its next
/// unused index, with at most `worker_size` derivations in flight.
///
/// Addresses are returned in index order. The first failing index fails the
/// whole batch.
pub async fn batch_create_address_by_account(
    account: &AssetsAccount,
    decoder: Arc<dyn AddressDecoder>,
    count: u64,
    worker_size: usize,
) -> Result<Vec<Address>, DeriveError> {
    let start = account.address_index;
    let indexes: Vec<u64> = (start..start + count).collect();
    debug!(
        account_id:% = mask_string(&account.account_id),
        start = start,
        count = count,
        workers = worker_size;
        "Deriving address batch"
    );

    let shared_account = Arc::new(account.clone());
    let results = run_bounded(indexes.clone(), worker_size, move |index| {
        let account = shared_account.clone();
        let decoder = decoder.clone();
        async move {
            tokio::task::spawn_blocking(move || derive_address(&account, decoder.as_ref(), index))
                .await
                .map_err(|e| DeriveError::Task(e.to_string()))?
        }
    })
    .await;

    let mut addresses = Vec::with_capacity(results.len());
    for (index, result) in indexes.into_iter().zip(results) {
        match result {
            Some(Ok(address)) => addresses.push(address),
            Some(Err(e)) => return Err(e),
            None => return Err(DeriveError::Task(format!("no result for index {}", index))),
        }
    }

    info!(
        account_id:% = mask_string(&account.account_id),
        count = addresses.len();
        "Created address batch"
    );
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicUsize, Ordering},
    };

    #[derive(Default)]
    struct HashDecoder {
        active: AtomicUsize,
        peak: AtomicUsize,
        fail_at: Option<u64>,
    }

    impl AddressDecoder for HashDecoder {
        fn derive_child_public_key(&self, account: &AssetsAccount, index: u64) -> Result<Vec<u8>, DeriveError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let result = if self.fail_at == Some(index) {
                Err(DeriveError::Derivation {
                    index,
                    reason: "hardened index".to_string(),
                })
            } else {
                let mut hasher = Sha256::new();
                hasher.update(account.public_key.as_bytes());
                hasher.update(index.to_be_bytes());
                Ok(hasher.finalize().to_vec())
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn public_key_to_address(&self, public_key: &[u8], is_testnet: bool) -> Result<String, DeriveError> {
            let prefix = if is_testnet { "t" } else { "m" };
            Ok(format!("{}{}", prefix, hex::encode(&public_key[..20])))
        }
    }

    fn account() -> AssetsAccount {
        AssetsAccount {
            account_id: "account-0001-abcdef".to_string(),
            symbol: "BTC".to_string(),
            public_key: "xpub-test".to_string(),
            hd_path: "m/44'/0'/0'/0".to_string(),
            address_index: 10,
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batch_creates_unique_addresses_with_bounded_workers() {
        let decoder = Arc::new(HashDecoder::default());
        let addresses = batch_create_address_by_account(&account(), decoder.clone(), 5000, 20)
            .await
            .unwrap();

        assert_eq!(addresses.len(), 5000);
        let unique: HashSet<&str> = addresses.iter().map(|a| a.address.as_str()).collect();
        assert_eq!(unique.len(), 5000);

        assert_eq!(addresses[0].index, 10);
        assert_eq!(addresses[0].hd_path, "m/44'/0'/0'/0/10");
        assert_eq!(addresses[4999].index, 5009);

        assert!(decoder.peak.load(Ordering::SeqCst) <= 20);
        assert_eq!(decoder.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_batch_fails_on_first_bad_index() {
        let decoder = Arc::new(HashDecoder {
            fail_at: Some(12),
            ..Default::default()
        });
        let err = batch_create_address_by_account(&account(), decoder, 5, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, DeriveError::Derivation { index: 12, .. }));
    }
}
