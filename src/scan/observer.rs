use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use crate::models::{BlockHeader, TxExtractData};

/// Subscriber of scan results.
///
/// Callbacks run on the notification task, never on the scan loop. An error or a
/// panic is logged and does not affect the scanner or the other observers.
#[async_trait]
pub trait BlockScanNotificationObject: Send + Sync {
    /// Called once per scanned block. `header.fork` is set when a previously
    /// notified block was discarded by a chain reorganization.
    async fn block_scan_notify(&self, header: &BlockHeader) -> anyhow::Result<()>;

    /// Called once per relevant transaction, for the account owning it.
    async fn block_extract_data_notify(&self, source_key: &str, data: &TxExtractData) -> anyhow::Result<()>;
}

pub type SharedObserver = Arc<dyn BlockScanNotificationObject>;

/// Set of observers keyed by identity.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: HashMap<usize, SharedObserver>,
}

fn identity(observer: &SharedObserver) -> usize {
    Arc::as_ptr(observer) as *const () as usize
}

impl ObserverRegistry {
    /// Returns `false` if the observer was already registered.
    pub fn add(&mut self, observer: SharedObserver) -> bool {
        let key = identity(&observer);
        if self.observers.contains_key(&key) {
            return false;
        }
        self.observers.insert(key, observer);
        true
    }

    pub fn remove(&mut self, observer: &SharedObserver) -> bool {
        self.observers.remove(&identity(observer)).is_some()
    }

    /// The observers registered right now.
    pub fn snapshot(&self) -> Vec<SharedObserver> {
        self.observers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}
