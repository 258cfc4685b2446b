//! The block scanner: lifecycle, periodic scan step, fork rollback and retry of
//! failed records.
//!
//! # Scan step
//!
//! Every tick reads the chain height once, then walks the heights above the
//! local scan pointer in order. A block is accepted only if its previous hash
//! matches the cached header one height below; otherwise the pointer is rewound
//! by [`ROLLBACK_DEPTH`] and the walk stops until the next tick. Accepted blocks
//! are extracted, cached, persisted as the new pointer and then handed to the
//! observers through the notification relay.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak},
    time::Duration,
};

use log::{debug, error, info, warn};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    chain_cache::BlockchainDai,
    concurrency::run_bounded,
    log::mask_string,
    models::{
        Balance, BlockHeader, BlockchainSyncStatus, TxExtractData, UnscanRecord, unscan_record_id,
    },
    scan::{
        config::{ROLLBACK_DEPTH, ScannerConfig},
        notify::{Envelope, Notification, NotificationSender},
        observer::{ObserverRegistry, SharedObserver},
        source::{Block, BlockSource, ExtractError, TransactionExtractor},
        target::BlockScanTargetFuncV2,
        types::{ScanError, TickOutcome},
    },
};

/// Extracted transaction data grouped by source key.
pub type ExtractedData = HashMap<String, Vec<TxExtractData>>;

/// Lifecycle state of a [`BlockScanner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    Idle,
    Running,
    Paused,
    Stopped,
    /// Terminal. Every further mutating call fails with [`ScanError::Closed`].
    Closed,
}

/// Collaborators looked up on every scan step, behind one lock.
#[derive(Default)]
struct Collaborators {
    observers: ObserverRegistry,
    resolver: Option<BlockScanTargetFuncV2>,
    dai: Option<Arc<dyn BlockchainDai>>,
}

struct Lifecycle {
    state: ScannerState,
    timer: Option<CancellationToken>,
    notifier: Option<NotificationSender>,
}

struct ScannerInner {
    config: ScannerConfig,
    source: Arc<dyn BlockSource>,
    extractor: Arc<dyn TransactionExtractor>,
    collaborators: RwLock<Collaborators>,
    lifecycle: Mutex<Lifecycle>,
    /// Serialises scan steps, explicit block scans and pointer resets.
    scan_guard: tokio::sync::Mutex<()>,
}

/// Walks a remote chain and reports the transactions relevant to tracked targets.
///
/// Cloning is cheap; clones share the same scanner.
#[derive(Clone)]
pub struct BlockScanner {
    inner: Arc<ScannerInner>,
}

impl BlockScanner {
    /// Creates an idle scanner and starts its notification relay.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ScannerConfig, source: Arc<dyn BlockSource>, extractor: Arc<dyn TransactionExtractor>) -> Self {
        let inner = ScannerInner {
            config,
            source,
            extractor,
            collaborators: RwLock::new(Collaborators::default()),
            lifecycle: Mutex::new(Lifecycle {
                state: ScannerState::Idle,
                timer: None,
                notifier: Some(NotificationSender::spawn()),
            }),
            scan_guard: tokio::sync::Mutex::new(()),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn symbol(&self) -> &str {
        &self.inner.config.symbol
    }

    pub fn state(&self) -> ScannerState {
        self.inner.lifecycle().state
    }

    pub fn is_scanning(&self) -> bool {
        self.state() == ScannerState::Running
    }

    pub fn set_block_scan_target_func_v2(&self, resolver: BlockScanTargetFuncV2) -> Result<(), ScanError> {
        self.inner.ensure_open()?;
        self.inner.collaborators_mut().resolver = Some(resolver);
        Ok(())
    }

    /// Installs the local chain cache and applies the configured header cache size.
    pub async fn set_blockchain_dai(&self, dai: Arc<dyn BlockchainDai>) -> Result<(), ScanError> {
        self.inner.ensure_open()?;
        dai.set_max_block_cache(self.inner.config.block_cache_size, &self.inner.config.symbol)
            .await?;
        self.inner.collaborators_mut().dai = Some(dai);
        Ok(())
    }

    /// Registers `observer`. Registering the same observer twice is a no-op.
    pub fn add_observer(&self, observer: SharedObserver) -> Result<(), ScanError> {
        self.inner.ensure_open()?;
        if !self.inner.collaborators_mut().observers.add(observer) {
            debug!(symbol = self.symbol(); "Observer already registered");
        }
        Ok(())
    }

    pub fn remove_observer(&self, observer: &SharedObserver) -> Result<(), ScanError> {
        self.inner.ensure_open()?;
        self.inner.collaborators_mut().observers.remove(observer);
        Ok(())
    }

    /// Starts the periodic scan. Does nothing if the scanner is already running.
    pub fn run(&self) -> Result<(), ScanError> {
        let mut lifecycle = self.inner.lifecycle();
        match lifecycle.state {
            ScannerState::Closed => return Err(ScanError::Closed),
            ScannerState::Running => return Ok(()),
            _ => {},
        }

        {
            let collaborators = self.inner.collaborators();
            if collaborators.resolver.is_none() {
                return Err(ScanError::Configuration("no scan target resolver set".to_string()));
            }
            if collaborators.dai.is_none() {
                return Err(ScanError::Configuration("no blockchain dai set".to_string()));
            }
        }

        let timer = CancellationToken::new();
        let period = self.inner.config.scan_period();
        tokio::spawn(scan_loop(Arc::downgrade(&self.inner), period, timer.clone()));
        lifecycle.timer = Some(timer);
        lifecycle.state = ScannerState::Running;

        info!(symbol = self.symbol(), period_secs = period.as_secs(); "Block scanner started");
        Ok(())
    }

    /// Halts the periodic scan. Resume with [`BlockScanner::restart`].
    pub fn stop(&self) {
        self.halt(ScannerState::Stopped);
    }

    pub fn pause(&self) {
        self.halt(ScannerState::Paused);
    }

    pub fn restart(&self) -> Result<(), ScanError> {
        self.run()
    }

    fn halt(&self, next: ScannerState) {
        let mut lifecycle = self.inner.lifecycle();
        if lifecycle.state == ScannerState::Closed {
            debug!(symbol = self.symbol(); "Ignoring halt of a closed scanner");
            return;
        }
        if let Some(timer) = lifecycle.timer.take() {
            timer.cancel();
        }
        if lifecycle.state != next {
            info!(symbol = self.symbol(), state:? = next; "Block scanner halted");
        }
        lifecycle.state = next;
    }

    /// Stops the scanner for good and shuts the notification relay down.
    ///
    /// Notifications already queued are still delivered. A second call returns
    /// [`ScanError::Closed`].
    pub fn close_block_scanner(&self) -> Result<(), ScanError> {
        let mut lifecycle = self.inner.lifecycle();
        if lifecycle.state == ScannerState::Closed {
            return Err(ScanError::Closed);
        }
        if let Some(timer) = lifecycle.timer.take() {
            timer.cancel();
        }
        lifecycle.notifier = None;
        lifecycle.state = ScannerState::Closed;
        info!(symbol = self.symbol(); "Block scanner closed");
        Ok(())
    }

    /// Runs one scan step, the same one the periodic timer runs.
    pub async fn scan_tick(&self) -> Result<TickOutcome, ScanError> {
        self.inner.clone().spawn_tick().await
    }

    /// Scans one explicit height without moving the scan pointer.
    pub async fn scan_block(&self, height: u64) -> Result<(), ScanError> {
        self.inner.ensure_open()?;
        let (dai, resolver) = self.inner.scan_collaborators()?;
        let _guard = self.inner.scan_guard.lock().await;

        let block = self.inner.fetch_block(dai.as_ref(), height).await?;
        let extracted = self.inner.process_block(dai.as_ref(), &resolver, &block).await?;
        self.inner.publish(&block.header, extracted).await;
        Ok(())
    }

    /// Makes the next scan step resume at `height`, which is scanned again.
    pub async fn set_rescan_block_height(&self, height: u64) -> Result<(), ScanError> {
        self.inner.ensure_open()?;
        if height == 0 {
            return Err(ScanError::InvalidHeight(height));
        }
        let dai = self.inner.dai()?;
        let _guard = self.inner.scan_guard.lock().await;

        let pointer = self.inner.seed_pointer(dai.as_ref(), height - 1).await?;
        info!(symbol = self.symbol(), height = height, pointer = pointer.height; "Rescan height set");
        Ok(())
    }

    /// Header of the current tip of the remote chain.
    pub async fn get_current_block_header(&self) -> Result<BlockHeader, ScanError> {
        let height = self.inner.source.get_current_height().await?;
        let block = self.inner.source.get_block_by_height(height).await?;
        Ok(block.header)
    }

    /// Height of the local scan pointer, or 0 if nothing has been scanned.
    pub async fn get_scanned_block_height(&self) -> u64 {
        let Ok(dai) = self.inner.dai() else {
            return 0;
        };
        match dai.get_current_block_head(self.symbol()).await {
            Ok(pointer) => pointer.map(|p| p.height).unwrap_or(0),
            Err(e) => {
                warn!(symbol = self.symbol(), error:% = e; "Failed to read scan pointer");
                0
            },
        }
    }

    /// Height of the remote chain tip, or 0 if the source cannot be reached.
    pub async fn get_global_max_block_height(&self) -> u64 {
        match self.inner.source.get_current_height().await {
            Ok(height) => height,
            Err(e) => {
                warn!(symbol = self.symbol(), error:% = e; "Failed to read chain height");
                0
            },
        }
    }

    pub async fn get_blockchain_sync_status(&self) -> Result<BlockchainSyncStatus, ScanError> {
        let dai = self.inner.dai()?;
        let network_block_height = self.inner.source.get_current_height().await?;
        let current_block_height = dai
            .get_current_block_head(self.symbol())
            .await?
            .map(|p| p.height)
            .unwrap_or(0);

        Ok(BlockchainSyncStatus {
            network_block_height,
            current_block_height,
            syncing: network_block_height > current_block_height,
        })
    }

    /// Extracts one transaction outside of a block scan, using `resolver` rather
    /// than the configured one.
    pub async fn extract_transaction_data(
        &self,
        tx_id: &str,
        resolver: &BlockScanTargetFuncV2,
    ) -> Result<ExtractedData, ScanError> {
        Ok(self.inner.extractor.extract_transaction(tx_id, None, resolver).await?)
    }

    pub async fn get_balance_by_address(&self, addresses: &[String]) -> Result<Vec<Balance>, ScanError> {
        Ok(self.inner.source.get_balance_by_address(addresses).await?)
    }
}

async fn scan_loop(inner: Weak<ScannerInner>, period: Duration, timer: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = timer.cancelled() => break,
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                match inner.clone().spawn_tick().await {
                    Ok(outcome) => debug!(symbol = &*inner.config.symbol, outcome:? = outcome; "Scan tick finished"),
                    Err(ScanError::Closed) => break,
                    Err(e) => warn!(symbol = &*inner.config.symbol, error:% = e; "Scan tick failed, retrying next tick"),
                }
            }
        }
    }
    debug!("Scan loop stopped");
}

impl ScannerInner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn collaborators(&self) -> RwLockReadGuard<'_, Collaborators> {
        self.collaborators.read().unwrap_or_else(|e| e.into_inner())
    }

    fn collaborators_mut(&self) -> RwLockWriteGuard<'_, Collaborators> {
        self.collaborators.write().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<(), ScanError> {
        if self.lifecycle().state == ScannerState::Closed {
            return Err(ScanError::Closed);
        }
        Ok(())
    }

    fn dai(&self) -> Result<Arc<dyn BlockchainDai>, ScanError> {
        self.collaborators()
            .dai
            .clone()
            .ok_or_else(|| ScanError::Configuration("no blockchain dai set".to_string()))
    }

    fn scan_collaborators(&self) -> Result<(Arc<dyn BlockchainDai>, BlockScanTargetFuncV2), ScanError> {
        let collaborators = self.collaborators();
        let dai = collaborators
            .dai
            .clone()
            .ok_or_else(|| ScanError::Configuration("no blockchain dai set".to_string()))?;
        let resolver = collaborators
            .resolver
            .clone()
            .ok_or_else(|| ScanError::Configuration("no scan target resolver set".to_string()))?;
        Ok((dai, resolver))
    }

    async fn notify(&self, notification: Notification) {
        let Some(notifier) = self.lifecycle().notifier.clone() else {
            debug!(symbol = &*self.config.symbol; "Scanner closed, dropping notification");
            return;
        };
        let observers = self.collaborators().observers.snapshot();
        if observers.is_empty() {
            return;
        }
        notifier.send(Envelope { observers, notification }).await;
    }

    /// Runs a tick on its own task, so a panicking collaborator surfaces as
    /// [`ScanError::Fatal`] instead of unwinding into the caller.
    async fn spawn_tick(self: Arc<Self>) -> Result<TickOutcome, ScanError> {
        let symbol = self.config.symbol.clone();
        tokio::spawn(async move { self.scan_tick().await })
            .await
            .map_err(|e| {
                error!(symbol = &*symbol, error:% = e; "Scan tick task failed");
                ScanError::Fatal(anyhow::anyhow!("scan tick task failed: {}", e))
            })?
    }

    async fn scan_tick(&self) -> Result<TickOutcome, ScanError> {
        self.ensure_open()?;
        let (dai, resolver) = self.scan_collaborators()?;
        let dai = dai.as_ref();
        let _guard = self.scan_guard.lock().await;
        let symbol = &self.config.symbol;

        let chain_height = self.source.get_current_height().await?;
        let mut pointer = match dai.get_current_block_head(symbol).await? {
            Some(pointer) => pointer,
            // Never start at the tip, it may still be replaced.
            None => self.seed_pointer(dai, chain_height.saturating_sub(1)).await?,
        };

        let mut outcome = TickOutcome::CaughtUp { height: pointer.height };
        if pointer.height < chain_height {
            for height in pointer.height + 1..=chain_height {
                if self.lifecycle().state == ScannerState::Closed {
                    return Err(ScanError::Closed);
                }

                let block = self.fetch_block(dai, height).await?;
                if self.is_fork(dai, &block).await? {
                    let rewound = self.roll_back(dai, height).await?;
                    outcome = TickOutcome::RolledBack {
                        detected_at: height,
                        height: rewound.height,
                    };
                    pointer = rewound;
                    break;
                }

                let extracted = self.process_block(dai, &resolver, &block).await?;
                dai.save_current_block_head(&block.header).await?;
                self.publish(&block.header, extracted).await;
                pointer = block.header;
                outcome = TickOutcome::Advanced { height: pointer.height };
            }
        }

        if self.config.rescan_failed_records {
            self.rescan_failed_records(dai, &resolver, pointer.height).await?;
        }
        Ok(outcome)
    }

    /// Points the scanner at `height`, caching a header for it so the next block
    /// can be checked against it.
    async fn seed_pointer(&self, dai: &dyn BlockchainDai, height: u64) -> Result<BlockHeader, ScanError> {
        let symbol = &self.config.symbol;
        let header = match dai.get_local_block_head_by_height(height, symbol).await? {
            Some(cached) => cached,
            None => {
                let hash = self.source.get_block_hash(height).await?;
                let header = BlockHeader::pointer(symbol, height, hash);
                dai.save_local_block_head(&header).await?;
                header
            },
        };
        dai.save_current_block_head(&header).await?;
        debug!(symbol = &**symbol, height = height; "Scan pointer seeded");
        Ok(header)
    }

    /// Fetches `height`, recording a block level failure if the source fails.
    async fn fetch_block(&self, dai: &dyn BlockchainDai, height: u64) -> Result<Block, ScanError> {
        let symbol = &self.config.symbol;
        match self.source.get_block_by_height(height).await {
            Ok(mut block) => {
                block.header.symbol = symbol.clone();
                block.header.fork = false;
                Ok(block)
            },
            Err(e) => {
                warn!(symbol = &**symbol, height = height, error:% = e; "Failed to fetch block");
                dai.save_unscan_record(&UnscanRecord::new(height, "", &e.to_string(), symbol))
                    .await?;
                Err(ScanError::Fetch(e))
            },
        }
    }

    /// A block whose parent is no longer cached cannot be verified and is
    /// treated as a fork.
    async fn is_fork(&self, dai: &dyn BlockchainDai, block: &Block) -> Result<bool, ScanError> {
        let height = block.header.height;
        if height == 0 {
            return Ok(false);
        }
        let parent = dai
            .get_local_block_head_by_height(height - 1, &self.config.symbol)
            .await?;
        Ok(match parent {
            Some(parent) => parent.hash != block.header.previous_hash,
            None => true,
        })
    }

    /// Discards the heights from the rewound pointer up to `fork_height` and
    /// returns the new pointer.
    async fn roll_back(&self, dai: &dyn BlockchainDai, fork_height: u64) -> Result<BlockHeader, ScanError> {
        let symbol = &self.config.symbol;
        let target = fork_height.saturating_sub(ROLLBACK_DEPTH).max(1).min(fork_height - 1);
        warn!(
            symbol = &**symbol,
            fork_height = fork_height,
            rollback_to = target;
            "Fork detected, rolling back scan pointer"
        );

        for height in target + 1..=fork_height {
            dai.delete_unscan_record_by_height(height, symbol).await?;
            dai.delete_transactions_by_height(height, symbol).await?;
            if height == fork_height {
                continue;
            }
            if let Some(mut discarded) = dai.get_local_block_head_by_height(height, symbol).await? {
                discarded.fork = true;
                self.notify(Notification::Block(discarded)).await;
            }
        }

        self.seed_pointer(dai, target).await
    }

    /// Extracts the transactions of `block`, records failures and caches the
    /// header. Does not touch the scan pointer.
    async fn process_block(
        &self,
        dai: &dyn BlockchainDai,
        resolver: &BlockScanTargetFuncV2,
        block: &Block,
    ) -> Result<ExtractedData, ScanError> {
        let symbol = &self.config.symbol;
        let height = block.header.height;
        let extracted = self.extract_block(dai, resolver, block).await?;

        dai.delete_unscan_record_by_id(&unscan_record_id(symbol, height, ""), symbol)
            .await?;
        dai.save_local_block_head(&block.header).await?;

        info!(
            symbol = &**symbol,
            height = height,
            txs = block.tx_ids.len(),
            accounts = extracted.len();
            "Scanned block"
        );
        Ok(extracted)
    }

    async fn publish(&self, header: &BlockHeader, extracted: ExtractedData) {
        self.notify(Notification::Block(header.clone())).await;
        self.notify_extracted(extracted).await;
    }

    async fn extract_block(
        &self,
        dai: &dyn BlockchainDai,
        resolver: &BlockScanTargetFuncV2,
        block: &Block,
    ) -> Result<ExtractedData, ScanError> {
        let symbol = &self.config.symbol;
        let height = block.header.height;

        let header = Arc::new(block.header.clone());
        let extractor = self.extractor.clone();
        let shared_resolver = resolver.clone();
        let results = run_bounded(block.tx_ids.clone(), self.config.extract_workers(), move |tx_id| {
            let header = header.clone();
            let extractor = extractor.clone();
            let resolver = shared_resolver.clone();
            async move { extractor.extract_transaction(&tx_id, Some(header.as_ref()), &resolver).await }
        })
        .await;

        let mut merged = ExtractedData::new();
        for (tx_id, result) in block.tx_ids.iter().zip(results) {
            match result {
                Some(Ok(data)) => {
                    dai.delete_unscan_record_by_id(&unscan_record_id(symbol, height, tx_id), symbol)
                        .await?;
                    self.save_transactions(dai, &data).await?;
                    for (source_key, items) in data {
                        merged.entry(source_key).or_default().extend(items);
                    }
                },
                Some(Err(e)) => {
                    warn!(symbol = &**symbol, height = height, tx_id = &**tx_id, error:% = e; "Failed to extract transaction");
                    dai.save_unscan_record(&UnscanRecord::new(height, tx_id, &e.to_string(), symbol))
                        .await?;
                },
                None => {
                    error!(symbol = &**symbol, height = height, tx_id = &**tx_id; "Extraction worker panicked");
                    dai.save_unscan_record(&UnscanRecord::new(height, tx_id, "extraction worker panicked", symbol))
                        .await?;
                },
            }
        }
        Ok(merged)
    }

    async fn save_transactions(&self, dai: &dyn BlockchainDai, data: &ExtractedData) -> Result<(), ScanError> {
        if !self.config.save_transactions {
            return Ok(());
        }
        for tx in data.values().flatten().filter_map(|d| d.transaction.as_ref()) {
            dai.save_transaction(tx).await?;
        }
        Ok(())
    }

    async fn notify_extracted(&self, extracted: ExtractedData) {
        for (source_key, items) in extracted {
            debug!(source_key:% = mask_string(&source_key), count = items.len(); "Relaying extracted data");
            for data in items {
                self.notify(Notification::ExtractData {
                    source_key: source_key.clone(),
                    data,
                })
                .await;
            }
        }
    }

    /// Retries the unscanned records at or below `pointer_height`.
    ///
    /// Block level records above the pointer are left to the regular walk.
    async fn rescan_failed_records(
        &self,
        dai: &dyn BlockchainDai,
        resolver: &BlockScanTargetFuncV2,
        pointer_height: u64,
    ) -> Result<(), ScanError> {
        let symbol = &self.config.symbol;
        let records = dai.get_unscan_records(symbol).await?;

        for record in records {
            if record.is_permanent() {
                debug!(symbol = &**symbol, height = record.block_height, tx_id = &*record.tx_id; "Dropping permanent unscan record");
                dai.delete_unscan_record_by_id(&record.id, symbol).await?;
                continue;
            }

            if record.is_block_level() {
                if record.block_height > pointer_height {
                    continue;
                }
                match self.source.get_block_by_height(record.block_height).await {
                    Ok(mut block) => {
                        block.header.symbol = symbol.clone();
                        let extracted = self.process_block(dai, resolver, &block).await?;
                        self.publish(&block.header, extracted).await;
                    },
                    Err(e) => {
                        debug!(symbol = &**symbol, height = record.block_height, error:% = e; "Block still unavailable");
                    },
                }
                continue;
            }

            let header = dai
                .get_local_block_head_by_height(record.block_height, symbol)
                .await?;
            match self
                .extractor
                .extract_transaction(&record.tx_id, header.as_ref(), resolver)
                .await
            {
                Ok(data) => {
                    dai.delete_unscan_record_by_id(&record.id, symbol).await?;
                    self.save_transactions(dai, &data).await?;
                    info!(symbol = &**symbol, height = record.block_height, tx_id = &*record.tx_id; "Rescanned failed transaction");
                    self.notify_extracted(data).await;
                },
                Err(ExtractError::TransactionNotFound(_)) => {
                    dai.delete_unscan_record_by_id(&record.id, symbol).await?;
                },
                Err(e) => {
                    debug!(symbol = &**symbol, tx_id = &*record.tx_id, error:% = e; "Transaction still failing");
                },
            }
        }
        Ok(())
    }
}

impl Drop for ScannerInner {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(timer) = lifecycle.timer.take() {
            timer.cancel();
        }
    }
}
