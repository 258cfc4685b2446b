#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use blockscan::{
    chain_cache::{BlockchainDai, BlockchainLocal},
    db::{ChainCacheError, ChainCacheResult},
    models::{BlockHeader, Transaction, TxExtractData, TxOutput, UnscanRecord},
    scan::{
        Block, BlockScanNotificationObject, BlockScanTargetFuncV2, BlockScanner, BlockSource, ExtractError,
        ScanTargetParam, ScanTargetResult, ScanTargetType, ScannerConfig, SourceError, TransactionExtractor,
    },
};
use tempfile::TempDir;

pub const SYMBOL: &str = "BTC";
pub const TXS_PER_BLOCK: usize = 3;

pub fn make_block(height: u64, hash: String, previous_hash: String) -> Block {
    Block {
        header: BlockHeader {
            hash,
            previous_hash,
            height,
            time: 1_700_000_000 + height * 600,
            symbol: SYMBOL.to_string(),
            ..Default::default()
        },
        tx_ids: (0..TXS_PER_BLOCK).map(|i| format!("tx-{}-{}", height, i)).collect(),
    }
}

/// In-memory chain where block `h` has hash `h<h>` unless reorganized.
#[derive(Default)]
pub struct MockChain {
    blocks: Mutex<BTreeMap<u64, Block>>,
    unavailable: Mutex<HashSet<u64>>,
    fetched: Mutex<Vec<u64>>,
    crash_next: AtomicBool,
}

impl MockChain {
    pub fn new(tip: u64) -> Self {
        let chain = Self::default();
        chain.extend_to(tip);
        chain
    }

    pub fn tip(&self) -> u64 {
        self.blocks.lock().unwrap().keys().next_back().copied().unwrap_or(0)
    }

    pub fn hash_at(&self, height: u64) -> String {
        self.blocks.lock().unwrap()[&height].header.hash.clone()
    }

    pub fn extend_to(&self, tip: u64) {
        let mut blocks = self.blocks.lock().unwrap();
        let start = blocks.keys().next_back().map(|h| h + 1).unwrap_or(0);
        for height in start..=tip {
            let previous_hash = match height.checked_sub(1) {
                Some(parent) => blocks[&parent].header.hash.clone(),
                None => String::new(),
            };
            blocks.insert(height, make_block(height, format!("h{}", height), previous_hash));
        }
    }

    /// Replaces every block from `height` up to the tip with a competing branch.
    pub fn reorganize_from(&self, height: u64, tag: &str) {
        let mut blocks = self.blocks.lock().unwrap();
        let tip = blocks.keys().next_back().copied().unwrap_or(0);
        for h in height..=tip {
            let previous_hash = blocks[&(h - 1)].header.hash.clone();
            blocks.insert(h, make_block(h, format!("{}{}", tag, h), previous_hash));
        }
    }

    pub fn set_unavailable(&self, height: u64, unavailable: bool) {
        let mut set = self.unavailable.lock().unwrap();
        if unavailable {
            set.insert(height);
        } else {
            set.remove(&height);
        }
    }

    /// Makes the next height query panic, as a crashing node client would.
    pub fn crash_next_height_query(&self) {
        self.crash_next.store(true, Ordering::SeqCst);
    }

    pub fn take_fetched(&self) -> Vec<u64> {
        std::mem::take(&mut *self.fetched.lock().unwrap())
    }
}

#[async_trait]
impl BlockSource for MockChain {
    async fn get_block_by_height(&self, height: u64) -> Result<Block, SourceError> {
        self.fetched.lock().unwrap().push(height);
        if self.unavailable.lock().unwrap().contains(&height) {
            return Err(SourceError::Transient(format!("node timeout at {}", height)));
        }
        self.blocks
            .lock()
            .unwrap()
            .get(&height)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("block {}", height)))
    }

    async fn get_current_height(&self) -> Result<u64, SourceError> {
        if self.crash_next.swap(false, Ordering::SeqCst) {
            panic!("node client crashed");
        }
        Ok(self.tip())
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, SourceError> {
        self.blocks
            .lock()
            .unwrap()
            .get(&height)
            .map(|b| b.header.hash.clone())
            .ok_or_else(|| SourceError::NotFound(format!("block {}", height)))
    }
}

/// Transaction `tx-<h>-<i>` pays `addr-<i>`.
#[derive(Default)]
pub struct MockExtractor {
    failing: Mutex<HashSet<String>>,
    missing: Mutex<HashSet<String>>,
}

impl MockExtractor {
    pub fn fail(&self, tx_id: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(tx_id.to_string());
        } else {
            set.remove(tx_id);
        }
    }

    pub fn mark_missing(&self, tx_id: &str) {
        self.missing.lock().unwrap().insert(tx_id.to_string());
    }
}

#[async_trait]
impl TransactionExtractor for MockExtractor {
    async fn extract_transaction(
        &self,
        tx_id: &str,
        header: Option<&BlockHeader>,
        resolver: &BlockScanTargetFuncV2,
    ) -> Result<HashMap<String, Vec<TxExtractData>>, ExtractError> {
        if self.missing.lock().unwrap().contains(tx_id) {
            return Err(ExtractError::TransactionNotFound(tx_id.to_string()));
        }
        if self.failing.lock().unwrap().contains(tx_id) {
            return Err(ExtractError::Failed {
                tx_id: tx_id.to_string(),
                reason: "decode error".to_string(),
            });
        }

        let mut parts = tx_id.split('-').skip(1);
        let height: u64 = parts.next().and_then(|h| h.parse().ok()).unwrap_or(0);
        let index = parts.next().unwrap_or("0");
        let address = format!("addr-{}", index);

        let target = resolver(ScanTargetParam::new(&address, SYMBOL, ScanTargetType::AccountAddress));
        if !target.exist {
            return Ok(HashMap::new());
        }

        let block_hash = header.map(|h| h.hash.clone()).unwrap_or_default();
        let data = TxExtractData {
            tx_inputs: Vec::new(),
            tx_outputs: vec![TxOutput {
                tx_id: tx_id.to_string(),
                index: 0,
                address: address.clone(),
                amount: "1.5".to_string(),
                symbol: SYMBOL.to_string(),
                block_height: height,
                block_hash: block_hash.clone(),
            }],
            transaction: Some(Transaction {
                tx_id: tx_id.to_string(),
                account_id: target.source_key.clone(),
                to: vec![address],
                amount: "1.5".to_string(),
                block_height: height,
                block_hash,
                symbol: SYMBOL.to_string(),
                ..Default::default()
            }),
        };
        Ok(HashMap::from([(target.source_key, vec![data])]))
    }
}

/// `addr-0` belongs to `account-a`, `addr-1` to `account-b`; nothing else is tracked.
pub fn resolver() -> BlockScanTargetFuncV2 {
    Arc::new(|param: ScanTargetParam| match param.scan_target.as_str() {
        "addr-0" => ScanTargetResult::found("account-a", None),
        "addr-1" => ScanTargetResult::found("account-b", None),
        _ => ScanTargetResult::not_found(),
    })
}

#[derive(Default)]
pub struct Recorder {
    pub headers: Mutex<Vec<BlockHeader>>,
    pub extracted: Mutex<Vec<(String, String)>>,
}

impl Recorder {
    pub fn heights(&self) -> Vec<u64> {
        self.headers
            .lock()
            .unwrap()
            .iter()
            .filter(|h| !h.fork)
            .map(|h| h.height)
            .collect()
    }

    pub fn forked(&self) -> Vec<BlockHeader> {
        self.headers.lock().unwrap().iter().filter(|h| h.fork).cloned().collect()
    }

    pub fn extracted(&self) -> Vec<(String, String)> {
        self.extracted.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlockScanNotificationObject for Recorder {
    async fn block_scan_notify(&self, header: &BlockHeader) -> anyhow::Result<()> {
        self.headers.lock().unwrap().push(header.clone());
        Ok(())
    }

    async fn block_extract_data_notify(&self, source_key: &str, data: &TxExtractData) -> anyhow::Result<()> {
        let tx_id = data.transaction.as_ref().map(|t| t.tx_id.clone()).unwrap_or_default();
        self.extracted.lock().unwrap().push((source_key.to_string(), tx_id));
        Ok(())
    }
}

/// Observer that takes `delay` to handle every block.
pub struct SlowObserver {
    pub delay: Duration,
}

#[async_trait]
impl BlockScanNotificationObject for SlowObserver {
    async fn block_scan_notify(&self, _header: &BlockHeader) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn block_extract_data_notify(&self, _source_key: &str, _data: &TxExtractData) -> anyhow::Result<()> {
        Ok(())
    }
}

/// [`BlockchainLocal`] whose header writes can be made to fail.
pub struct FlakyDai {
    inner: Arc<BlockchainLocal>,
    fail_current: AtomicBool,
    fail_local: AtomicBool,
}

impl FlakyDai {
    pub fn new(inner: Arc<BlockchainLocal>) -> Self {
        Self {
            inner,
            fail_current: AtomicBool::new(false),
            fail_local: AtomicBool::new(false),
        }
    }

    pub fn fail_current_head(&self, fail: bool) {
        self.fail_current.store(fail, Ordering::SeqCst);
    }

    pub fn fail_local_head(&self, fail: bool) {
        self.fail_local.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool) -> ChainCacheResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(ChainCacheError::Task("disk full".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BlockchainDai for FlakyDai {
    async fn save_current_block_head(&self, header: &BlockHeader) -> ChainCacheResult<()> {
        Self::check(&self.fail_current)?;
        self.inner.save_current_block_head(header).await
    }

    async fn get_current_block_head(&self, symbol: &str) -> ChainCacheResult<Option<BlockHeader>> {
        self.inner.get_current_block_head(symbol).await
    }

    async fn save_local_block_head(&self, header: &BlockHeader) -> ChainCacheResult<()> {
        Self::check(&self.fail_local)?;
        self.inner.save_local_block_head(header).await
    }

    async fn get_local_block_head_by_height(&self, height: u64, symbol: &str) -> ChainCacheResult<Option<BlockHeader>> {
        self.inner.get_local_block_head_by_height(height, symbol).await
    }

    async fn save_unscan_record(&self, record: &UnscanRecord) -> ChainCacheResult<()> {
        self.inner.save_unscan_record(record).await
    }

    async fn delete_unscan_record_by_height(&self, height: u64, symbol: &str) -> ChainCacheResult<()> {
        self.inner.delete_unscan_record_by_height(height, symbol).await
    }

    async fn delete_unscan_record_by_id(&self, id: &str, symbol: &str) -> ChainCacheResult<()> {
        self.inner.delete_unscan_record_by_id(id, symbol).await
    }

    async fn get_unscan_records(&self, symbol: &str) -> ChainCacheResult<Vec<UnscanRecord>> {
        self.inner.get_unscan_records(symbol).await
    }

    async fn set_max_block_cache(&self, size: u64, symbol: &str) -> ChainCacheResult<()> {
        self.inner.set_max_block_cache(size, symbol).await
    }

    async fn save_transaction(&self, tx: &Transaction) -> ChainCacheResult<()> {
        self.inner.save_transaction(tx).await
    }

    async fn get_transactions_by_tx_id(&self, tx_id: &str, symbol: &str) -> ChainCacheResult<Vec<Transaction>> {
        self.inner.get_transactions_by_tx_id(tx_id, symbol).await
    }

    async fn delete_transactions_by_height(&self, height: u64, symbol: &str) -> ChainCacheResult<()> {
        self.inner.delete_transactions_by_height(height, symbol).await
    }
}

pub struct Harness {
    pub scanner: BlockScanner,
    pub local: Arc<BlockchainLocal>,
    pub chain: Arc<MockChain>,
    pub extractor: Arc<MockExtractor>,
    pub recorder: Arc<Recorder>,
    _dir: TempDir,
}

pub fn test_config() -> ScannerConfig {
    ScannerConfig {
        symbol: SYMBOL.to_string(),
        scan_period_secs: 1,
        block_cache_size: 50,
        extract_workers: 2,
        ..Default::default()
    }
}

pub async fn harness(tip: u64, config: ScannerConfig) -> Harness {
    harness_with_dai(tip, config, |local| local as Arc<dyn BlockchainDai>).await
}

/// Harness whose scanner writes through a [`FlakyDai`]; `local` still reads the same store.
pub async fn flaky_harness(tip: u64, config: ScannerConfig) -> (Harness, Arc<FlakyDai>) {
    let mut flaky = None;
    let h = harness_with_dai(tip, config, |local| {
        let dai = Arc::new(FlakyDai::new(local));
        flaky = Some(dai.clone());
        dai as Arc<dyn BlockchainDai>
    })
    .await;
    (h, flaky.unwrap())
}

async fn harness_with_dai(
    tip: u64,
    config: ScannerConfig,
    wrap: impl FnOnce(Arc<BlockchainLocal>) -> Arc<dyn BlockchainDai>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let local = Arc::new(BlockchainLocal::open(dir.path().join("scan.db"), config.keep_open).unwrap());
    let chain = Arc::new(MockChain::new(tip));
    let extractor = Arc::new(MockExtractor::default());
    let recorder = Arc::new(Recorder::default());

    let scanner = BlockScanner::new(config, chain.clone(), extractor.clone());
    scanner.set_block_scan_target_func_v2(resolver()).unwrap();
    scanner.set_blockchain_dai(wrap(local.clone())).await.unwrap();
    scanner.add_observer(recorder.clone()).unwrap();

    Harness {
        scanner,
        local,
        chain,
        extractor,
        recorder,
        _dir: dir,
    }
}

/// Polls `condition` until it holds or two seconds have passed.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
