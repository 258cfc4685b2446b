//! Notification relay between the scan loop and the observers.
//!
//! Each pipeline is two long-lived tasks. The relay task takes notifications
//! from the producer channel into a pending queue and forwards them to the
//! consumer channel as soon as it has room. The fan-out task drains the consumer
//! channel and calls every observer in turn. A slow observer therefore only
//! stalls the fan-out task; the producer side keeps accepting.
//!
//! Dropping every producer sender flushes the pending queue and ends both tasks.

use std::{collections::VecDeque, panic::AssertUnwindSafe};

use futures::FutureExt;
use log::{debug, error, warn};
use tokio::sync::mpsc;

use crate::{
    log::mask_string,
    models::{BlockHeader, TxExtractData},
    scan::observer::{BlockScanNotificationObject, SharedObserver},
};

#[derive(Debug, Clone)]
pub enum Notification {
    Block(BlockHeader),
    ExtractData { source_key: String, data: TxExtractData },
}

impl Notification {
    async fn deliver(&self, observer: &dyn BlockScanNotificationObject) -> anyhow::Result<()> {
        match self {
            Notification::Block(header) => observer.block_scan_notify(header).await,
            Notification::ExtractData { source_key, data } => observer.block_extract_data_notify(source_key, data).await,
        }
    }

    fn describe(&self) -> String {
        match self {
            Notification::Block(header) => format!("block {}", header.height),
            Notification::ExtractData { source_key, .. } => format!("extract data for {}", mask_string(source_key)),
        }
    }
}

/// A notification together with the observers registered when it was sent.
pub struct Envelope {
    pub observers: Vec<SharedObserver>,
    pub notification: Notification,
}

/// Producer side of the block and extract data pipelines.
#[derive(Clone)]
pub struct NotificationSender {
    block_tx: mpsc::Sender<Envelope>,
    extract_tx: mpsc::Sender<Envelope>,
}

impl NotificationSender {
    /// Starts both pipelines. Must be called from within a tokio runtime.
    pub fn spawn() -> Self {
        Self {
            block_tx: spawn_pipeline("block"),
            extract_tx: spawn_pipeline("extract_data"),
        }
    }

    pub async fn send(&self, envelope: Envelope) {
        let tx = match envelope.notification {
            Notification::Block(_) => &self.block_tx,
            Notification::ExtractData { .. } => &self.extract_tx,
        };
        if tx.send(envelope).await.is_err() {
            debug!("Notification pipeline already stopped, dropping notification");
        }
    }
}

fn spawn_pipeline(name: &'static str) -> mpsc::Sender<Envelope> {
    let (producer_tx, producer_rx) = mpsc::channel(1);
    let (consumer_tx, consumer_rx) = mpsc::channel(1);
    tokio::spawn(relay(producer_rx, consumer_tx));
    tokio::spawn(fan_out(name, consumer_rx));
    producer_tx
}

async fn relay<T: Send>(mut producer_rx: mpsc::Receiver<T>, consumer_tx: mpsc::Sender<T>) {
    let mut pending = VecDeque::new();

    loop {
        if pending.is_empty() {
            match producer_rx.recv().await {
                Some(item) => pending.push_back(item),
                None => break,
            }
            continue;
        }

        tokio::select! {
            item = producer_rx.recv() => match item {
                Some(item) => pending.push_back(item),
                None => break,
            },
            permit = consumer_tx.reserve() => match permit {
                Ok(permit) => {
                    if let Some(item) = pending.pop_front() {
                        permit.send(item);
                    }
                },
                Err(_) => return,
            },
        }
    }

    while let Some(item) = pending.pop_front() {
        if consumer_tx.send(item).await.is_err() {
            return;
        }
    }
}

async fn fan_out(name: &'static str, mut consumer_rx: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = consumer_rx.recv().await {
        for observer in &envelope.observers {
            let delivery = AssertUnwindSafe(envelope.notification.deliver(observer.as_ref()))
                .catch_unwind()
                .await;
            match delivery {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    warn!(
                        pipeline = name,
                        notification:% = envelope.notification.describe(),
                        error:% = e;
                        "Observer failed to handle notification"
                    );
                },
                Err(_) => {
                    error!(
                        pipeline = name,
                        notification:% = envelope.notification.describe();
                        "Observer panicked while handling notification"
                    );
                },
            }
        }
    }
    debug!(pipeline = name; "Notification pipeline stopped");
}
