//! Source event listener: polls the source ledger for lending contract logs
//! and hands decoded events to an [`EventHandler`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::chain_adapter::SourceLedger;
use crate::config::SourceConfig;
use crate::resilience::ErrorHandler;
use crate::types::SourceEvent;
use crate::Result;

pub mod abi;

pub use abi::{decode_log, encode_event, event_topic};

/// Receives each decoded event, in ledger order.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: SourceEvent);
}

pub struct SourceEventListener {
    source: Arc<dyn SourceLedger>,
    handler: Arc<ErrorHandler>,
    contract: String,
    poll_interval: Duration,
    start_block: Option<u64>,
    max_block_range: u64,
    /// Highest block whose logs have been dispatched.
    checkpoint: Mutex<Option<u64>>,
    running: Mutex<Option<CancellationToken>>,
}

impl SourceEventListener {
    pub fn new(config: &SourceConfig, source: Arc<dyn SourceLedger>, handler: Arc<ErrorHandler>) -> Self {
        Self {
            source,
            handler,
            contract: config.contract_address.clone(),
            poll_interval: config.poll_interval(),
            start_block: config.start_block,
            max_block_range: config.max_block_range.max(1),
            checkpoint: Mutex::new(None),
            running: Mutex::new(None),
        }
    }

    pub fn checkpoint(&self) -> Option<u64> {
        *self.checkpoint.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawns the poll loop on `tracker`. The loop ends when `token` or
    /// [`stop`](Self::stop) cancels it.
    pub fn start(self: &Arc<Self>, token: &CancellationToken, tracker: &TaskTracker, on_event: Arc<dyn EventHandler>) {
        let token = token.child_token();
        if let Some(previous) = self.running.lock().replace(token.clone()) {
            previous.cancel();
        }
        info!(contract = %self.contract, interval_secs = self.poll_interval.as_secs(), "starting source event listener");

        let listener = self.clone();
        tracker.spawn(async move {
            listener.run(token, on_event).await;
        });
    }

    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            info!(contract = %self.contract, "stopping source event listener");
            token.cancel();
        }
    }

    async fn run(&self, token: CancellationToken, on_event: Arc<dyn EventHandler>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.poll_once(&token, on_event.as_ref()).await {
                Ok(0) => {}
                Ok(count) => debug!(count, checkpoint = ?self.checkpoint(), "dispatched source events"),
                Err(crate::Error::Cancelled) => break,
                Err(e) => error!(error = %e, "source poll failed"),
            }
        }
        debug!(contract = %self.contract, "source event listener exited");
    }

    /// One poll tick: fetches logs in `(checkpoint, head]`, capped at
    /// `max_block_range` blocks, dispatches every decodable event and then
    /// advances the checkpoint. Returns the number of events dispatched.
    pub async fn poll_once(&self, token: &CancellationToken, on_event: &dyn EventHandler) -> Result<usize> {
        let source = &self.source;
        let head = self
            .handler
            .handle_error(token, "source:head", || source.head())
            .await?;

        let checkpoint = {
            let mut checkpoint = self.checkpoint.lock();
            *checkpoint.get_or_insert_with(|| match self.start_block {
                Some(start) => start.saturating_sub(1),
                None => head,
            })
        };
        if head <= checkpoint {
            return Ok(0);
        }

        let from = checkpoint + 1;
        let to = head.min(checkpoint.saturating_add(self.max_block_range));
        let contract = self.contract.as_str();
        let mut logs = self
            .handler
            .handle_error(token, "source:logs", || source.logs(contract, from, to))
            .await?;
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        let mut dispatched = 0;
        for log in &logs {
            match abi::decode_log(log) {
                Ok(Some(event)) => {
                    debug!(
                        event = event.name(),
                        block = log.block_number,
                        tx_hash = %log.transaction_hash,
                        "source event decoded"
                    );
                    on_event.on_event(event).await;
                    dispatched += 1;
                }
                Ok(None) => warn!(
                    topic = log.topics.first().map(String::as_str).unwrap_or_default(),
                    block = log.block_number,
                    "ignoring log with unknown event topic"
                ),
                Err(e) => warn!(
                    block = log.block_number,
                    log_index = log.log_index,
                    tx_hash = %log.transaction_hash,
                    error = %e,
                    "skipping malformed log"
                ),
            }
        }

        *self.checkpoint.lock() = Some(to);
        Ok(dispatched)
    }
}
