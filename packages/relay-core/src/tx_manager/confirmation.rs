use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConfirmationOutcome, ConfirmationReport, NonceManager, SubmissionStatus};
use crate::chain_adapter::LedgerClient;
use crate::resilience::ErrorHandler;
use crate::Error;

/// Everything one confirmation poller needs, detached from the manager so it
/// can run as its own task.
pub(crate) struct ConfirmationWatch {
    pub chain: String,
    pub tx_hash: String,
    pub message_id: String,
    pub required_confirmations: u64,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub submitted_at: Instant,
    pub client: Arc<dyn LedgerClient>,
    pub handler: Arc<ErrorHandler>,
    pub nonces: Arc<NonceManager>,
    pub pending: Arc<RwLock<HashMap<String, super::PendingSubmission>>>,
    pub outcomes: mpsc::Sender<ConfirmationReport>,
}

impl ConfirmationWatch {
    /// Polls for the receipt until the transaction reaches the required depth,
    /// reverts, or the timeout elapses. Exits without a report on cancellation,
    /// leaving the submission recorded as pending.
    pub async fn run(self, token: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(chain = %self.chain, tx_hash = %self.tx_hash, "confirmation poller cancelled");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if self.submitted_at.elapsed() >= self.timeout {
                warn!(
                    chain = %self.chain,
                    tx_hash = %self.tx_hash,
                    message_id = %self.message_id,
                    "transaction not confirmed before timeout"
                );
                // an unmined transaction leaves its nonce unused on the ledger
                self.nonces.cursor(&self.chain).lock().await.invalidate();
                self.finish(SubmissionStatus::Replaced, ConfirmationOutcome::Timeout, &token).await;
                return;
            }

            match self.poll(&token).await {
                Ok(Some((status, outcome))) => {
                    self.finish(status, outcome, &token).await;
                    return;
                }
                Ok(None) => {}
                Err(Error::Cancelled) => return,
                Err(err) => {
                    warn!(chain = %self.chain, tx_hash = %self.tx_hash, error = %err, "receipt poll failed");
                }
            }
        }
    }

    async fn poll(&self, token: &CancellationToken) -> Result<Option<(SubmissionStatus, ConfirmationOutcome)>, Error> {
        let client = &self.client;
        let tx_hash = self.tx_hash.as_str();
        let receipt = self
            .handler
            .handle_error(token, &format!("receipt:{}", self.chain), || client.receipt(tx_hash))
            .await?;

        let Some(receipt) = receipt else {
            debug!(chain = %self.chain, tx_hash, "receipt not yet available");
            return Ok(None);
        };
        if !receipt.success {
            return Ok(Some((SubmissionStatus::Failed, ConfirmationOutcome::Reverted)));
        }

        let head = self
            .handler
            .handle_error(token, &format!("block:{}", self.chain), || client.block_number())
            .await?;
        let confirmations = head.saturating_sub(receipt.block_number) + 1;
        if let Some(pending) = self.pending.write().get_mut(&self.tx_hash) {
            pending.confirmations = confirmations;
        }

        if confirmations >= self.required_confirmations {
            Ok(Some((SubmissionStatus::Confirmed, ConfirmationOutcome::Confirmed { confirmations })))
        } else {
            debug!(
                chain = %self.chain,
                tx_hash,
                confirmations,
                required = self.required_confirmations,
                "waiting for confirmation depth"
            );
            Ok(None)
        }
    }

    async fn finish(&self, status: SubmissionStatus, outcome: ConfirmationOutcome, token: &CancellationToken) {
        self.pending.write().remove(&self.tx_hash);
        info!(
            chain = %self.chain,
            tx_hash = %self.tx_hash,
            message_id = %self.message_id,
            status = ?status,
            "submission settled"
        );

        let report = ConfirmationReport {
            message_id: self.message_id.clone(),
            chain: self.chain.clone(),
            tx_hash: self.tx_hash.clone(),
            status,
            outcome,
            latency: self.submitted_at.elapsed(),
        };
        tokio::select! {
            _ = token.cancelled() => {}
            sent = self.outcomes.send(report) => {
                if sent.is_err() {
                    warn!(tx_hash = %self.tx_hash, "settlement channel closed, dropping confirmation report");
                }
            }
        }
    }
}
