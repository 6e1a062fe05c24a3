//! Destination-side transaction handling: nonce allocation, gas pricing,
//! signing, broadcast and confirmation tracking.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::chain_adapter::{LedgerClient, LedgerClients};
use crate::config::{ChainTarget, Config};
use crate::resilience::ErrorHandler;
use crate::types::RelayMessage;
use crate::verify::PayloadSigner;
use crate::{Error, Result};

mod confirmation;
pub mod gas;
pub mod nonce;

use confirmation::ConfirmationWatch;
pub use gas::GasPriceCache;
pub use nonce::{NonceCursor, NonceManager};

/// The unsigned body of a destination transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub network_id: u64,
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    /// Destination contract.
    pub to: String,
    /// The relay message payload.
    pub data: Vec<u8>,
    pub message_id: String,
}

/// A request plus the relayer's signature over its bcs encoding. The bcs
/// encoding of this struct is what gets broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub request: TransactionRequest,
    pub from: String,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Confirmed,
    Failed,
    /// Never confirmed in time. The chain's nonce cursor is dropped so the
    /// resubmission takes whatever nonce the ledger still expects.
    Replaced,
}

/// One broadcast transaction awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSubmission {
    pub chain: String,
    pub tx_hash: String,
    pub message_id: String,
    pub nonce: u64,
    pub submitted_at: DateTime<Utc>,
    pub confirmations: u64,
    pub required_confirmations: u64,
    pub status: SubmissionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Confirmed { confirmations: u64 },
    /// Included but reverted. Not retryable.
    Reverted,
    /// Not confirmed within the configured timeout. Retryable.
    Timeout,
}

/// Final word from a confirmation poller, handed back to the relay core.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationReport {
    pub message_id: String,
    pub chain: String,
    pub tx_hash: String,
    pub status: SubmissionStatus,
    pub outcome: ConfirmationOutcome,
    /// Time from broadcast to settlement.
    pub latency: Duration,
}

impl ConfirmationReport {
    /// The outcome as an error, `None` when confirmed.
    pub fn error(&self) -> Option<Error> {
        match self.outcome {
            ConfirmationOutcome::Confirmed { .. } => None,
            ConfirmationOutcome::Reverted => Some(Error::Reverted {
                chain: self.chain.clone(),
                tx_hash: self.tx_hash.clone(),
            }),
            ConfirmationOutcome::Timeout => Some(Error::ConfirmationTimeout {
                chain: self.chain.clone(),
                tx_hash: self.tx_hash.clone(),
            }),
        }
    }
}

pub struct TransactionManager {
    chains: HashMap<String, ChainTarget>,
    clients: LedgerClients,
    signer: Arc<dyn PayloadSigner>,
    address: String,
    handler: Arc<ErrorHandler>,
    nonces: Arc<NonceManager>,
    gas: GasPriceCache,
    pending: Arc<RwLock<HashMap<String, PendingSubmission>>>,
    poll_interval: Duration,
    confirmation_timeout: Duration,
    outcomes: mpsc::Sender<ConfirmationReport>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl TransactionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        clients: LedgerClients,
        signer: Arc<dyn PayloadSigner>,
        handler: Arc<ErrorHandler>,
        outcomes: mpsc::Sender<ConfirmationReport>,
        token: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        let address = signer.address();
        Self {
            chains: config.chains.iter().map(|c| (c.id.clone(), c.clone())).collect(),
            clients,
            signer,
            address,
            handler,
            nonces: Arc::new(NonceManager::new()),
            gas: GasPriceCache::new(config.relayer.gas_price_ttl()),
            pending: Arc::new(RwLock::new(HashMap::new())),
            poll_interval: config.relayer.confirmation_poll_interval(),
            confirmation_timeout: config.relayer.confirmation_timeout(),
            outcomes,
            token,
            tracker,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn nonces(&self) -> &NonceManager {
        &self.nonces
    }

    pub fn gas_cache(&self) -> &GasPriceCache {
        &self.gas
    }

    pub fn client(&self, chain: &str) -> Option<&Arc<dyn LedgerClient>> {
        self.clients.get(chain)
    }

    pub fn clients(&self) -> &LedgerClients {
        &self.clients
    }

    /// In-flight submissions, oldest first.
    pub fn pending_submissions(&self) -> Vec<PendingSubmission> {
        let mut pending: Vec<_> = self.pending.read().values().cloned().collect();
        pending.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.nonce.cmp(&b.nonce)));
        pending
    }

    /// Builds, signs and broadcasts the transaction carrying `message`, then
    /// starts a confirmation poller for it. Returns the transaction hash.
    pub async fn submit(&self, message: &RelayMessage) -> Result<String> {
        let chain = message.target_chain.as_str();
        let target = self
            .chains
            .get(chain)
            .filter(|t| t.enabled)
            .ok_or_else(|| Error::UnsupportedChain(chain.to_string()))?;
        let client = self
            .clients
            .get(chain)
            .ok_or_else(|| Error::UnsupportedChain(chain.to_string()))?;

        let cursor = self.nonces.cursor(chain);
        let mut cursor = cursor.lock().await;

        let nonce = match cursor.next() {
            Some(nonce) => nonce,
            None => {
                let address = self.address.as_str();
                let nonce = self
                    .handler
                    .handle_error(&self.token, &format!("nonce:{}", chain), || client.pending_nonce(address))
                    .await?;
                debug!(chain, nonce, "nonce cursor refreshed from ledger");
                cursor.set(nonce);
                nonce
            }
        };

        let gas_operation = format!("gas:{}", chain);
        let gas_price = self
            .gas
            .resolve(chain, || {
                self.handler
                    .handle_error(&self.token, &gas_operation, || client.suggest_gas_price())
            })
            .await?;
        if gas_price > target.gas_price {
            return Err(Error::GasPriceCeiling {
                chain: chain.to_string(),
                price: gas_price,
                ceiling: target.gas_price,
            });
        }

        let gas_limit = message.kind.gas_limit();
        if gas_limit > target.gas_limit {
            return Err(Error::GasLimitCeiling {
                chain: chain.to_string(),
                limit: gas_limit,
                ceiling: target.gas_limit,
            });
        }

        let request = TransactionRequest {
            network_id: target.network_id,
            nonce,
            gas_price,
            gas_limit,
            to: target.contract_address.clone(),
            data: message.payload.clone(),
            message_id: message.id.clone(),
        };
        let raw = self.sign_transaction(request)?;

        let tx_hash = match client.broadcast(&raw).await {
            Ok(tx_hash) => tx_hash,
            Err(err) => {
                if matches!(err, Error::NonceMismatch { .. }) {
                    warn!(chain, nonce, error = %err, "nonce rejected, cursor invalidated");
                    cursor.invalidate();
                }
                return Err(err);
            }
        };
        cursor.advance();
        drop(cursor);

        info!(
            chain,
            message_id = %message.id,
            tx_hash = %tx_hash,
            nonce,
            gas_price,
            "transaction broadcast"
        );

        self.pending.write().insert(
            tx_hash.clone(),
            PendingSubmission {
                chain: chain.to_string(),
                tx_hash: tx_hash.clone(),
                message_id: message.id.clone(),
                nonce,
                submitted_at: Utc::now(),
                confirmations: 0,
                required_confirmations: target.confirmations,
                status: SubmissionStatus::Pending,
            },
        );

        let watch = ConfirmationWatch {
            chain: chain.to_string(),
            tx_hash: tx_hash.clone(),
            message_id: message.id.clone(),
            required_confirmations: target.confirmations,
            poll_interval: self.poll_interval,
            timeout: self.confirmation_timeout,
            submitted_at: Instant::now(),
            client: client.clone(),
            handler: self.handler.clone(),
            nonces: self.nonces.clone(),
            pending: self.pending.clone(),
            outcomes: self.outcomes.clone(),
        };
        self.tracker.spawn(watch.run(self.token.child_token()));

        Ok(tx_hash)
    }

    fn sign_transaction(&self, request: TransactionRequest) -> Result<Vec<u8>> {
        let body = bcs::to_bytes(&request).map_err(|e| Error::Serialization(e.to_string()))?;
        let signature = self.signer.sign(&body)?;
        bcs::to_bytes(&SignedTransaction {
            request,
            from: self.address.clone(),
            signature,
        })
        .map_err(|e| Error::Serialization(e.to_string()))
    }
}
