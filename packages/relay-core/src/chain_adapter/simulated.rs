use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{LedgerClient, RawLog, SourceLedger, TxReceipt};
use crate::tx_manager::SignedTransaction;
use crate::Error;

/// Failure the simulated ledger returns from its next broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Network,
    RateLimited,
    NonceTooLow,
    Rejected,
}

impl InjectedFailure {
    fn to_error(self, chain: &str) -> Error {
        match self {
            InjectedFailure::Network => Error::Network(format!("{}: connection reset", chain)),
            InjectedFailure::RateLimited => Error::RateLimited {
                message: format!("{}: too many requests", chain),
                retry_after: None,
            },
            InjectedFailure::NonceTooLow => Error::NonceMismatch {
                chain: chain.to_string(),
                message: "nonce too low".to_string(),
            },
            InjectedFailure::Rejected => Error::Validation(format!("{}: transaction rejected", chain)),
        }
    }
}

/// What happens to the next accepted transactions once broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InclusionMode {
    Succeed,
    Revert,
    /// Accepted, then evicted from the mempool without being mined.
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastRecord {
    pub tx_hash: String,
    pub from: String,
    pub nonce: u64,
    pub message_id: String,
}

#[derive(Default)]
struct LedgerState {
    head: u64,
    gas_price: u64,
    nonces: HashMap<String, u64>,
    receipts: HashMap<String, TxReceipt>,
    broadcasts: Vec<BroadcastRecord>,
    failures: VecDeque<InjectedFailure>,
    inclusions: VecDeque<InclusionMode>,
    logs: Vec<RawLog>,
}

/// In-memory ledger standing in for both the source and destination chains
/// in tests and in `simulate` runs.
pub struct SimulatedLedger {
    chain: String,
    state: Mutex<LedgerState>,
    auto_mine: AtomicBool,
    unreachable: AtomicBool,
}

impl SimulatedLedger {
    pub fn new(chain: &str) -> Self {
        Self {
            chain: chain.to_string(),
            state: Mutex::new(LedgerState {
                head: 1,
                gas_price: 1_000_000_000,
                ..Default::default()
            }),
            auto_mine: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
        }
    }

    /// Every block-height query mines one block.
    pub fn with_auto_mine(self) -> Self {
        self.auto_mine.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_gas_price(&self, price: u64) {
        self.state.lock().gas_price = price;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn mine(&self, blocks: u64) -> u64 {
        let mut state = self.state.lock();
        state.head += blocks;
        state.head
    }

    pub fn head_block(&self) -> u64 {
        self.state.lock().head
    }

    pub fn inject_broadcast_failures(&self, failure: InjectedFailure, count: usize) {
        let mut state = self.state.lock();
        state.failures.extend(std::iter::repeat(failure).take(count));
    }

    pub fn queue_inclusions(&self, mode: InclusionMode, count: usize) {
        let mut state = self.state.lock();
        state.inclusions.extend(std::iter::repeat(mode).take(count));
    }

    /// Overrides what the ledger believes the next nonce of `address` is.
    pub fn set_nonce(&self, address: &str, nonce: u64) {
        self.state.lock().nonces.insert(address.to_string(), nonce);
    }

    pub fn broadcasts(&self) -> Vec<BroadcastRecord> {
        self.state.lock().broadcasts.clone()
    }

    /// Mines a block carrying `log` and returns its height.
    pub fn emit_log(&self, mut log: RawLog) -> u64 {
        let mut state = self.state.lock();
        state.head += 1;
        log.block_number = state.head;
        state.logs.push(log);
        state.head
    }

    fn check_reachable(&self) -> Result<(), Error> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Network(format!("{}: ledger unreachable", self.chain)));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for SimulatedLedger {
    fn chain_type(&self) -> &str {
        "simulated"
    }

    async fn pending_nonce(&self, address: &str) -> Result<u64, Error> {
        self.check_reachable()?;
        Ok(self.state.lock().nonces.get(address).copied().unwrap_or(0))
    }

    async fn suggest_gas_price(&self) -> Result<u64, Error> {
        self.check_reachable()?;
        Ok(self.state.lock().gas_price)
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, Error> {
        self.check_reachable()?;
        let signed: SignedTransaction =
            bcs::from_bytes(raw_tx).map_err(|e| Error::Validation(format!("{}: malformed transaction: {}", self.chain, e)))?;

        let mut state = self.state.lock();
        if let Some(failure) = state.failures.pop_front() {
            return Err(failure.to_error(&self.chain));
        }

        let expected = state.nonces.get(&signed.from).copied().unwrap_or(0);
        if signed.request.nonce != expected {
            return Err(Error::NonceMismatch {
                chain: self.chain.clone(),
                message: format!("expected nonce {}, got {}", expected, signed.request.nonce),
            });
        }

        let tx_hash = format!("0x{}", hex::encode(Sha256::digest(raw_tx)));
        state.broadcasts.push(BroadcastRecord {
            tx_hash: tx_hash.clone(),
            from: signed.from.clone(),
            nonce: signed.request.nonce,
            message_id: signed.request.message_id.clone(),
        });

        let mode = state.inclusions.pop_front().unwrap_or(InclusionMode::Succeed);
        // a dropped transaction never consumes its nonce
        if mode != InclusionMode::Drop {
            state.nonces.insert(signed.from.clone(), expected + 1);
            state.head += 1;
            let receipt = TxReceipt {
                transaction_hash: tx_hash.clone(),
                block_number: state.head,
                success: mode == InclusionMode::Succeed,
            };
            state.receipts.insert(tx_hash.clone(), receipt);
        }

        Ok(tx_hash)
    }

    async fn receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, Error> {
        self.check_reachable()?;
        Ok(self.state.lock().receipts.get(tx_hash).cloned())
    }

    async fn block_number(&self) -> Result<u64, Error> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        if self.auto_mine.load(Ordering::SeqCst) {
            state.head += 1;
        }
        Ok(state.head)
    }
}

#[async_trait]
impl SourceLedger for SimulatedLedger {
    async fn head(&self) -> Result<u64, Error> {
        self.check_reachable()?;
        Ok(self.state.lock().head)
    }

    async fn logs(&self, address: &str, from: u64, to: u64) -> Result<Vec<RawLog>, Error> {
        self.check_reachable()?;
        Ok(self
            .state
            .lock()
            .logs
            .iter()
            .filter(|log| log.address.eq_ignore_ascii_case(address))
            .filter(|log| log.block_number >= from && log.block_number <= to)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx_manager::TransactionRequest;

    fn raw_tx(from: &str, nonce: u64) -> Vec<u8> {
        bcs::to_bytes(&SignedTransaction {
            request: TransactionRequest {
                network_id: 1,
                nonce,
                gas_price: 1,
                gas_limit: 100_000,
                to: "0x01".to_string(),
                data: vec![1],
                message_id: format!("msg-{}", nonce),
            },
            from: from.to_string(),
            signature: vec![0; 64],
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_enforces_nonce_order() {
        let ledger = SimulatedLedger::new("ethereum");
        let hash = ledger.broadcast(&raw_tx("0xabc", 0)).await.unwrap();
        assert!(ledger.receipt(&hash).await.unwrap().unwrap().success);

        let err = ledger.broadcast(&raw_tx("0xabc", 5)).await.unwrap_err();
        assert!(matches!(err, Error::NonceMismatch { .. }));
        assert_eq!(ledger.pending_nonce("0xabc").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_and_inclusion_modes() {
        let ledger = SimulatedLedger::new("base");
        ledger.inject_broadcast_failures(InjectedFailure::Network, 1);
        ledger.queue_inclusions(InclusionMode::Revert, 1);
        ledger.queue_inclusions(InclusionMode::Drop, 1);

        assert!(ledger.broadcast(&raw_tx("0xabc", 0)).await.unwrap_err().is_retryable());
        let reverted = ledger.broadcast(&raw_tx("0xabc", 0)).await.unwrap();
        let dropped = ledger.broadcast(&raw_tx("0xabc", 1)).await.unwrap();

        assert!(!ledger.receipt(&reverted).await.unwrap().unwrap().success);
        assert!(ledger.receipt(&dropped).await.unwrap().is_none());
        assert_eq!(ledger.pending_nonce("0xabc").await.unwrap(), 1);
        ledger.broadcast(&raw_tx("0xabc", 1)).await.unwrap();
        assert_eq!(ledger.pending_nonce("0xabc").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_logs_filter_by_range() {
        let ledger = SimulatedLedger::new("source");
        let log = RawLog {
            address: "0xAA".to_string(),
            topics: vec![],
            data: vec![],
            block_number: 0,
            transaction_hash: "0x01".to_string(),
            log_index: 0,
            timestamp: None,
        };
        let first = ledger.emit_log(log.clone());
        let second = ledger.emit_log(log);

        assert_eq!(ledger.logs("0xaa", first, first).await.unwrap().len(), 1);
        assert_eq!(ledger.logs("0xaa", first, second).await.unwrap().len(), 2);
        assert!(ledger.logs("0xbb", first, second).await.unwrap().is_empty());
    }
}
