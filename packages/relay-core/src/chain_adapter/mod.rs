use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ChainTarget, Config, SourceConfig};
use crate::Error;

#[cfg(test)]
use mockall::automock;

pub mod evm;
pub mod simulated;

pub use evm::JsonRpcClient;
pub use simulated::SimulatedLedger;

/// Adapter types accepted in configuration.
pub const SUPPORTED_ADAPTERS: [&str; 2] = ["evm", "simulated"];

/// A raw log record as returned by the source ledger, before decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub transaction_hash: String,
    pub log_index: u64,
    /// Block timestamp in unix seconds, when the ledger reports one.
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub transaction_hash: String,
    pub block_number: u64,
    pub success: bool,
}

/// Operations the transaction manager needs from a destination ledger.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Adapter family identifier.
    fn chain_type(&self) -> &str;

    /// Next nonce the ledger expects from `address`, counting pending transactions.
    async fn pending_nonce(&self, address: &str) -> Result<u64, Error>;

    /// Current suggested gas price in wei.
    async fn suggest_gas_price(&self) -> Result<u64, Error>;

    /// Broadcasts a signed transaction and returns its hash.
    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, Error>;

    /// Receipt for `tx_hash`, or `None` while it is not yet included.
    async fn receipt(&self, tx_hash: &str) -> Result<Option<TxReceipt>, Error>;

    async fn block_number(&self) -> Result<u64, Error>;
}

/// Range query over the source ledger's logs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SourceLedger: Send + Sync {
    async fn head(&self) -> Result<u64, Error>;

    /// Logs emitted by `address` in the inclusive range `[from, to]`.
    async fn logs(&self, address: &str, from: u64, to: u64) -> Result<Vec<RawLog>, Error>;
}

/// Builds ledger clients from configuration, one per adapter family.
pub trait LedgerClientFactory: Send + Sync {
    fn create_client(&self, target: &ChainTarget) -> Result<Arc<dyn LedgerClient>, Error>;

    fn create_source(&self, source: &SourceConfig) -> Result<Arc<dyn SourceLedger>, Error>;
}

pub struct DefaultLedgerClientFactory;

impl LedgerClientFactory for DefaultLedgerClientFactory {
    fn create_client(&self, target: &ChainTarget) -> Result<Arc<dyn LedgerClient>, Error> {
        match target.adapter_type.as_str() {
            "evm" => Ok(Arc::new(JsonRpcClient::new(&target.id, &target.rpc_url)?)),
            "simulated" => Ok(Arc::new(SimulatedLedger::new(&target.id).with_auto_mine())),
            other => Err(Error::Config(format!("Unsupported adapter type: {}", other))),
        }
    }

    fn create_source(&self, source: &SourceConfig) -> Result<Arc<dyn SourceLedger>, Error> {
        match source.adapter_type.as_str() {
            "evm" => Ok(Arc::new(JsonRpcClient::new("source", &source.rpc_url)?)),
            "simulated" => Ok(Arc::new(SimulatedLedger::new("source"))),
            other => Err(Error::Config(format!("Unsupported adapter type: {}", other))),
        }
    }
}

/// Destination clients keyed by chain id.
pub type LedgerClients = HashMap<String, Arc<dyn LedgerClient>>;

/// One client per configured chain, enabled or not, so that a target can be
/// toggled without rebuilding the client set.
pub fn build_clients(config: &Config, factory: &dyn LedgerClientFactory) -> Result<LedgerClients, Error> {
    config
        .chains
        .iter()
        .map(|target| Ok((target.id.clone(), factory.create_client(target)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{test_chain, test_config};

    #[test]
    fn test_factory_builds_simulated_clients() {
        let config = test_config(vec![test_chain("ethereum", 12), test_chain("base", 5)]);
        let clients = build_clients(&config, &DefaultLedgerClientFactory).unwrap();
        assert_eq!(clients.len(), 2);
        assert_eq!(clients["base"].chain_type(), "simulated");
    }

    #[test]
    fn test_factory_rejects_unknown_adapter() {
        let mut target = test_chain("aptos", 1);
        target.adapter_type = "move".to_string();
        assert!(DefaultLedgerClientFactory.create_client(&target).is_err());
    }
}
