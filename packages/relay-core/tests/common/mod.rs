#![allow(dead_code)]

use relay_core::chain_adapter::{LedgerClient, LedgerClients, SimulatedLedger};
use relay_core::config::{
    ChainTarget, CircuitBreakerConfig, Config, MonitorConfig, RelayerConfig, RetryConfig, SourceConfig,
};
use relay_core::types::{LoanApprovalEvent, RepaymentEvent, SourceEvent};
use relay_core::Relayer;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const KEY: &str = "0202020202020202020202020202020202020202020202020202020202020202";
pub const SOURCE_CONTRACT: &str = "0x00000000000000000000000000000000000000aa";

pub fn chain(id: &str, confirmations: u64) -> ChainTarget {
    ChainTarget {
        id: id.to_string(),
        name: id.to_string(),
        adapter_type: "simulated".to_string(),
        rpc_url: format!("sim://{}", id),
        contract_address: "0x1234567890123456789012345678901234567890".to_string(),
        network_id: 1,
        gas_limit: 500_000,
        gas_price: 20_000_000_000,
        confirmations,
        enabled: true,
    }
}

pub fn config(chains: Vec<ChainTarget>) -> Config {
    Config {
        source: SourceConfig {
            adapter_type: "simulated".to_string(),
            rpc_url: "sim://source".to_string(),
            contract_address: SOURCE_CONTRACT.to_string(),
            poll_interval: 5,
            start_block: Some(1),
            max_block_range: 100,
        },
        chains,
        relayer: RelayerConfig {
            private_key: KEY.to_string(),
            max_retries: 3,
            queue_capacity: 100,
            max_in_flight_per_chain: 1,
            confirmation_poll_interval: 2,
            confirmation_timeout: 60,
            gas_price_ttl: 300,
            shutdown_timeout: 5,
            retain_terminal: 1_000,
        },
        retry: RetryConfig {
            max_retries: 2,
            base_delay_ms: 50,
            max_delay_ms: 500,
            backoff_factor: 2.0,
        },
        circuit_breaker: CircuitBreakerConfig::default(),
        monitor: MonitorConfig::default(),
    }
}

pub struct Harness {
    pub relayer: Relayer,
    pub source: Arc<SimulatedLedger>,
    pub ledgers: HashMap<String, Arc<SimulatedLedger>>,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let ledgers: HashMap<_, _> = config
            .chains
            .iter()
            .map(|c| (c.id.clone(), Arc::new(SimulatedLedger::new(&c.id).with_auto_mine())))
            .collect();
        let clients: LedgerClients = ledgers
            .iter()
            .map(|(id, ledger)| (id.clone(), ledger.clone() as Arc<dyn LedgerClient>))
            .collect();
        let source = Arc::new(SimulatedLedger::new("source"));
        let relayer = Relayer::with_clients(config, clients, source.clone()).expect("relayer builds");
        Self {
            relayer,
            source,
            ledgers,
        }
    }

    pub fn ledger(&self, chain: &str) -> &SimulatedLedger {
        &self.ledgers[chain]
    }

    /// Waits until no message is left non-terminal.
    pub async fn settle(&self) {
        for _ in 0..3_000 {
            if self.relayer.backlog() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("messages did not settle: {:#?}", self.relayer.messages());
    }
}

pub fn loan_approval(token_id: u128, amount: u128) -> SourceEvent {
    SourceEvent::LoanApproval(LoanApprovalEvent {
        token_id,
        borrower: "0x1111111111111111111111111111111111111111".to_string(),
        merchant: "0x2222222222222222222222222222222222222222".to_string(),
        amount,
        interest_rate: 500,
        duration: 90,
        borrower_did: "did:hedera:testnet:borrower".to_string(),
        merchant_did: "did:hedera:testnet:merchant".to_string(),
        timestamp: 1_700_000_000,
    })
}

pub fn repayment(token_id: u128) -> SourceEvent {
    SourceEvent::Repayment(RepaymentEvent {
        token_id,
        amount: 100,
        total_repaid: 100,
        payer: "0x1111111111111111111111111111111111111111".to_string(),
        timestamp: 1_700_000_100,
    })
}
