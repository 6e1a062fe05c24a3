use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_core::chain_adapter::{LedgerClient, LedgerClients, SimulatedLedger};
use relay_core::config::{
    ChainTarget, CircuitBreakerConfig, Config, MonitorConfig, RelayerConfig, RetryConfig, SourceConfig,
};
use relay_core::listener::encode_event;
use relay_core::types::{
    CreditScoreUpdateEvent, LoanApprovalEvent, LoanDisbursementEvent, RepaymentEvent, SourceEvent,
};
use relay_core::{RelayMessage, Relayer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Development key used by `simulate` when no config file is given.
const SIMULATION_KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";
const SIMULATION_SOURCE_CONTRACT: &str = "0x00000000000000000000000000000000000000aa";

#[derive(Parser)]
#[command(author, version, about = "Cross-chain lending message relay", long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration file
    ValidateConfig {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// Run the relayer until Ctrl-C
    Start {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// Run the relayer against in-memory ledgers with synthetic loan events
    Simulate {
        /// Use this config, with every ledger replaced by a simulated one
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Loans to originate on the simulated source ledger
        #[arg(short, long, default_value_t = 3)]
        loans: u32,
        /// Seconds to wait for every message to settle
        #[arg(long, default_value_t = 120)]
        timeout: u64,
    },
}

#[derive(Tabled)]
struct ChainRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Adapter")]
    adapter: String,
    #[tabled(rename = "RPC")]
    rpc_url: String,
    #[tabled(rename = "Confirmations")]
    confirmations: u64,
    #[tabled(rename = "Gas limit")]
    gas_limit: u64,
    #[tabled(rename = "Gas price (wei)")]
    gas_price: u64,
    #[tabled(rename = "Enabled")]
    enabled: bool,
}

impl From<&ChainTarget> for ChainRow {
    fn from(chain: &ChainTarget) -> Self {
        Self {
            id: chain.id.clone(),
            name: chain.name.clone(),
            adapter: chain.adapter_type.clone(),
            rpc_url: chain.rpc_url.clone(),
            confirmations: chain.confirmations,
            gas_limit: chain.gas_limit,
            gas_price: chain.gas_price,
            enabled: chain.enabled,
        }
    }
}

#[derive(Tabled)]
struct MessageRow {
    #[tabled(rename = "Message")]
    id: String,
    #[tabled(rename = "Chain")]
    chain: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Retries")]
    retries: u32,
    #[tabled(rename = "Tx")]
    tx_hash: String,
}

impl From<&RelayMessage> for MessageRow {
    fn from(message: &RelayMessage) -> Self {
        Self {
            id: short(&message.id),
            chain: message.target_chain.clone(),
            kind: message.kind.to_string(),
            status: message.status.to_string(),
            retries: message.retry_count,
            tx_hash: message.tx_hash.as_deref().map(short).unwrap_or_default(),
        }
    }
}

fn short(hash: &str) -> String {
    hash.chars().take(14).collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::ValidateConfig { config } => validate_config(config),
        Commands::Start { config } => start(config).await,
        Commands::Simulate {
            config,
            loans,
            timeout,
        } => simulate(config, loans, Duration::from_secs(timeout)).await,
    }
}

fn validate_config(path: PathBuf) -> Result<()> {
    info!(path = %path.display(), "validating config");
    let config = Config::load(&path).with_context(|| format!("invalid config {}", path.display()))?;

    println!("Configuration is valid.");
    println!(
        "Source: {} ({}) contract {}, polling every {}s",
        config.source.rpc_url,
        config.source.adapter_type,
        config.source.contract_address,
        config.source.poll_interval
    );
    let rows: Vec<ChainRow> = config.chains.iter().map(ChainRow::from).collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    println!(
        "Relayer: max retries {}, queue capacity {}, {} in flight per chain, confirmation timeout {}s",
        config.relayer.max_retries,
        config.relayer.queue_capacity,
        config.relayer.max_in_flight_per_chain,
        config.relayer.confirmation_timeout
    );
    println!(
        "Circuit breaker: {} failures, {}s reset",
        config.circuit_breaker.max_failures, config.circuit_breaker.reset_timeout
    );
    Ok(())
}

async fn start(path: PathBuf) -> Result<()> {
    let config = Config::load(&path).with_context(|| format!("invalid config {}", path.display()))?;
    let relayer = Relayer::new(config)?;
    relayer.start().await.context("relayer failed to start")?;
    info!(address = %relayer.status().address, "relayer running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");
    relayer.stop().await?;

    let metrics = relayer.metrics();
    info!(
        processed = metrics.messages_processed,
        confirmed = metrics.messages_confirmed,
        failed = metrics.messages_failed,
        outstanding = relayer.backlog(),
        "final relayer metrics"
    );
    Ok(())
}

fn simulation_config() -> Config {
    let chain = |id: &str, name: &str, network_id: u64, confirmations: u64| ChainTarget {
        id: id.to_string(),
        name: name.to_string(),
        adapter_type: "simulated".to_string(),
        rpc_url: format!("sim://{}", id),
        contract_address: "0x1234567890123456789012345678901234567890".to_string(),
        network_id,
        gas_limit: 500_000,
        gas_price: 50_000_000_000,
        confirmations,
        enabled: true,
    };

    Config {
        source: SourceConfig {
            adapter_type: "simulated".to_string(),
            rpc_url: "sim://hedera".to_string(),
            contract_address: SIMULATION_SOURCE_CONTRACT.to_string(),
            poll_interval: 1,
            start_block: Some(1),
            max_block_range: 100,
        },
        chains: vec![chain("ethereum", "Ethereum", 1, 3), chain("base", "Base", 8453, 2)],
        relayer: RelayerConfig {
            private_key: SIMULATION_KEY.to_string(),
            max_retries: 3,
            queue_capacity: 1_000,
            max_in_flight_per_chain: 1,
            confirmation_poll_interval: 1,
            confirmation_timeout: 30,
            gas_price_ttl: 300,
            shutdown_timeout: 10,
            retain_terminal: 10_000,
        },
        retry: RetryConfig {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 2_000,
            backoff_factor: 2.0,
        },
        circuit_breaker: CircuitBreakerConfig::default(),
        monitor: MonitorConfig {
            health_check_interval: 5,
            metrics_report_interval: 5,
            ..Default::default()
        },
    }
}

fn synthetic_events(loans: u32, start: u64) -> Vec<SourceEvent> {
    let borrower = "0x1111111111111111111111111111111111111111".to_string();
    let merchant = "0x2222222222222222222222222222222222222222".to_string();
    let mut events = Vec::new();
    for i in 0..loans {
        let token_id = u128::from(i) + 1;
        let amount = 1_000 * token_id;
        let timestamp = start + u64::from(i) * 60;
        events.push(SourceEvent::LoanApproval(LoanApprovalEvent {
            token_id,
            borrower: borrower.clone(),
            merchant: merchant.clone(),
            amount,
            interest_rate: 500,
            duration: 90,
            borrower_did: format!("did:hedera:testnet:borrower-{}", token_id),
            merchant_did: "did:hedera:testnet:merchant".to_string(),
            timestamp,
        }));
        events.push(SourceEvent::LoanDisbursement(LoanDisbursementEvent {
            token_id,
            amount,
            merchant: merchant.clone(),
            timestamp: timestamp + 10,
        }));
        events.push(SourceEvent::Repayment(RepaymentEvent {
            token_id,
            amount: amount / 2,
            total_repaid: amount / 2,
            payer: borrower.clone(),
            timestamp: timestamp + 30,
        }));
    }
    events
}

async fn simulate(path: Option<PathBuf>, loans: u32, timeout: Duration) -> Result<()> {
    let config = match path {
        Some(path) => Config::load(&path).with_context(|| format!("invalid config {}", path.display()))?,
        None => simulation_config(),
    };

    let source = Arc::new(SimulatedLedger::new("source"));
    let mut clients = LedgerClients::new();
    for chain in &config.chains {
        clients.insert(
            chain.id.clone(),
            Arc::new(SimulatedLedger::new(&chain.id).with_auto_mine()) as Arc<dyn LedgerClient>,
        );
    }

    let contract = config.source.contract_address.clone();
    let relayer = Relayer::with_clients(config, clients, source.clone())?;
    relayer.start().await.context("relayer failed to start")?;

    let start = chrono::Utc::now().timestamp().max(0) as u64;
    for event in synthetic_events(loans, start) {
        match encode_event(&event, &contract)? {
            Some(log) => {
                source.emit_log(log);
            }
            None => warn!(event = event.name(), "event has no source log form, skipped"),
        }
    }
    // credit score updates come from an in-process producer, not the source ledger
    for i in 0..loans {
        relayer
            .submit_event(SourceEvent::CreditScoreUpdate(CreditScoreUpdateEvent {
                user_did: format!("did:hedera:testnet:borrower-{}", i + 1),
                new_score: 720 + i,
                previous_score: 700,
                update_reason: "on-time repayment".to_string(),
                timestamp: start,
            }))
            .await;
    }

    let deadline = tokio::time::Instant::now() + timeout;
    let mut interval = tokio::time::interval(Duration::from_millis(500));
    loop {
        interval.tick().await;
        let ingested = relayer.source_checkpoint().unwrap_or_default() >= source.head_block();
        if ingested && relayer.backlog() == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(outstanding = relayer.backlog(), "simulation timed out before every message settled");
            break;
        }
    }
    relayer.stop().await?;

    let rows: Vec<MessageRow> = relayer.messages().iter().map(MessageRow::from).collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
    println!("{}", serde_json::to_string_pretty(&relayer.metrics())?);
    println!("{}", serde_json::to_string_pretty(&relayer.health())?);
    Ok(())
}
