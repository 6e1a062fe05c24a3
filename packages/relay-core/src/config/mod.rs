use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::chain_adapter::SUPPORTED_ADAPTERS;
use crate::Error;

pub const PRIVATE_KEY_ENV: &str = "RELAYER_PRIVATE_KEY";

/// A destination ledger the relay fans messages out to.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ChainTarget {
    pub id: String,
    pub name: String,
    #[serde(default = "default_adapter_type")]
    pub adapter_type: String,
    pub rpc_url: String,
    pub contract_address: String,
    /// Numeric network id signed into every transaction.
    #[serde(default)]
    pub network_id: u64,
    /// Gas-limit ceiling.
    pub gas_limit: u64,
    /// Gas-price ceiling in wei.
    pub gas_price: u64,
    pub confirmations: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// The ledger events are read from.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SourceConfig {
    #[serde(default = "default_adapter_type")]
    pub adapter_type: String,
    pub rpc_url: String,
    pub contract_address: String,
    /// Seconds between polls.
    #[serde(default = "default_source_poll")]
    pub poll_interval: u64,
    /// Start from this height instead of the current head.
    #[serde(default)]
    pub start_block: Option<u64>,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RelayerConfig {
    /// Hex ed25519 secret key; `RELAYER_PRIVATE_KEY` takes precedence.
    #[serde(default)]
    pub private_key: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_in_flight")]
    pub max_in_flight_per_chain: usize,
    /// Seconds between receipt polls.
    #[serde(default = "default_confirmation_poll")]
    pub confirmation_poll_interval: u64,
    /// Seconds before an unconfirmed transaction is resubmitted.
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout: u64,
    /// Seconds a suggested gas price stays fresh.
    #[serde(default = "default_gas_ttl")]
    pub gas_price_ttl: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
    /// Terminal messages kept queryable before the oldest are evicted.
    #[serde(default = "default_retain_terminal")]
    pub retain_terminal: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Seconds an open breaker waits before allowing a probe.
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MonitorConfig {
    #[serde(default = "default_event_buffer")]
    pub event_buffer_size: usize,
    #[serde(default = "default_health_interval")]
    pub health_check_interval: u64,
    #[serde(default = "default_report_interval")]
    pub metrics_report_interval: u64,
    /// Non-terminal messages above which the relay reports degraded.
    #[serde(default = "default_backlog_threshold")]
    pub queue_backlog_threshold: usize,
    #[serde(default = "default_failure_threshold")]
    pub failure_alert_threshold: u64,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    pub source: SourceConfig,
    pub chains: Vec<ChainTarget>,
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, Error> {
        let path = config_path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::parse(&config_str, path.extension().and_then(|e| e.to_str()))?;

        if let Ok(key) = std::env::var(PRIVATE_KEY_ENV) {
            if !key.is_empty() {
                config.relayer.private_key = key;
            }
        }

        config.validate()?;

        Ok(config)
    }

    /// Parses without validating. `extension` picks the format, JSON otherwise.
    pub fn parse(contents: &str, extension: Option<&str>) -> Result<Self, Error> {
        match extension {
            Some("toml") => toml::from_str(contents)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e))),
            _ => serde_json::from_str(contents)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e))),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.chains.is_empty() {
            return Err(Error::Config("At least one destination chain is required".to_string()));
        }

        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.id.as_str()) {
                return Err(Error::Config(format!("Duplicate chain ID: {}", chain.id)));
            }
            if !SUPPORTED_ADAPTERS.contains(&chain.adapter_type.as_str()) {
                return Err(Error::Config(format!("Invalid adapter type: {}", chain.adapter_type)));
            }
            if chain.confirmations == 0 {
                return Err(Error::Config(format!("Chain {} requires at least one confirmation", chain.id)));
            }
            if chain.gas_limit == 0 || chain.gas_price == 0 {
                return Err(Error::Config(format!("Chain {} gas ceilings must be greater than 0", chain.id)));
            }
        }

        if !SUPPORTED_ADAPTERS.contains(&self.source.adapter_type.as_str()) {
            return Err(Error::Config(format!("Invalid source adapter type: {}", self.source.adapter_type)));
        }
        if self.source.poll_interval == 0 {
            return Err(Error::Config("Source poll interval must be greater than 0".to_string()));
        }
        if self.source.max_block_range == 0 {
            return Err(Error::Config("Source max block range must be greater than 0".to_string()));
        }

        let key = self.relayer.private_key.trim_start_matches("0x");
        match hex::decode(key) {
            Ok(bytes) if bytes.len() == 32 => {}
            _ => return Err(Error::Config("Relayer private key must be 32 hex-encoded bytes".to_string())),
        }
        if self.relayer.queue_capacity == 0 || self.relayer.max_in_flight_per_chain == 0 {
            return Err(Error::Config("Relayer queue capacity and in-flight limit must be greater than 0".to_string()));
        }
        if self.relayer.confirmation_poll_interval == 0 || self.relayer.confirmation_timeout == 0 {
            return Err(Error::Config("Relayer confirmation intervals must be greater than 0".to_string()));
        }

        if self.retry.backoff_factor < 1.0 {
            return Err(Error::Config("Retry backoff factor must be at least 1.0".to_string()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::Config("Retry base delay must not exceed max delay".to_string()));
        }
        if self.circuit_breaker.max_failures == 0 {
            return Err(Error::Config("Circuit breaker max failures must be greater than 0".to_string()));
        }
        if self.monitor.event_buffer_size == 0 || self.monitor.health_check_interval == 0 {
            return Err(Error::Config("Monitor buffer size and health interval must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn get_chain(&self, chain_id: &str) -> Option<&ChainTarget> {
        self.chains.iter().find(|c| c.id == chain_id)
    }

    pub fn enabled_chains(&self) -> impl Iterator<Item = &ChainTarget> {
        self.chains.iter().filter(|c| c.enabled)
    }
}

impl SourceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}

impl RelayerConfig {
    pub fn confirmation_poll_interval(&self) -> Duration {
        Duration::from_secs(self.confirmation_poll_interval)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout)
    }

    pub fn gas_price_ttl(&self) -> Duration {
        Duration::from_secs(self.gas_price_ttl)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout)
    }
}

impl MonitorConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn metrics_report_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_report_interval)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            reset_timeout: default_reset_timeout(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: default_event_buffer(),
            health_check_interval: default_health_interval(),
            metrics_report_interval: default_report_interval(),
            queue_backlog_threshold: default_backlog_threshold(),
            failure_alert_threshold: default_failure_threshold(),
            webhook_url: None,
        }
    }
}

fn default_adapter_type() -> String {
    "evm".to_string()
}

fn default_true() -> bool {
    true
}

fn default_source_poll() -> u64 {
    5
}

fn default_max_block_range() -> u64 {
    1_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_queue_capacity() -> usize {
    1_000
}

fn default_in_flight() -> usize {
    1
}

fn default_confirmation_poll() -> u64 {
    15
}

fn default_confirmation_timeout() -> u64 {
    600
}

fn default_gas_ttl() -> u64 {
    300
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_retain_terminal() -> usize {
    10_000
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_failures() -> u32 {
    5
}

fn default_reset_timeout() -> u64 {
    300
}

fn default_event_buffer() -> usize {
    1_000
}

fn default_health_interval() -> u64 {
    30
}

fn default_report_interval() -> u64 {
    30
}

fn default_backlog_threshold() -> usize {
    500
}

fn default_failure_threshold() -> u64 {
    10
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TEST_KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    pub(crate) fn test_chain(id: &str, confirmations: u64) -> ChainTarget {
        ChainTarget {
            id: id.to_string(),
            name: id.to_uppercase(),
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

    pub(crate) fn test_config(chains: Vec<ChainTarget>) -> Config {
        Config {
            source: SourceConfig {
                adapter_type: "simulated".to_string(),
                rpc_url: "sim://hedera".to_string(),
                contract_address: "0x00000000000000000000000000000000000000aa".to_string(),
                poll_interval: 5,
                start_block: None,
                max_block_range: 100,
            },
            chains,
            relayer: RelayerConfig {
                private_key: TEST_KEY.to_string(),
                max_retries: 3,
                queue_capacity: 100,
                max_in_flight_per_chain: 1,
                confirmation_poll_interval: 1,
                confirmation_timeout: 60,
                gas_price_ttl: 300,
                shutdown_timeout: 5,
                retain_terminal: 100,
            },
            retry: RetryConfig {
                max_retries: 2,
                base_delay_ms: 10,
                max_delay_ms: 100,
                backoff_factor: 2.0,
            },
            circuit_breaker: CircuitBreakerConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }

    #[test]
    fn test_parse_json_with_defaults() {
        let json = format!(
            r#"{{
                "source": {{ "rpc_url": "http://localhost:7546", "contract_address": "0xaa" }},
                "chains": [{{
                    "id": "ethereum", "name": "Ethereum", "rpc_url": "http://localhost:8545",
                    "contract_address": "0x01", "gas_limit": 500000, "gas_price": 20000000000,
                    "confirmations": 12
                }}],
                "relayer": {{ "private_key": "{}" }}
            }}"#,
            TEST_KEY
        );
        let config = Config::parse(&json, Some("json")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.relayer.max_retries, 3);
        assert_eq!(config.relayer.queue_capacity, 1_000);
        assert_eq!(config.source.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.circuit_breaker.reset_timeout(), Duration::from_secs(300));
        assert!(config.chains[0].enabled);
        assert_eq!(config.chains[0].adapter_type, "evm");
    }

    #[test]
    fn test_parse_toml() {
        let toml = format!(
            r#"
            [source]
            rpc_url = "http://localhost:7546"
            contract_address = "0xaa"
            start_block = 42

            [relayer]
            private_key = "0x{}"
            max_retries = 5

            [[chains]]
            id = "base"
            name = "Base"
            rpc_url = "http://localhost:8546"
            contract_address = "0x02"
            gas_limit = 500000
            gas_price = 1000000000
            confirmations = 5
            enabled = false
            "#,
            TEST_KEY
        );
        let config = Config::parse(&toml, Some("toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.source.start_block, Some(42));
        assert_eq!(config.relayer.max_retries, 5);
        assert_eq!(config.enabled_chains().count(), 0);
    }

    #[test]
    fn test_validation_rejects_bad_key() {
        let mut config = test_config(vec![test_chain("ethereum", 12)]);
        config.relayer.private_key = "not-hex".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validation_rejects_duplicates_and_zero_confirmations() {
        let config = test_config(vec![test_chain("base", 5), test_chain("base", 5)]);
        assert!(config.validate().is_err());

        let config = test_config(vec![test_chain("base", 0)]);
        assert!(config.validate().is_err());

        let mut chain = test_chain("base", 5);
        chain.adapter_type = "sui".to_string();
        assert!(test_config(vec![chain]).validate().is_err());
    }

    #[test]
    fn test_get_chain() {
        let config = test_config(vec![test_chain("ethereum", 12), test_chain("base", 5)]);
        assert_eq!(config.get_chain("base").map(|c| c.confirmations), Some(5));
        assert!(config.get_chain("solana").is_none());
    }
}
