pub mod chain_adapter;
pub mod config;
pub mod factory;
pub mod listener;
pub mod monitor;
pub mod relayer;
pub mod resilience;
pub mod tx_manager;
pub mod types;
pub mod verify;

use std::time::Duration;

pub use config::{ChainTarget, Config};
pub use relayer::Relayer;
pub use types::{MessageKind, MessageStatus, RelayMessage, RelayerMetrics, SourceEvent};

pub type Result<T> = std::result::Result<T, Error>;

/// How a failure should be treated by the retry framework and the message
/// state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth another attempt after a backoff.
    Transient,
    /// Retrying cannot help; the message goes straight to `Failed`.
    Permanent,
    /// The destination is currently isolated by its circuit breaker.
    BreakerOpen,
    /// The root context was cancelled.
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Nonce mismatch on {chain}: {message}")]
    NonceMismatch { chain: String, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Unsupported chain: {0}")]
    UnsupportedChain(String),

    #[error("Gas price {price} on {chain} exceeds ceiling {ceiling}")]
    GasPriceCeiling { chain: String, price: u64, ceiling: u64 },

    #[error("Gas limit {limit} on {chain} exceeds ceiling {ceiling}")]
    GasLimitCeiling { chain: String, limit: u64, ceiling: u64 },

    #[error("Transaction {tx_hash} reverted on {chain}")]
    Reverted { chain: String, tx_hash: String },

    #[error("Transaction {tx_hash} on {chain} not confirmed in time")]
    ConfirmationTimeout { chain: String, tx_hash: String },

    #[error("Circuit breaker is open for operation: {0}")]
    CircuitOpen(String),

    #[error("Operation failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Network(_)
            | Error::Timeout(_)
            | Error::RateLimited { .. }
            | Error::Rpc(_)
            | Error::NonceMismatch { .. }
            | Error::ConfirmationTimeout { .. } => ErrorClass::Transient,
            Error::Config(_)
            | Error::Validation(_)
            | Error::Authentication(_)
            | Error::UnsupportedChain(_)
            | Error::GasPriceCeiling { .. }
            | Error::GasLimitCeiling { .. }
            | Error::Reverted { .. }
            | Error::Serialization(_)
            | Error::NotFound(_) => ErrorClass::Permanent,
            // exhaustion carries the classification of what kept failing
            Error::RetriesExhausted { last, .. } => last.class(),
            Error::CircuitOpen(_) => ErrorClass::BreakerOpen,
            Error::Cancelled => ErrorClass::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Short label used for metric labels and alert metadata.
    pub fn label(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Network(_) => "network",
            Error::Timeout(_) => "timeout",
            Error::RateLimited { .. } => "rate_limited",
            Error::Rpc(_) => "rpc",
            Error::NonceMismatch { .. } => "nonce_mismatch",
            Error::Validation(_) => "validation",
            Error::Authentication(_) => "authentication",
            Error::UnsupportedChain(_) => "unsupported_chain",
            Error::GasPriceCeiling { .. } => "gas_price_ceiling",
            Error::GasLimitCeiling { .. } => "gas_limit_ceiling",
            Error::Reverted { .. } => "reverted",
            Error::ConfirmationTimeout { .. } => "confirmation_timeout",
            Error::CircuitOpen(_) => "circuit_open",
            Error::RetriesExhausted { .. } => "retries_exhausted",
            Error::Serialization(_) => "serialization",
            Error::NotFound(_) => "not_found",
            Error::Cancelled => "cancelled",
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.status().map(|s| s.as_u16()) == Some(429) {
            Error::RateLimited {
                message: e.to_string(),
                retry_after: None,
            }
        } else if e.is_decode() {
            Error::Serialization(e.to_string())
        } else {
            Error::Network(e.to_string())
        }
    }
}
