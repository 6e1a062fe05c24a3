use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a relayed message asks the destination contract to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    LoanApproval,
    LoanDisbursement,
    RepaymentConfirmation,
    LiquidityTransfer,
    CreditScoreUpdate,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::LoanApproval,
        MessageKind::LoanDisbursement,
        MessageKind::RepaymentConfirmation,
        MessageKind::LiquidityTransfer,
        MessageKind::CreditScoreUpdate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::LoanApproval => "LOAN_APPROVAL",
            MessageKind::LoanDisbursement => "LOAN_DISBURSEMENT",
            MessageKind::RepaymentConfirmation => "REPAYMENT_CONFIRMATION",
            MessageKind::LiquidityTransfer => "LIQUIDITY_TRANSFER",
            MessageKind::CreditScoreUpdate => "CREDIT_SCORE_UPDATE",
        }
    }

    /// Wire tag written as the first byte of every payload.
    pub fn tag(&self) -> u8 {
        match self {
            MessageKind::LoanApproval => 0,
            MessageKind::LoanDisbursement => 1,
            MessageKind::RepaymentConfirmation => 2,
            MessageKind::LiquidityTransfer => 3,
            MessageKind::CreditScoreUpdate => 4,
        }
    }

    /// Fixed gas estimate for the destination call.
    pub fn gas_limit(&self) -> u64 {
        match self {
            MessageKind::LoanApproval => 200_000,
            MessageKind::LoanDisbursement => 150_000,
            MessageKind::RepaymentConfirmation => 100_000,
            MessageKind::LiquidityTransfer => 180_000,
            MessageKind::CreditScoreUpdate => 120_000,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a [`RelayMessage`].
///
/// ```text
/// Pending -> Sent -> Confirmed
///    |        |
///    |        +----> Failed
///    |        |
///    +--------+----> Retrying -> Pending
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Sent,
    Confirmed,
    Failed,
    Retrying,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Sent => "SENT",
            MessageStatus::Confirmed => "CONFIRMED",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Retrying => "RETRYING",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Confirmed | MessageStatus::Failed)
    }

    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        match (*self, next) {
            (Pending, Sent) | (Pending, Retrying) | (Pending, Failed) => true,
            (Sent, Confirmed) | (Sent, Retrying) | (Sent, Failed) => true,
            (Retrying, Pending) | (Retrying, Failed) => true,
            (Pending, _) | (Sent, _) | (Retrying, _) => false,
            (Confirmed, _) | (Failed, _) => false,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The relay's unit of work, from creation to a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    /// Hex sha256 of `payload || signature`.
    pub id: String,
    pub kind: MessageKind,
    pub target_chain: String,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// `LoanCreated` on the source ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanApprovalEvent {
    pub token_id: u128,
    pub borrower: String,
    pub merchant: String,
    pub amount: u128,
    pub interest_rate: u128,
    pub duration: u128,
    pub borrower_did: String,
    pub merchant_did: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanStatusUpdatedEvent {
    pub token_id: u128,
    pub status: u8,
    pub updated_by: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanDisbursementEvent {
    pub token_id: u128,
    pub amount: u128,
    pub merchant: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepaymentEvent {
    pub token_id: u128,
    pub amount: u128,
    pub total_repaid: u128,
    pub payer: String,
    pub timestamp: u64,
}

/// Emitted in-process by the liquidity manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidityTransferEvent {
    pub from_pool: String,
    pub to_pool: String,
    pub token: String,
    pub amount: u128,
    pub reason: String,
    pub timestamp: u64,
}

/// Emitted in-process by the credit scoring engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditScoreUpdateEvent {
    pub user_did: String,
    pub new_score: u32,
    pub previous_score: u32,
    pub update_reason: String,
    pub timestamp: u64,
}

/// A decoded domain event, whether it came off the source ledger or from an
/// in-process producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceEvent {
    LoanApproval(LoanApprovalEvent),
    LoanStatusUpdated(LoanStatusUpdatedEvent),
    LoanDisbursement(LoanDisbursementEvent),
    Repayment(RepaymentEvent),
    LiquidityTransfer(LiquidityTransferEvent),
    CreditScoreUpdate(CreditScoreUpdateEvent),
}

impl SourceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SourceEvent::LoanApproval(_) => "LoanApproval",
            SourceEvent::LoanStatusUpdated(_) => "LoanStatusUpdated",
            SourceEvent::LoanDisbursement(_) => "LoanDisbursement",
            SourceEvent::Repayment(_) => "Repayment",
            SourceEvent::LiquidityTransfer(_) => "LiquidityTransfer",
            SourceEvent::CreditScoreUpdate(_) => "CreditScoreUpdate",
        }
    }

    /// The kind of message this event fans out into. An approved loan is
    /// relayed as a disbursement instruction to the liquidity pools.
    pub fn message_kind(&self) -> MessageKind {
        match self {
            SourceEvent::LoanApproval(_) => MessageKind::LoanDisbursement,
            SourceEvent::LoanStatusUpdated(_) => MessageKind::LoanApproval,
            SourceEvent::LoanDisbursement(_) => MessageKind::LoanDisbursement,
            SourceEvent::Repayment(_) => MessageKind::RepaymentConfirmation,
            SourceEvent::LiquidityTransfer(_) => MessageKind::LiquidityTransfer,
            SourceEvent::CreditScoreUpdate(_) => MessageKind::CreditScoreUpdate,
        }
    }
}

/// Aggregate counters exposed to the admin surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayerMetrics {
    pub messages_processed: u64,
    pub messages_sent: u64,
    pub messages_confirmed: u64,
    pub messages_failed: u64,
    pub average_latency_ms: u64,
    pub last_processed_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayerStatus {
    pub running: bool,
    pub address: String,
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use MessageStatus::*;
        assert!(Pending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Pending));
        assert!(!Retrying.can_transition_to(Sent));
        assert!(!Confirmed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Retrying));
        assert!(Confirmed.is_terminal() && Failed.is_terminal());
        assert!(!Retrying.is_terminal());
    }

    #[test]
    fn test_event_kind_mapping() {
        let event = SourceEvent::LoanApproval(LoanApprovalEvent {
            token_id: 1,
            borrower: "0x01".into(),
            merchant: "0x02".into(),
            amount: 1000,
            interest_rate: 1000,
            duration: 30,
            borrower_did: "did:hedera:test:1".into(),
            merchant_did: "did:hedera:test:2".into(),
            timestamp: 1_700_000_000,
        });
        assert_eq!(event.message_kind(), MessageKind::LoanDisbursement);
        assert_eq!(event.name(), "LoanApproval");
    }

    #[test]
    fn test_message_serializes_hex_payload() {
        let message = RelayMessage {
            id: "ab".into(),
            kind: MessageKind::CreditScoreUpdate,
            target_chain: "base".into(),
            payload: vec![0xde, 0xad],
            signature: vec![0x01],
            created_at: Utc::now(),
            retry_count: 0,
            status: MessageStatus::Pending,
            tx_hash: None,
            last_error: None,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["payload"], "0xdead");
        assert_eq!(json["kind"], "CREDIT_SCORE_UPDATE");
        assert!(json.get("tx_hash").is_none());

        let back: RelayMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.payload, message.payload);
    }
}
